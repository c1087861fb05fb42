use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use models::Message;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::registry::{EndpointFactory, Feeder, Sink, Source};
use crate::uri::Endpoint;
use crate::Error;

/// `http://host:port[/path]` as a source runs a listener and delivers
/// each request as a message; as a sink it POSTs the message body as
/// JSON (`?method=` overrides the verb). Non-2xx responses are delivery
/// failures.
pub struct HttpFactory;

impl EndpointFactory for HttpFactory {
    fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        // Bind synchronously so a bad address surfaces as a startup
        // error rather than a running-route failure.
        let listener = std::net::TcpListener::bind(endpoint.authority()).map_err(|err| {
            Error::EndpointStart {
                uri: endpoint.uri.clone(),
                source: err.into(),
            }
        })?;
        listener.set_nonblocking(true).map_err(|err| Error::EndpointStart {
            uri: endpoint.uri.clone(),
            source: err.into(),
        })?;
        Ok(Box::new(HttpSource { listener }))
    }

    fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        let method = match endpoint.query("method") {
            None => reqwest::Method::POST,
            Some(name) => name.to_uppercase().parse().map_err(|_| {
                Error::config(format!("invalid http method '{name}' in '{}'", endpoint.uri))
            })?,
        };

        // Engine-level query parameters are not forwarded to the target.
        let mut url = endpoint.url.clone();
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != "method")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if retained.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(retained).finish();
        }

        Ok(Box::new(HttpSink {
            uri: endpoint.uri.clone(),
            url,
            method,
            client: reqwest::Client::new(),
        }))
    }
}

struct HttpSource {
    listener: std::net::TcpListener,
}

#[async_trait]
impl Source for HttpSource {
    async fn run(
        self: Box<Self>,
        feed: Feeder,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let listener = tokio::net::TcpListener::from_std(self.listener)
            .map_err(|err| Error::SourceFatal(err.into()))?;

        let app = axum::Router::new()
            .fallback(accept_request)
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(feed);

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|err| Error::SourceFatal(err.into()))
    }
}

/// Requests arrive from the network and cannot suspend on a full route
/// queue; they are counted as drops instead (503 tells the caller).
async fn accept_request(
    State(feed): State<Feeder>,
    request: axum::extract::Request,
) -> StatusCode {
    let (parts, body) = request.into_parts();

    let body = match axum::body::to_bytes(body, MAX_REQUEST_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => return StatusCode::PAYLOAD_TOO_LARGE,
    };

    let mut headers = models::Object::new();
    for (name, value) in &parts.headers {
        headers.insert(
            name.as_str().to_string(),
            json!(String::from_utf8_lossy(value.as_bytes())),
        );
    }

    let mut msg = feed.message();
    msg.set("method", json!(parts.method.as_str()));
    msg.set("path", json!(parts.uri.path()));
    msg.set("headers", serde_json::Value::Object(headers));
    match std::str::from_utf8(&body) {
        Ok(text) => msg.set("body", json!(text)),
        Err(_) => msg.set("body_base64", json!(base64::encode(&body))),
    };

    match feed.try_feed(msg) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_closed) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

const MAX_REQUEST_BYTES: usize = 1 << 20;

struct HttpSink {
    uri: String,
    url: url::Url,
    method: reqwest::Method,
    client: reqwest::Client,
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, msg: Message, cancel: &CancellationToken) -> Result<(), Error> {
        let request = self
            .client
            .request(self.method.clone(), self.url.clone())
            .json(&msg.body_value());

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(self.delivery_err(anyhow::anyhow!("cancelled")));
            }
            response = request.send() => {
                response.map_err(|err| self.delivery_err(err.into()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(self.delivery_err(anyhow::anyhow!("response status {status}")));
        }
        Ok(())
    }
}

impl HttpSink {
    fn delivery_err(&self, source: anyhow::Error) -> Error {
        Error::Delivery {
            uri: self.uri.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_sink_method_override_and_query_scrub() {
        let ep = Endpoint::resolve(
            "http://sink.example/ingest?method=put&tenant=a",
            &BTreeMap::new(),
        )
        .unwrap();
        let factory = HttpFactory;
        // Construction succeeds with the override; a bogus method fails.
        factory.sink(&ep).unwrap();

        // A method with invalid token characters is rejected.
        let bad = Endpoint::resolve(
            "http://sink.example/ingest?method=get%20lost",
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(factory.sink(&bad).unwrap_err().kind(), "config");
    }

    #[test]
    fn test_source_bind_failure_is_endpoint_start() {
        // TEST-NET-3 is never assigned locally, so the bind fails.
        let ep = Endpoint::resolve("http://203.0.113.1:9/hook", &BTreeMap::new()).unwrap();
        let err = HttpFactory.source(&ep).unwrap_err();
        assert_eq!(err.kind(), "endpoint_start");
    }
}
