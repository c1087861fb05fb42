use async_trait::async_trait;
use models::Message;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::registry::{EndpointFactory, Feeder, Sink, Source};
use crate::uri::Endpoint;
use crate::Error;

/// `mqtt://host[:port]/topic[?qos=N]` subscribes as a source and
/// publishes as a sink. QoS defaults to 0.
pub struct MqttFactory;

impl EndpointFactory for MqttFactory {
    fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        let conn = Connection::from_endpoint(endpoint, "src")?;
        Ok(Box::new(MqttSource { conn }))
    }

    fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        let conn = Connection::from_endpoint(endpoint, "snk")?;
        let (client, mut eventloop) = AsyncClient::new(conn.options(), 16);

        // The event loop must keep turning for keep-alives and acks;
        // it runs until stop() aborts it.
        let driver = tokio::spawn(async move {
            loop {
                if let Err(err) = eventloop.poll().await {
                    tracing::debug!(%err, "mqtt sink connection error; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        });

        Ok(Box::new(MqttSink {
            uri: endpoint.uri.clone(),
            topic: conn.topic,
            qos: conn.qos,
            client,
            driver,
        }))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection")
    }
}

struct Connection {
    host: String,
    port: u16,
    topic: String,
    qos: QoS,
    client_id: String,
}

impl Connection {
    fn from_endpoint(endpoint: &Endpoint, role: &str) -> Result<Self, Error> {
        if endpoint.host.is_empty() {
            return Err(Error::config(format!("'{}' is missing a broker host", endpoint.uri)));
        }
        let topic = endpoint.path.trim_start_matches('/').to_string();
        if topic.is_empty() {
            return Err(Error::config(format!("'{}' is missing a topic path", endpoint.uri)));
        }
        let qos = match endpoint.query("qos").unwrap_or("0") {
            "0" => QoS::AtMostOnce,
            "1" => QoS::AtLeastOnce,
            "2" => QoS::ExactlyOnce,
            other => {
                return Err(Error::config(format!("invalid qos '{other}' in '{}'", endpoint.uri)))
            }
        };
        Ok(Self {
            host: endpoint.host.clone(),
            port: endpoint.port.unwrap_or(1883),
            topic,
            qos,
            client_id: format!("weir-{role}-{}", std::process::id()),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options =
            MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options
    }
}

struct MqttSource {
    conn: Connection,
}

#[async_trait]
impl Source for MqttSource {
    async fn run(
        self: Box<Self>,
        feed: Feeder,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let (client, mut eventloop) = AsyncClient::new(self.conn.options(), 16);
        client
            .subscribe(self.conn.topic.clone(), self.conn.qos)
            .await
            .map_err(|err| Error::SourceFatal(anyhow::anyhow!("subscribing: {err}")))?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    _ = client.disconnect().await; // Best-effort.
                    return Ok(());
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let mut msg = feed.message();
                    msg.set("topic", json!(publish.topic));
                    msg.set("qos", json!(publish.qos as u8));
                    match std::str::from_utf8(&publish.payload) {
                        Ok(text) => msg.set("payload", json!(text)),
                        Err(_) => msg.set("payload", json!(base64::encode(&publish.payload))),
                    };
                    // Publishes arrive from the broker's push; a stalled
                    // event loop would miss keep-alives, so a full queue
                    // drops rather than blocks.
                    if feed.try_feed(msg).is_err() {
                        return Ok(());
                    }
                }
                Ok(_) => (),
                Err(err) => {
                    // The event loop reconnects on the next poll.
                    tracing::warn!(%err, "mqtt connection error; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(Duration::from_secs(1)) => (),
                    }
                }
            }
        }
    }
}

struct MqttSink {
    uri: String,
    topic: String,
    qos: QoS,
    client: AsyncClient,
    driver: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl Sink for MqttSink {
    async fn deliver(&self, msg: Message, _cancel: &CancellationToken) -> Result<(), Error> {
        self.client
            .publish(self.topic.clone(), self.qos, false, msg.body_bytes())
            .await
            .map_err(|err| Error::Delivery {
                uri: self.uri.clone(),
                source: anyhow::anyhow!("publishing: {err}"),
            })
    }

    async fn stop(&self) -> Result<(), Error> {
        _ = self.client.disconnect().await; // Best-effort.
        self.driver.abort();
        Ok(())
    }
}
