use async_trait::async_trait;
use models::Message;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::metrics::Scope;
use crate::uri::Endpoint;
use crate::Error;

/// Role of an endpoint within a route. Some schemes implement both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Sink,
}

/// Returned by `Feeder::feed` when the route is shutting down and its
/// queue no longer accepts input. Sources should return cleanly.
#[derive(Debug)]
pub struct Closed;

/// Feeder is a source driver's handle into its route: a bounded queue
/// plus the route identity used to stamp new messages.
#[derive(Clone)]
pub struct Feeder {
    tx: tokio::sync::mpsc::Sender<Message>,
    route: Arc<str>,
    source_uri: Arc<str>,
    metrics: Scope,
}

impl Feeder {
    pub(crate) fn new(
        tx: tokio::sync::mpsc::Sender<Message>,
        route: &str,
        source_uri: &str,
        metrics: Scope,
    ) -> Self {
        Self {
            tx,
            route: route.into(),
            source_uri: source_uri.into(),
            metrics,
        }
    }

    /// A fresh message stamped with this route's name and source URI.
    pub fn message(&self) -> Message {
        Message::new(&self.route, &self.source_uri)
    }

    /// Enqueue a message, suspending while the queue is full. This is the
    /// backpressure point for sources that can block.
    pub async fn feed(&self, msg: Message) -> Result<(), Closed> {
        self.record_depth();
        self.tx.send(msg).await.map_err(|_| Closed)
    }

    /// Enqueue without blocking, for sources pushed from network
    /// callbacks. A full queue drops the message and counts the drop
    /// rather than growing memory.
    pub fn try_feed(&self, msg: Message) -> Result<(), Closed> {
        self.record_depth();
        use tokio::sync::mpsc::error::TrySendError;
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.metrics.drops(1);
                tracing::debug!(route = %self.route, "queue full; dropping pushed message");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Closed),
        }
    }

    fn record_depth(&self) {
        let depth = self.tx.max_capacity() - self.tx.capacity();
        self.metrics.queue_depth(depth);
    }
}

/// Source is a long-lived producer of messages into a route.
///
/// `run` owns the driver until clean EOF (`Ok`) or an unrecoverable
/// error (`Err`, which fails the route). Drivers must honor `cancel`
/// promptly: check it between I/O operations and return `Ok(())` once it
/// fires. Stopping a source is exactly cancelling it and awaiting `run`.
#[async_trait]
pub trait Source: Send {
    async fn run(self: Box<Self>, feed: Feeder, cancel: CancellationToken) -> Result<(), Error>;
}

impl std::fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Source")
    }
}

/// Sink accepts finalized messages for delivery.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, msg: Message, cancel: &CancellationToken) -> Result<(), Error>;

    /// Release driver-owned resources. Called once, after the last
    /// delivery.
    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Sink")
    }
}

/// EndpointFactory builds drivers for one URI scheme. The default
/// methods refuse both roles, so a factory supporting only one role
/// implements just that method; registering the unit struct as-is gives
/// the stub behavior required for optional schemes.
pub trait EndpointFactory: Send + Sync {
    fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        Err(Error::NotImplemented(endpoint.scheme.clone()))
    }

    fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        Err(Error::NotImplemented(endpoint.scheme.clone()))
    }
}

/// Registry maps URI schemes to their endpoint factories. It is
/// read-only once the engine starts; embedders register additional
/// schemes (or replace stubs) before constructing the engine.
impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Registry")
    }
}

pub struct Registry {
    factories: BTreeMap<String, Arc<dyn EndpointFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with every built-in scheme: timer, file, log, http,
    /// mqtt, and stubs for the optional grpc / rtsp / email / webhook.
    pub fn with_builtins() -> Self {
        use crate::endpoints;

        let mut registry = Self::new();
        registry.register("timer", Arc::new(endpoints::timer::TimerFactory));
        registry.register("file", Arc::new(endpoints::file::FileFactory));
        registry.register("log", Arc::new(endpoints::log::LogFactory));
        registry.register("http", Arc::new(endpoints::http::HttpFactory));
        registry.register("mqtt", Arc::new(endpoints::mqtt::MqttFactory));
        for scheme in ["grpc", "rtsp", "email", "webhook"] {
            registry.register(scheme, Arc::new(endpoints::stub::StubFactory));
        }
        registry
    }

    /// Register `factory` for `scheme`, replacing any prior registration.
    pub fn register(&mut self, scheme: &str, factory: Arc<dyn EndpointFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.factories.contains_key(scheme)
    }

    pub fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        self.lookup(endpoint)?.source(endpoint)
    }

    pub fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        self.lookup(endpoint)?.sink(endpoint)
    }

    fn lookup(&self, endpoint: &Endpoint) -> Result<&Arc<dyn EndpointFactory>, Error> {
        self.factories.get(&endpoint.scheme).ok_or_else(|| {
            Error::config(format!(
                "unknown scheme '{}' in '{}'",
                endpoint.scheme, endpoint.uri
            ))
        })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unknown_scheme_is_config_error() {
        let registry = Registry::with_builtins();
        let ep = Endpoint::resolve("carrier-pigeon://coop", &BTreeMap::new()).unwrap();
        let err = registry.sink(&ep).unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("carrier-pigeon"));
    }

    #[test]
    fn test_stub_schemes_refuse_both_roles() {
        let registry = Registry::with_builtins();
        for scheme in ["grpc", "rtsp", "email", "webhook"] {
            let ep =
                Endpoint::resolve(&format!("{scheme}://host/x"), &BTreeMap::new()).unwrap();
            assert_eq!(registry.source(&ep).unwrap_err().kind(), "not_implemented");
            assert_eq!(registry.sink(&ep).unwrap_err().kind(), "not_implemented");
        }
    }

    #[test]
    fn test_registration_replaces_stub() {
        struct Custom;
        impl EndpointFactory for Custom {}

        let mut registry = Registry::with_builtins();
        registry.register("rtsp", Arc::new(Custom));
        assert!(registry.contains("rtsp"));
    }
}
