use std::time::Duration;

/// Error is the engine's failure taxonomy. Variants map one-to-one onto
/// the propagation policy: `Config` refuses engine start, `EndpointStart`
/// and `SourceFatal` fail a single route, and the remaining per-message
/// kinds drop one message and increment a counter while the route
/// continues. There are no built-in retries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("endpoint '{uri}' failed to start: {source}")]
    EndpointStart {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("external processor failed (exit status {status}): {stderr}")]
    ExternalProcess { status: i32, stderr: String },

    #[error("external processor timed out after {timeout:?}")]
    ExternalTimeout { timeout: Duration },

    #[error("delivery to '{uri}' failed: {source}")]
    Delivery {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("source failed: {0}")]
    SourceFatal(#[source] anyhow::Error),

    #[error("scheme '{0}' has no registered implementation")]
    NotImplemented(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn processing(msg: impl std::fmt::Display) -> Self {
        Error::Processing(msg.to_string())
    }

    /// Stable label of this error's kind, used in metrics and status.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::EndpointStart { .. } => "endpoint_start",
            Error::Processing(_) => "processing",
            Error::ExternalProcess { .. } => "external_process",
            Error::ExternalTimeout { .. } => "external_timeout",
            Error::Delivery { .. } => "delivery",
            Error::SourceFatal(_) => "source_fatal",
            Error::NotImplemented(_) => "not_implemented",
        }
    }

    /// Whether this error fails the whole route (as opposed to dropping
    /// a single message).
    pub fn is_fatal_for_route(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::EndpointStart { .. }
                | Error::SourceFatal(_)
                | Error::NotImplemented(_)
        )
    }
}
