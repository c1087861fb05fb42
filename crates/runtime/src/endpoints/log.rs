use async_trait::async_trait;
use models::Message;
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use crate::registry::{EndpointFactory, Sink};
use crate::uri::Endpoint;
use crate::Error;

/// `log://` writes the stringified body, one line per message, to
/// stdout, or to a file when a path is given. Sink only.
pub struct LogFactory;

impl EndpointFactory for LogFactory {
    fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        // `log://` is stdout; `log:///abs/path` and `log://rel/path`
        // both name a file.
        let path = format!("{}{}", endpoint.host, endpoint.path);
        let target = match path.trim_end_matches('/') {
            "" => LogTarget::Stdout,
            path => LogTarget::File(PathBuf::from(path)),
        };
        Ok(Box::new(LogSink {
            uri: endpoint.uri.clone(),
            target,
        }))
    }
}

enum LogTarget {
    Stdout,
    File(PathBuf),
}

struct LogSink {
    uri: String,
    target: LogTarget,
}

#[async_trait]
impl Sink for LogSink {
    async fn deliver(&self, msg: Message, _cancel: &CancellationToken) -> Result<(), Error> {
        let mut line = msg.body_string();
        line.push('\n');

        match &self.target {
            LogTarget::Stdout => {
                let stdout = std::io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(line.as_bytes())
                    .and_then(|()| handle.flush())
                    .map_err(|err| Error::Delivery {
                        uri: self.uri.clone(),
                        source: err.into(),
                    })
            }
            LogTarget::File(path) => {
                use tokio::io::AsyncWriteExt;
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|err| Error::Delivery {
                        uri: self.uri.clone(),
                        source: err.into(),
                    })?;
                file.write_all(line.as_bytes())
                    .await
                    .map_err(|err| Error::Delivery {
                        uri: self.uri.clone(),
                        source: err.into(),
                    })
            }
        }
    }
}
