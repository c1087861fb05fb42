use async_trait::async_trait;
use models::Message;
use notify::Watcher;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

use crate::registry::{EndpointFactory, Feeder, Sink, Source};
use crate::uri::Endpoint;
use crate::Error;

/// `file://<glob>` as a source emits one message per matching file:
/// first a snapshot of files matching at start, then newly-created
/// matches observed through an OS-level watch. As a sink it writes the
/// message body to the given path; a trailing `/` appends a generated
/// filename.
pub struct FileFactory;

impl EndpointFactory for FileFactory {
    fn source(&self, endpoint: &Endpoint) -> Result<Box<dyn Source>, Error> {
        let pattern_text = endpoint_path(endpoint);
        let pattern = glob::Pattern::new(&pattern_text)
            .map_err(|err| Error::config(format!("invalid glob '{pattern_text}': {err}")))?;
        Ok(Box::new(FileSource {
            pattern_text,
            pattern,
        }))
    }

    fn sink(&self, endpoint: &Endpoint) -> Result<Box<dyn Sink>, Error> {
        let path = endpoint_path(endpoint);
        Ok(Box::new(FileSink {
            uri: endpoint.uri.clone(),
            is_dir: path.ends_with('/'),
            path: PathBuf::from(path),
            seq: AtomicU64::new(0),
        }))
    }
}

/// `file:///abs/*.json` carries the path in the URL path; a relative
/// `file://watch/*.json` splits across host and path. Join them back.
fn endpoint_path(endpoint: &Endpoint) -> String {
    format!("{}{}", endpoint.host, endpoint.path)
}

struct FileSource {
    pattern_text: String,
    pattern: glob::Pattern,
}

#[async_trait]
impl Source for FileSource {
    async fn run(
        self: Box<Self>,
        feed: Feeder,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        // Install the watch before the snapshot, so files created while
        // snapshotting are not missed (a file may then be seen twice,
        // which downstream processors can deduplicate if they care).
        let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| {
                _ = fs_tx.send(event);
            },
        )
        .map_err(|err| Error::SourceFatal(anyhow::anyhow!("creating watcher: {err}")))?;

        let root = watch_root(&self.pattern_text);
        watcher
            .watch(&root, notify::RecursiveMode::Recursive)
            .map_err(|err| {
                Error::SourceFatal(anyhow::anyhow!("watching {}: {err}", root.display()))
            })?;

        // Initial snapshot of currently-matching files.
        let matches = glob::glob(&self.pattern_text)
            .map_err(|err| Error::SourceFatal(anyhow::anyhow!("globbing: {err}")))?;
        for entry in matches {
            let path = match entry {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!(%err, "skipping unreadable glob entry");
                    continue;
                }
            };
            if self.emit(&feed, &path).await.is_err() {
                return Ok(());
            }
        }

        // Watch for newly-created matching files.
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = fs_rx.recv() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(err)) => {
                    tracing::warn!(%err, "file watch error");
                    continue;
                }
                // The watcher owns the sender; it lives until this loop
                // returns, so a closed channel means the handle died.
                None => {
                    return Err(Error::SourceFatal(anyhow::anyhow!(
                        "file watcher handle closed"
                    )))
                }
            };

            if !matches!(event.kind, notify::EventKind::Create(_)) {
                continue;
            }
            for path in &event.paths {
                if !self.pattern.matches_path(path) {
                    continue;
                }
                if self.emit(&feed, path).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

impl FileSource {
    async fn emit(&self, feed: &Feeder, path: &Path) -> Result<(), crate::registry::Closed> {
        let (size, content) = match read_file(path).await {
            Ok(ok) => ok,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "failed to read matched file");
                return Ok(());
            }
        };

        let mut msg = feed.message();
        msg.set("path", json!(path.display().to_string()));
        msg.set("size", json!(size));
        msg.set_bytes("content_bytes", &content);
        if let Ok(text) = std::str::from_utf8(&content) {
            msg.set("content_utf8", json!(text));
        }
        feed.feed(msg).await
    }
}

async fn read_file(path: &Path) -> std::io::Result<(u64, Vec<u8>)> {
    let meta = tokio::fs::metadata(path).await?;
    let content = tokio::fs::read(path).await?;
    Ok((meta.len(), content))
}

/// The deepest directory prefix of `pattern` without glob metacharacters,
/// which is what the OS watch is installed on.
fn watch_root(pattern: &str) -> PathBuf {
    let path = Path::new(pattern);
    let mut root = PathBuf::new();
    for component in path.components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains(['*', '?', '[']) {
            break;
        }
        root.push(component);
    }
    if root.as_os_str().is_empty() {
        root.push(".");
    }
    if root == path {
        // A literal path names one file; watch its parent.
        root.pop();
    }
    root
}

struct FileSink {
    uri: String,
    path: PathBuf,
    is_dir: bool,
    seq: AtomicU64,
}

#[async_trait]
impl Sink for FileSink {
    async fn deliver(&self, msg: Message, _cancel: &CancellationToken) -> Result<(), Error> {
        let path = if self.is_dir {
            self.path.join(self.generated_name())
        } else {
            self.path.clone()
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.delivery_err(err))?;
        }
        tokio::fs::write(&path, msg.body_bytes())
            .await
            .map_err(|err| self.delivery_err(err))
    }
}

impl FileSink {
    fn generated_name(&self) -> String {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("msg-{nanos}-{seq}.json")
    }

    fn delivery_err(&self, err: std::io::Error) -> Error {
        Error::Delivery {
            uri: self.uri.clone(),
            source: err.into(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_watch_root_strips_glob_components() {
        assert_eq!(watch_root("/data/in/*.json"), PathBuf::from("/data/in"));
        assert_eq!(watch_root("/data/**/x.csv"), PathBuf::from("/data"));
        assert_eq!(watch_root("*.json"), PathBuf::from("."));
        assert_eq!(watch_root("/data/in/exact.json"), PathBuf::from("/data/in"));
    }

    #[tokio::test]
    async fn test_sink_writes_body_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/out.txt");
        let ep = Endpoint::resolve(
            &format!("file://{}", target.display()),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();
        let sink = FileFactory.sink(&ep).unwrap();

        let mut msg = Message::new("r", "test://");
        msg.set_body("payload");
        sink.deliver(msg, &CancellationToken::new()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "payload");
    }

    #[tokio::test]
    async fn test_sink_directory_mode_generates_names() {
        let dir = tempfile::tempdir().unwrap();
        let ep = Endpoint::resolve(
            &format!("file://{}/", dir.path().display()),
            &std::collections::BTreeMap::new(),
        )
        .unwrap();
        let sink = FileFactory.sink(&ep).unwrap();

        let cancel = CancellationToken::new();
        for body in ["a", "b"] {
            let mut msg = Message::new("r", "test://");
            msg.set_body(body);
            sink.deliver(msg, &cancel).await.unwrap();
        }

        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 2);
    }
}
