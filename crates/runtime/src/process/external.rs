use models::{IoFormat, Message};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// Default bound on one subprocess invocation, overridable per processor
/// through `config.timeout` (seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace between SIGTERM and SIGKILL when an invocation is torn down.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Bound on the stderr tail attached to error reports.
const STDERR_TAIL: usize = 8192;

/// External delegates one message at a time to a subprocess. The
/// configured command is invoked with `--input=<tmp>` and `--output=<tmp>`
/// appended, the input message written as a single JSON document, and
/// every `config` entry exported as a `CONFIG_*` environment variable on
/// top of the engine's environment snapshot. The subprocess runs in its
/// own process group so teardown reaps descendants too.
pub struct External {
    command: String,
    args: Vec<String>,
    config: BTreeMap<String, Value>,
    input_format: IoFormat,
    output_format: IoFormat,
    timeout: Duration,
    env: Arc<BTreeMap<String, String>>,
}

impl External {
    pub fn new(
        command: &str,
        args: &[String],
        config: &BTreeMap<String, Value>,
        input_format: IoFormat,
        output_format: IoFormat,
        env: Arc<BTreeMap<String, String>>,
    ) -> Self {
        let timeout = config
            .get("timeout")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self {
            command: command.to_string(),
            args: args.to_vec(),
            config: config.clone(),
            input_format,
            output_format,
            timeout,
            env,
        }
    }

    /// Run one invocation. `Ok(None)` means the route was cancelled
    /// mid-invocation: the subprocess was torn down and the message is
    /// silently discarded.
    pub async fn apply(
        &self,
        msg: Message,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>, Error> {
        let dir = tempfile::tempdir().map_err(|err| {
            Error::processing(format!("creating invocation temp dir: {err}"))
        })?;
        let input_path = dir.path().join("input.json");
        let output_path = dir.path().join("output.json");

        let input_bytes = match self.input_format {
            IoFormat::Json => serde_json::to_vec(&msg)
                .map_err(|err| Error::processing(format!("encoding input message: {err}")))?,
            IoFormat::Text => msg.body_bytes(),
        };
        tokio::fs::write(&input_path, &input_bytes)
            .await
            .map_err(|err| Error::processing(format!("writing input file: {err}")))?;
        // Pre-create the output file so "empty file" and "never written"
        // are the same observable case.
        tokio::fs::write(&output_path, b"")
            .await
            .map_err(|err| Error::processing(format!("creating output file: {err}")))?;

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args)
            .arg(format!("--input={}", input_path.display()))
            .arg(format!("--output={}", output_path.display()))
            .env_clear()
            .envs(self.env.iter())
            .envs(self.config.iter().map(|(k, v)| (config_env_key(k), scalar_string(v))))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| Error::ExternalProcess {
            status: 127,
            stderr: format!("failed to spawn '{}': {err}", self.command),
        })?;
        let pid = child.id().unwrap_or_default() as i32;

        // Feed stdin (the body, in text mode) and capture both output
        // pipes concurrently with the wait.
        let mut stdin = child.stdin.take().expect("stdin is piped");
        let stdin_bytes = match self.input_format {
            IoFormat::Text => msg.body_bytes(),
            IoFormat::Json => Vec::new(),
        };
        let feed_stdin = tokio::spawn(async move {
            if !stdin_bytes.is_empty() {
                if let Err(err) = stdin.write_all(&stdin_bytes).await {
                    tracing::debug!(%err, "i/o error writing subprocess stdin");
                }
            }
            // Dropping stdin forwards EOF.
        });
        let stdout = read_pipe(child.stdout.take().expect("stdout is piped"));
        let stderr = read_pipe(child.stderr.take().expect("stderr is piped"));

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|err| Error::processing(format!("waiting for subprocess: {err}")))?
            }
            _ = tokio::time::sleep(self.timeout) => {
                terminate_group(&mut child, pid).await;
                return Err(Error::ExternalTimeout { timeout: self.timeout });
            }
            _ = cancel.cancelled() => {
                terminate_group(&mut child, pid).await;
                return Ok(None);
            }
        };
        _ = feed_stdin.await;
        let stdout = stdout.await.unwrap_or_default();
        let stderr = stderr.await.unwrap_or_default();

        if !status.success() {
            return Err(Error::ExternalProcess {
                status: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(tail(&stderr, STDERR_TAIL)).into_owned(),
            });
        }

        // Prefer the output file; fall back to stdout when it was never
        // written.
        let mut output = tokio::fs::read(&output_path)
            .await
            .map_err(|err| Error::processing(format!("reading output file: {err}")))?;
        if output.is_empty() {
            output = stdout;
        }

        match self.output_format {
            IoFormat::Json => {
                let fields: models::Object = serde_json::from_slice(&output).map_err(|err| {
                    Error::processing(format!("subprocess wrote invalid JSON output: {err}"))
                })?;
                let mut out = Message::from_object(fields);
                // Routing metadata survives even if the subprocess
                // dropped it.
                for key in [models::KEY_TIMESTAMP, models::KEY_SOURCE, models::KEY_ROUTE] {
                    if out.get(key).is_none() {
                        if let Some(v) = msg.get(key) {
                            out.set(key, v.clone());
                        }
                    }
                }
                Ok(Some(out))
            }
            IoFormat::Text => {
                let text = String::from_utf8_lossy(&output).into_owned();
                let mut out = msg;
                out.set_body(text.strip_suffix('\n').unwrap_or(&text));
                Ok(Some(out))
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn read_pipe<R>(mut pipe: R) -> tokio::task::JoinHandle<Vec<u8>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        _ = pipe.read_to_end(&mut buf).await;
        buf
    })
}

/// SIGTERM the subprocess's group, allow `KILL_GRACE` for a clean exit,
/// then SIGKILL and reap.
async fn terminate_group(child: &mut tokio::process::Child, pid: i32) {
    signal_group(pid, libc::SIGTERM);

    let graceful = tokio::time::timeout(KILL_GRACE, child.wait()).await;
    if graceful.is_err() {
        signal_group(pid, libc::SIGKILL);
        _ = child.wait().await;
    }
}

fn signal_group(pid: i32, signal: libc::c_int) {
    if pid <= 0 {
        return;
    }
    unsafe {
        libc::killpg(pid, signal);
    }
}

/// Map a config key onto its exported environment variable name.
fn config_env_key(key: &str) -> String {
    let mapped: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("CONFIG_{mapped}")
}

/// Stringify a config value for the environment: scalars bare, compound
/// values as compact JSON.
fn scalar_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        compound => compound.to_string(),
    }
}

fn tail(bytes: &[u8], cap: usize) -> &[u8] {
    &bytes[bytes.len().saturating_sub(cap)..]
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_env_key_mapping() {
        assert_eq!(config_env_key("timeout"), "CONFIG_TIMEOUT");
        assert_eq!(config_env_key("model_path"), "CONFIG_MODEL_PATH");
        assert_eq!(config_env_key("api-key"), "CONFIG_API_KEY");
        assert_eq!(config_env_key("nested.field"), "CONFIG_NESTED_FIELD");
    }

    #[test]
    fn test_scalar_stringification() {
        assert_eq!(scalar_string(&json!("x")), "x");
        assert_eq!(scalar_string(&json!(0.8)), "0.8");
        assert_eq!(scalar_string(&json!(10)), "10");
        assert_eq!(scalar_string(&json!(true)), "true");
        assert_eq!(scalar_string(&json!([1, 2])), "[1,2]");
        assert_eq!(scalar_string(&Value::Null), "");
    }

    #[test]
    fn test_timeout_from_config() {
        let env = Arc::new(BTreeMap::new());
        let config: BTreeMap<String, Value> =
            [("timeout".to_string(), json!(1))].into_iter().collect();
        let ext = External::new(
            "true",
            &[],
            &config,
            IoFormat::Json,
            IoFormat::Json,
            env.clone(),
        );
        assert_eq!(ext.timeout(), Duration::from_secs(1));

        let ext = External::new(
            "true",
            &[],
            &BTreeMap::new(),
            IoFormat::Json,
            IoFormat::Json,
            env,
        );
        assert_eq!(ext.timeout(), DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_json_round_trip_through_shell() {
        // A subprocess that copies its input file to its output file is
        // the identity processor.
        let env = Arc::new(BTreeMap::new());
        let args = vec![
            "-c".to_string(),
            r#"in="${1#--input=}"; out="${2#--output=}"; cp "$in" "$out""#.to_string(),
            "sh".to_string(),
        ];
        let ext = External::new("/bin/sh", &args, &BTreeMap::new(), IoFormat::Json, IoFormat::Json, env);

        let mut msg = Message::new("r", "test://");
        msg.set("n", json!(21));

        let out = ext
            .apply(msg.clone(), &CancellationToken::new())
            .await
            .unwrap()
            .expect("not cancelled");
        assert_eq!(out, msg);
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        let env = Arc::new(BTreeMap::new());
        let args = vec![
            "-c".to_string(),
            "echo boom >&2; exit 3".to_string(),
            "sh".to_string(),
        ];
        let ext = External::new("/bin/sh", &args, &BTreeMap::new(), IoFormat::Json, IoFormat::Json, env);

        let err = ext
            .apply(Message::new("r", "test://"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::ExternalProcess { status, stderr } => {
                assert_eq!(status, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_external_process_error() {
        let env = Arc::new(BTreeMap::new());
        let ext = External::new(
            "/does/not/exist",
            &[],
            &BTreeMap::new(),
            IoFormat::Json,
            IoFormat::Json,
            env,
        );
        let err = ext
            .apply(Message::new("r", "test://"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "external_process");
    }

    #[tokio::test]
    async fn test_text_mode_pipes_body() {
        let env = Arc::new(BTreeMap::new());
        let args = vec!["-c".to_string(), "tr a-z A-Z".to_string(), "sh".to_string()];
        let ext = External::new("/bin/sh", &args, &BTreeMap::new(), IoFormat::Text, IoFormat::Text, env);

        let mut msg = Message::new("r", "test://");
        msg.set_body("hello");
        msg.set("keep", json!(1));

        let out = ext
            .apply(msg, &CancellationToken::new())
            .await
            .unwrap()
            .expect("not cancelled");
        assert_eq!(out.get_str("body"), Some("HELLO"));
        assert_eq!(out.get_f64("keep"), Some(1.0));
    }

    #[tokio::test]
    async fn test_config_reaches_subprocess_environment() {
        let env = Arc::new(BTreeMap::new());
        let config: BTreeMap<String, Value> =
            [("threshold".to_string(), json!(0.8))].into_iter().collect();
        let args = vec![
            "-c".to_string(),
            r#"out="${2#--output=}"; printf '{"seen":"%s"}' "$CONFIG_THRESHOLD" > "$out""#
                .to_string(),
            "sh".to_string(),
        ];
        let ext = External::new("/bin/sh", &args, &config, IoFormat::Json, IoFormat::Json, env);

        let out = ext
            .apply(Message::new("r", "test://"), &CancellationToken::new())
            .await
            .unwrap()
            .expect("not cancelled");
        assert_eq!(out.get_str("seen"), Some("0.8"));
    }
}
