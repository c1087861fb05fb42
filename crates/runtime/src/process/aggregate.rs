use models::Message;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Aggregate buffers incoming messages into windows and emits one
/// collected message per window. A window closes when it reaches
/// `max_size` messages or when `timeout` has elapsed since its first
/// message, whichever comes first. With `group_by`, windows are kept
/// independently per value of that key. This is the only stateful
/// processor; its state belongs to the owning route and dies with it.
pub struct Aggregate {
    timeout: Duration,
    max_size: usize,
    group_by: Option<String>,
    windows: BTreeMap<String, Window>,
}

struct Window {
    items: Vec<Message>,
    opened: Instant,
    opened_at: String,
}

impl Aggregate {
    pub fn new(timeout: Duration, max_size: usize, group_by: Option<String>) -> Self {
        Self {
            timeout,
            max_size,
            group_by,
            windows: BTreeMap::new(),
        }
    }

    /// Buffer `msg`, returning the collected output if its window just
    /// reached `max_size`.
    pub fn push(&mut self, msg: Message) -> Option<Message> {
        let key = self.group_key(&msg);
        let window = self.windows.entry(key.clone()).or_insert_with(Window::open);
        window.items.push(msg);

        if window.items.len() >= self.max_size {
            let window = self.windows.remove(&key).expect("window was just inserted");
            return Some(window.collect());
        }
        None
    }

    /// The earliest instant at which some open window times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.windows
            .values()
            .map(|w| w.opened + self.timeout)
            .min()
    }

    /// Collect every window whose timeout has elapsed as of `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<Message> {
        let due: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| now >= w.opened + self.timeout)
            .map(|(k, _)| k.clone())
            .collect();
        due.into_iter()
            .map(|key| {
                self.windows
                    .remove(&key)
                    .expect("due keys are present")
                    .collect()
            })
            .collect()
    }

    /// Collect every non-empty window, due or not. Used for the single
    /// best-effort flush on source EOF and on cancellation.
    pub fn take_all(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.windows)
            .into_values()
            .map(Window::collect)
            .collect()
    }

    fn group_key(&self, msg: &Message) -> String {
        let Some(group_by) = &self.group_by else {
            return String::new();
        };
        match msg.get(group_by) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

impl Window {
    fn open() -> Self {
        Self {
            items: Vec::new(),
            opened: Instant::now(),
            opened_at: now_rfc3339(),
        }
    }

    /// The collected output message. It inherits the route and source of
    /// the window's first item, and `items` preserves arrival order.
    fn collect(self) -> Message {
        let first = self.items.first().expect("windows are never empty");
        let mut out = Message::new(first.route(), first.get_str("source").unwrap_or_default());
        out.set("count", json!(self.items.len()));
        out.set("window_start", json!(self.opened_at));
        out.set("window_end", json!(now_rfc3339()));
        out.set(
            "items",
            Value::Array(
                self.items
                    .into_iter()
                    .map(|m| Value::Object(m.into_object()))
                    .collect(),
            ),
        );
        out
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .expect("UTC instants always format as RFC-3339")
}
