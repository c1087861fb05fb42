use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Object is an alias for a JSON object.
pub type Object = serde_json::Map<String, Value>;

/// Key under which processors place the rendered message payload.
pub const KEY_BODY: &str = "body";
/// Key holding the RFC-3339 UTC instant at which the message was created.
pub const KEY_TIMESTAMP: &str = "timestamp";
/// Key holding the URI of the originating endpoint.
pub const KEY_SOURCE: &str = "source";
/// Key holding the name of the route the message flows through.
pub const KEY_ROUTE: &str = "route";

/// Message is the unit of flow through a route: a mapping from string keys
/// to JSON values. It always carries `timestamp`, `source`, and `route`.
/// Sources dictate all other keys; processors may add or override them.
///
/// Messages are immutable by contract between chain stages: a stage hands
/// an owned Message forward and never observes a later stage's mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(Object);

impl Message {
    /// Build a new Message stamped with the current UTC instant,
    /// the originating endpoint URI, and the route name.
    pub fn new(route: &str, source: &str) -> Self {
        let mut fields = Object::new();
        fields.insert(KEY_TIMESTAMP.to_string(), Value::String(now_rfc3339()));
        fields.insert(KEY_SOURCE.to_string(), Value::String(source.to_string()));
        fields.insert(KEY_ROUTE.to_string(), Value::String(route.to_string()));
        Self(fields)
    }

    pub fn from_object(fields: Object) -> Self {
        Self(fields)
    }

    pub fn into_object(self) -> Object {
        self.0
    }

    pub fn as_object(&self) -> &Object {
        &self.0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Insert or replace `key`, returning the prior value if any.
    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn route(&self) -> &str {
        self.get_str(KEY_ROUTE).unwrap_or_default()
    }

    pub fn body(&self) -> Option<&Value> {
        self.0.get(KEY_BODY)
    }

    pub fn set_body(&mut self, body: impl Into<String>) {
        self.0
            .insert(KEY_BODY.to_string(), Value::String(body.into()));
    }

    /// The stringified body delivered by line-oriented sinks:
    /// a string `body` verbatim, any other `body` as its JSON encoding,
    /// and the whole message as JSON when there is no `body` at all.
    pub fn body_string(&self) -> String {
        match self.body() {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => Value::Object(self.0.clone()).to_string(),
        }
    }

    /// The bytes delivered by byte-oriented sinks and `text`-format
    /// subprocess stdin: the stringified body as UTF-8.
    pub fn body_bytes(&self) -> Vec<u8> {
        self.body_string().into_bytes()
    }

    /// The JSON value delivered by structured sinks: the `body` value
    /// when one is set, otherwise the whole message object.
    pub fn body_value(&self) -> Value {
        match self.body() {
            Some(body) => body.clone(),
            None => Value::Object(self.0.clone()),
        }
    }
}

/// Encode opaque bytes for the JSON boundary.
pub(crate) fn bytes_to_value(bytes: &[u8]) -> Value {
    Value::String(base64::encode(bytes))
}

impl Message {
    /// Insert opaque bytes under `key`, base64-encoded.
    pub fn set_bytes(&mut self, key: impl Into<String>, bytes: &[u8]) {
        self.0.insert(key.into(), bytes_to_value(bytes));
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .expect("UTC instants always format as RFC-3339")
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_carries_routing_metadata() {
        let msg = Message::new("orders", "timer://1s");
        assert_eq!(msg.get_str(KEY_ROUTE), Some("orders"));
        assert_eq!(msg.get_str(KEY_SOURCE), Some("timer://1s"));
        // The timestamp round-trips as RFC-3339.
        let ts = msg.get_str(KEY_TIMESTAMP).unwrap();
        time::OffsetDateTime::parse(ts, &time::format_description::well_known::Rfc3339)
            .expect("timestamp parses");
    }

    #[test]
    fn test_body_stringification() {
        let mut msg = Message::new("r", "test://");
        assert!(msg.body_string().starts_with('{')); // Whole message as JSON.

        msg.set_body("plain text");
        assert_eq!(msg.body_string(), "plain text");

        msg.set(KEY_BODY, json!({"nested": 1}));
        assert_eq!(msg.body_string(), r#"{"nested":1}"#);
    }

    #[test]
    fn test_bytes_round_trip_base64() {
        let mut msg = Message::new("r", "file:///tmp");
        msg.set_bytes("content_bytes", b"\x00\x01abc");
        let encoded = msg.get_str("content_bytes").unwrap();
        assert_eq!(base64::decode(encoded).unwrap(), b"\x00\x01abc");
    }

    #[test]
    fn test_serde_is_transparent() {
        let mut msg = Message::new("r", "test://");
        msg.set("v", json!(42));

        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.is_object());
        assert_eq!(value["v"], json!(42));

        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }
}
