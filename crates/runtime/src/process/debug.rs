use models::Message;

/// Debug logs each message verbatim on the engine's structured log
/// stream and forwards it unchanged.
pub struct Debug {
    prefix: String,
}

impl Debug {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    pub fn apply(&self, msg: Message) -> Message {
        let encoded = serde_json::to_string(&msg).expect("messages always serialize");
        tracing::info!(prefix = %self.prefix, message = %encoded, "debug");
        msg
    }
}
