use models::Message;

use crate::Error;

/// Transform renders a template into the message `body`, preserving all
/// other keys. A missing variable renders empty unless the placeholder
/// says `|required`, which raises a processing error.
impl std::fmt::Debug for Transform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transform")
    }
}

pub struct Transform {
    template: String,
}

impl Transform {
    pub fn new(template: &str) -> Result<Self, Error> {
        // Validate the template shape up front so malformed placeholders
        // surface at route start, not per message.
        expr::render(template, |_| Some(serde_json::Value::Null))
            .map_err(|err| Error::config(format!("invalid transform template: {err}")))?;
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn apply(&self, mut msg: Message) -> Result<Message, Error> {
        let rendered = expr::render(&self.template, |name| msg.get(name).cloned())
            .map_err(Error::processing)?;
        msg.set_body(rendered);
        Ok(msg)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_renders_body_and_preserves_keys() {
        let transform = Transform::new("Hi {{name}} ({{n}})").unwrap();

        let mut msg = Message::new("r", "test://");
        msg.set("name", json!("Ada"));
        msg.set("n", json!(3));

        let out = transform.apply(msg).unwrap();
        assert_eq!(out.get_str("body"), Some("Hi Ada (3)"));
        assert_eq!(out.get_str("name"), Some("Ada"));
        assert_eq!(out.get_f64("n"), Some(3.0));
        assert_eq!(out.route(), "r");
    }

    #[test]
    fn test_missing_renders_empty() {
        let transform = Transform::new("[{{absent}}]").unwrap();
        let out = transform.apply(Message::new("r", "test://")).unwrap();
        assert_eq!(out.get_str("body"), Some("[]"));
    }

    #[test]
    fn test_required_missing_is_processing_error() {
        let transform = Transform::new("{{absent|required}}").unwrap();
        let err = transform.apply(Message::new("r", "test://")).unwrap_err();
        assert_eq!(err.kind(), "processing");
    }

    #[test]
    fn test_malformed_template_is_config_error() {
        assert_eq!(Transform::new("{{oops").unwrap_err().kind(), "config");
    }
}
