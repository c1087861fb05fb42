use expr::Predicate;
use models::Message;

use crate::Error;

/// Filter evaluates a boolean predicate against each message. Pass
/// forwards unchanged; fail drops silently. Evaluation errors (missing
/// variable, incompatible comparison) are processing errors and also
/// drop the message.
impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Filter")
    }
}

pub struct Filter {
    predicate: Predicate,
}

impl Filter {
    pub fn new(predicate: &str) -> Result<Self, Error> {
        let predicate = Predicate::parse(predicate)
            .map_err(|err| Error::config(format!("invalid filter predicate: {err}")))?;
        Ok(Self { predicate })
    }

    pub fn apply(&self, msg: Message) -> Result<Option<Message>, Error> {
        let pass = self
            .predicate
            .eval(|name| msg.get(name).cloned())
            .map_err(Error::processing)?;
        Ok(pass.then_some(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn message(fields: serde_json::Value) -> Message {
        let mut msg = Message::new("r", "test://");
        for (k, v) in fields.as_object().unwrap() {
            msg.set(k.clone(), v.clone());
        }
        msg
    }

    #[test]
    fn test_pass_and_drop() {
        let filter = Filter::new("{{v}} > 10").unwrap();

        let passed = filter.apply(message(json!({"v": 15}))).unwrap();
        assert_eq!(passed.unwrap().get_f64("v"), Some(15.0));

        let dropped = filter.apply(message(json!({"v": 5}))).unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn test_eval_error_is_processing() {
        let filter = Filter::new("{{v}} > 10").unwrap();
        let err = filter.apply(message(json!({"other": 1}))).unwrap_err();
        assert_eq!(err.kind(), "processing");
    }

    #[test]
    fn test_parse_error_is_config() {
        assert_eq!(Filter::new("{{v}} >").unwrap_err().kind(), "config");
    }
}
