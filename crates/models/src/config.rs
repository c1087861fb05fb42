use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

/// ConfigDoc is the parsed configuration document consumed by the engine.
/// Loading and schema validation of the on-disk YAML is the front-end's
/// responsibility; the engine receives this already-deserialized form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDoc {
    /// Routes to run.
    #[serde(default)]
    pub routes: Vec<RouteDef>,
    /// Environment variables which must be present in the engine's
    /// environment snapshot for the configuration to be usable.
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Process-wide engine settings.
    #[serde(default)]
    pub settings: Settings,
}

/// RouteDef declares a named route: exactly one source URI, zero or more
/// processors in declared order, and one or more destination URIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteDef {
    pub name: String,
    pub from: String,
    #[serde(default)]
    pub processors: Vec<ProcessorDef>,
    pub to: OneOrMany,
}

/// OneOrMany accepts either a single URI string or a list of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            OneOrMany::One(one) => std::slice::from_ref(one),
            OneOrMany::Many(many) => many,
        };
        slice.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        match self {
            OneOrMany::One(_) => 1,
            OneOrMany::Many(many) => many.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<&str> for OneOrMany {
    fn from(uri: &str) -> Self {
        OneOrMany::One(uri.to_string())
    }
}

/// ProcessorDef is one stage of a route's chain. The `type` tag selects
/// the variant; an unrecognized tag fails deserialization, which the
/// engine surfaces as a configuration error before any route starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessorDef {
    /// Evaluate a boolean predicate over the message. False drops it.
    Filter { predicate: String },
    /// Render a template into the message `body`, preserving other keys.
    Transform { template: String },
    /// Buffer messages into a window flushed on size or timeout.
    Aggregate {
        #[serde(default)]
        strategy: AggregateStrategy,
        #[serde(with = "humantime_serde")]
        timeout: Duration,
        max_size: NonZeroUsize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_by: Option<String>,
    },
    /// Log the message verbatim and forward it unchanged.
    Debug {
        #[serde(default)]
        prefix: String,
    },
    /// Delegate the message to a subprocess via JSON temp files.
    External {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Entries are exported to the subprocess as CONFIG_* environment
        /// variables. `config.timeout` (seconds) bounds the invocation.
        #[serde(default)]
        config: BTreeMap<String, Value>,
        #[serde(default)]
        input_format: IoFormat,
        #[serde(default)]
        output_format: IoFormat,
    },
}

impl ProcessorDef {
    /// Stable label used for metrics and status reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessorDef::Filter { .. } => "filter",
            ProcessorDef::Transform { .. } => "transform",
            ProcessorDef::Aggregate { .. } => "aggregate",
            ProcessorDef::Debug { .. } => "debug",
            ProcessorDef::External { .. } => "external",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateStrategy {
    #[default]
    Collect,
}

/// Wire format of an external processor's input and output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoFormat {
    /// A single JSON object: the whole message.
    #[default]
    Json,
    /// The message `body` as UTF-8 bytes.
    Text,
}

/// Settings are process-wide engine knobs. Durations are integer seconds
/// in the document, matching the front-end's schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "Settings::default_max_concurrent_routes")]
    pub max_concurrent_routes: usize,
    #[serde(default = "Settings::default_default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "Settings::default_log_level")]
    pub log_level: String,
    #[serde(default = "Settings::default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "Settings::default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Settings {
    fn default_max_concurrent_routes() -> usize {
        10
    }
    fn default_default_timeout() -> u64 {
        30
    }
    fn default_log_level() -> String {
        "info".to_string()
    }
    fn default_queue_capacity() -> usize {
        64
    }
    fn default_shutdown_grace() -> u64 {
        30
    }

    /// Per-operation timeout applied to source start, sink delivery,
    /// and other bounded engine operations.
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout)
    }

    /// How long the supervisor waits for routes to drain on shutdown
    /// before force-terminating external subprocesses.
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_routes: Self::default_max_concurrent_routes(),
            default_timeout: Self::default_default_timeout(),
            log_level: Self::default_log_level(),
            queue_capacity: Self::default_queue_capacity(),
            shutdown_grace: Self::default_shutdown_grace(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_route_document_round_trip() {
        let doc: ConfigDoc = serde_json::from_value(json!({
            "routes": [
                {
                    "name": "motion-alerts",
                    "from": "timer://{{PERIOD|default('5s')}}",
                    "processors": [
                        {"type": "filter", "predicate": "{{confidence}} > 0.5"},
                        {"type": "transform", "template": "alert: {{label}}"},
                        {
                            "type": "aggregate",
                            "timeout": "500ms",
                            "max_size": 3,
                            "group_by": "camera"
                        },
                        {"type": "debug", "prefix": "post-agg"},
                        {
                            "type": "external",
                            "command": "python3",
                            "args": ["detect.py"],
                            "config": {"threshold": 0.8, "timeout": 10}
                        }
                    ],
                    "to": ["log://", "http://sink.example/ingest"]
                }
            ],
            "env_vars": ["PERIOD"],
            "settings": {"max_concurrent_routes": 2}
        }))
        .unwrap();

        let route = &doc.routes[0];
        assert_eq!(route.name, "motion-alerts");
        assert_eq!(route.processors.len(), 5);
        assert_eq!(route.to.iter().count(), 2);
        assert_eq!(doc.settings.max_concurrent_routes, 2);
        // Unset settings fall back to their documented defaults.
        assert_eq!(doc.settings.queue_capacity, 64);
        assert_eq!(doc.settings.op_timeout(), Duration::from_secs(30));

        match &route.processors[2] {
            ProcessorDef::Aggregate {
                strategy,
                timeout,
                max_size,
                group_by,
            } => {
                assert_eq!(*strategy, AggregateStrategy::Collect);
                assert_eq!(*timeout, Duration::from_millis(500));
                assert_eq!(max_size.get(), 3);
                assert_eq!(group_by.as_deref(), Some("camera"));
            }
            other => panic!("unexpected processor {other:?}"),
        }
    }

    #[test]
    fn test_to_accepts_single_uri() {
        let route: RouteDef = serde_json::from_value(json!({
            "name": "single",
            "from": "timer://1s",
            "to": "log://"
        }))
        .unwrap();
        assert_eq!(route.to.iter().collect::<Vec<_>>(), vec!["log://"]);
        assert!(route.processors.is_empty());
    }

    #[test]
    fn test_unknown_processor_type_is_rejected() {
        let err = serde_json::from_value::<ProcessorDef>(json!({
            "type": "set-body",
            "value": "x"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn test_settings_defaults_serialize_stably() {
        insta::assert_snapshot!(
            serde_json::to_string(&Settings::default()).unwrap(),
            @r#"{"max_concurrent_routes":10,"default_timeout":30,"log_level":"info","queue_capacity":64,"shutdown_grace":30}"#
        );
    }

    #[test]
    fn test_aggregate_requires_positive_max_size() {
        serde_json::from_value::<ProcessorDef>(json!({
            "type": "aggregate",
            "timeout": "1s",
            "max_size": 0
        }))
        .unwrap_err();
    }
}
