mod config;
mod message;

pub use config::{
    AggregateStrategy, ConfigDoc, IoFormat, OneOrMany, ProcessorDef, RouteDef, Settings,
};
pub use message::{Message, Object, KEY_BODY, KEY_ROUTE, KEY_SOURCE, KEY_TIMESTAMP};

use serde::{Deserialize, Serialize};

/// RouteState is the lifecycle state of a route, as observed by the
/// engine supervisor. Transitions are monotone:
/// Created -> Starting -> Running -> Stopping -> Stopped, with Failed
/// reachable from Starting (startup error) and Running (source error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl RouteState {
    /// A terminal route never transitions again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RouteState::Stopped | RouteState::Failed)
    }
}

impl std::fmt::Display for RouteState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RouteState::Created => "created",
            RouteState::Starting => "starting",
            RouteState::Running => "running",
            RouteState::Stopping => "stopping",
            RouteState::Stopped => "stopped",
            RouteState::Failed => "failed",
        };
        f.write_str(s)
    }
}
