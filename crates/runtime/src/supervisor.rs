use models::{ConfigDoc, RouteState};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::metrics::{CounterSnapshot, MetricsSink};
use crate::process::Chain;
use crate::registry::Registry;
use crate::route::{RouteRunner, StateCell};
use crate::uri::Endpoint;
use crate::Error;

/// Per-route view returned by `Engine::status`.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    pub state: RouteState,
    pub counters: CounterSnapshot,
}

/// Engine supervises all routes: it validates the configuration up
/// front, starts routes up to `max_concurrent_routes` (holding the rest
/// pending), promotes a pending route whenever a running one finishes,
/// and on shutdown cancels everything, waiting up to the grace period
/// before force-terminating what remains.
impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Engine")
    }
}

pub struct Engine {
    config: ConfigDoc,
    registry: Arc<Registry>,
    env: Arc<BTreeMap<String, String>>,
    metrics: Arc<MetricsSink>,
    states: BTreeMap<String, Arc<StateCell>>,
    cancel: CancellationToken,
}

impl Engine {
    /// Build an engine over the process environment, captured once here
    /// and never re-read.
    pub fn new(config: ConfigDoc, registry: Registry) -> Result<Self, Error> {
        Self::with_env(config, registry, std::env::vars().collect())
    }

    /// As `new`, with an explicit environment snapshot.
    pub fn with_env(
        config: ConfigDoc,
        registry: Registry,
        env: BTreeMap<String, String>,
    ) -> Result<Self, Error> {
        let registry = Arc::new(registry);
        let env = Arc::new(env);
        let metrics = MetricsSink::new();

        validate(&config, &registry, &env, &metrics)?;

        let states = config
            .routes
            .iter()
            .map(|route| (route.name.clone(), StateCell::new()))
            .collect();

        Ok(Self {
            config,
            registry,
            env,
            metrics,
            states,
            cancel: CancellationToken::new(),
        })
    }

    pub fn metrics(&self) -> Arc<MetricsSink> {
        self.metrics.clone()
    }

    /// Cancellation handle for embedders; cancelling it is equivalent to
    /// `shutdown`.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a graceful stop of every route.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of every route's state and counters.
    pub fn status(&self) -> BTreeMap<String, RouteStatus> {
        self.states
            .iter()
            .map(|(name, cell)| {
                (
                    name.clone(),
                    RouteStatus {
                        state: cell.get(),
                        counters: self.metrics.route_snapshot(name),
                    },
                )
            })
            .collect()
    }

    /// Run all routes to completion or until `shutdown`. Per-route
    /// failures are reflected in `status` and logs; they do not abort
    /// peer routes or this call.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut pending: VecDeque<_> = self.config.routes.iter().cloned().collect();
        let mut active: JoinSet<(String, Result<(), Error>)> = JoinSet::new();
        let max_active = self.config.settings.max_concurrent_routes;

        // Set once shutdown is requested: the instant at which still-
        // running routes are force-terminated.
        let mut grace_deadline: Option<tokio::time::Instant> = None;

        loop {
            while grace_deadline.is_none() && active.len() < max_active {
                let Some(def) = pending.pop_front() else { break };
                let name = def.name.clone();
                let runner = RouteRunner {
                    state: self.states[&name].clone(),
                    def,
                    registry: self.registry.clone(),
                    env: self.env.clone(),
                    settings: self.config.settings.clone(),
                    metrics: self.metrics.clone(),
                };
                let token = self.cancel.child_token();
                tracing::info!(route = %name, "starting route");
                active.spawn(async move { (name, runner.run(token).await) });
            }

            if active.is_empty() {
                break; // Every started route reached a terminal state.
            }

            tokio::select! {
                joined = active.join_next() => match joined {
                    Some(Ok((name, Ok(())))) => {
                        tracing::debug!(route = %name, "route finished");
                    }
                    Some(Ok((name, Err(err)))) => {
                        tracing::warn!(route = %name, error = %err, "route finished with error");
                    }
                    Some(Err(join_err)) => {
                        tracing::error!(error = %join_err, "route task aborted");
                    }
                    None => (),
                },
                _ = self.cancel.cancelled(), if grace_deadline.is_none() => {
                    pending.clear();
                    let grace = self.config.settings.grace_period();
                    grace_deadline = Some(tokio::time::Instant::now() + grace);
                    tracing::info!(?grace, "engine shutdown requested; draining routes");
                }
                _ = sleep_until_or_never(grace_deadline), if grace_deadline.is_some() => {
                    // Aborting drops route tasks, which tears down their
                    // in-flight external subprocesses.
                    tracing::warn!("shutdown grace elapsed; force-terminating remaining routes");
                    active.abort_all();
                    while active.join_next().await.is_some() {}
                }
            }
        }

        self.finalize_states();
        Ok(())
    }

    /// Run until completion or a SIGINT / SIGTERM, whichever is first.
    pub async fn serve(&self) -> anyhow::Result<()> {
        use tokio::signal::unix;

        let mut sigint = unix::signal(unix::SignalKind::interrupt())?;
        let mut sigterm = unix::signal(unix::SignalKind::terminate())?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => (),
                _ = sigterm.recv() => (),
            }
            tracing::info!("caught signal to exit");
            cancel.cancel();
        });

        self.run().await
    }

    /// After run ends, no route task remains: mark never-started routes
    /// Stopped and force-terminated ones Failed.
    fn finalize_states(&self) {
        for cell in self.states.values() {
            match cell.get() {
                RouteState::Created => cell.advance(RouteState::Stopped),
                state if !state.is_terminal() => cell.advance(RouteState::Failed),
                _ => (),
            }
        }
    }
}

/// Startup validation: configuration errors are fatal and the engine
/// refuses to construct. Endpoint drivers are not instantiated here;
/// a bind failure at route start is an endpoint error, not a config one.
fn validate(
    config: &ConfigDoc,
    registry: &Registry,
    env: &BTreeMap<String, String>,
    metrics: &MetricsSink,
) -> Result<(), Error> {
    for required in &config.env_vars {
        if !env.contains_key(required) {
            return Err(Error::config(format!(
                "required environment variable '{required}' is not set"
            )));
        }
    }

    if config.settings.max_concurrent_routes == 0 {
        return Err(Error::config("settings.max_concurrent_routes must be positive"));
    }
    if config.settings.queue_capacity == 0 {
        return Err(Error::config("settings.queue_capacity must be positive"));
    }

    let mut seen = std::collections::BTreeSet::new();
    for route in &config.routes {
        if route.name.is_empty() {
            return Err(Error::config("route with empty name"));
        }
        if !seen.insert(route.name.as_str()) {
            return Err(Error::config(format!("duplicate route name '{}'", route.name)));
        }
        if route.to.is_empty() {
            return Err(Error::config(format!(
                "route '{}' has no destinations",
                route.name
            )));
        }

        let from = Endpoint::resolve(&route.from, env)?;
        if !registry.contains(&from.scheme) {
            return Err(unknown_scheme(&from));
        }
        for uri in route.to.iter() {
            let to = Endpoint::resolve(uri, env)?;
            if !registry.contains(&to.scheme) {
                return Err(unknown_scheme(&to));
            }
        }

        // Dry-build the chain so predicate and template errors are
        // caught before any route starts.
        let env = Arc::new(env.clone());
        Chain::build(&route.name, &route.processors, metrics, env)?;
    }
    Ok(())
}

// Never resolves without a deadline; the select! guard keeps that case
// from being polled anyway.
async fn sleep_until_or_never(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn unknown_scheme(endpoint: &Endpoint) -> Error {
    Error::config(format!(
        "unknown scheme '{}' in '{}'",
        endpoint.scheme, endpoint.uri
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn config(raw: serde_json::Value) -> ConfigDoc {
        serde_json::from_value(raw).unwrap()
    }

    fn engine(raw: serde_json::Value) -> Result<Engine, Error> {
        Engine::with_env(config(raw), Registry::with_builtins(), BTreeMap::new())
    }

    #[test]
    fn test_missing_env_var_refuses_start() {
        let err = engine(json!({
            "routes": [],
            "env_vars": ["CAMERA_URL"],
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("CAMERA_URL"));
    }

    #[test]
    fn test_unknown_scheme_refuses_start() {
        let err = engine(json!({
            "routes": [{"name": "r", "from": "quic://x", "to": "log://"}],
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_bad_predicate_refuses_start() {
        let err = engine(json!({
            "routes": [{
                "name": "r",
                "from": "timer://1s",
                "processors": [{"type": "filter", "predicate": "{{v}} >"}],
                "to": "log://",
            }],
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn test_duplicate_route_names_refuse_start() {
        let err = engine(json!({
            "routes": [
                {"name": "r", "from": "timer://1s", "to": "log://"},
                {"name": "r", "from": "timer://2s", "to": "log://"},
            ],
        }))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate route name"));
    }

    #[test]
    fn test_status_starts_created() {
        let engine = engine(json!({
            "routes": [{"name": "r", "from": "timer://1s", "to": "log://"}],
        }))
        .unwrap();

        let status = engine.status();
        assert_eq!(status["r"].state, RouteState::Created);
        assert_eq!(status["r"].counters, CounterSnapshot::default());
    }
}
