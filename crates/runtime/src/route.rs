use models::{Message, RouteDef, RouteState, Settings};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, Scope};
use crate::process::Chain;
use crate::registry::{Feeder, Registry, Sink};
use crate::uri::Endpoint;
use crate::Error;

/// StateCell is a route's supervisor-visible lifecycle state. Updates
/// are monotone: once terminal, a route never transitions again, and a
/// route never moves backwards (Running -> Starting cannot happen).
pub(crate) struct StateCell(Mutex<RouteState>);

impl StateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(RouteState::Created)))
    }

    pub fn get(&self) -> RouteState {
        *self.0.lock().expect("state cell is never poisoned")
    }

    pub fn advance(&self, to: RouteState) {
        let mut current = self.0.lock().expect("state cell is never poisoned");
        if !current.is_terminal() && rank(to) > rank(*current) {
            *current = to;
        }
    }
}

fn rank(state: RouteState) -> u8 {
    match state {
        RouteState::Created => 0,
        RouteState::Starting => 1,
        RouteState::Running => 2,
        RouteState::Stopping => 3,
        RouteState::Stopped => 4,
        RouteState::Failed => 5,
    }
}

/// RouteRunner executes one route: it wires source -> chain -> sinks,
/// owns the bounded queue between them, and drives the message loop
/// until EOF, cancellation, or an unrecoverable source error.
pub(crate) struct RouteRunner {
    pub def: RouteDef,
    pub registry: Arc<Registry>,
    pub env: Arc<BTreeMap<String, String>>,
    pub settings: Settings,
    pub metrics: Arc<MetricsSink>,
    pub state: Arc<StateCell>,
}

impl RouteRunner {
    pub async fn run(self, cancel: CancellationToken) -> Result<(), Error> {
        let route = self.def.name.clone();
        self.state.advance(RouteState::Starting);

        let result = self.execute(&cancel).await;
        match &result {
            Ok(()) => {
                self.state.advance(RouteState::Stopped);
                tracing::info!(route = %route, "route stopped");
            }
            Err(err) => {
                self.state.advance(RouteState::Failed);
                tracing::error!(route = %route, error = %err, "route failed");
            }
        }
        result
    }

    async fn execute(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let route = self.def.name.as_str();

        // Startup: resolve and instantiate every endpoint, and build the
        // chain. Any failure here fails the route before it runs.
        let source_ep = Endpoint::resolve(&self.def.from, &self.env)?;
        let source = self.registry.source(&source_ep)?;

        let mut sinks: Vec<(String, Box<dyn Sink>)> = Vec::new();
        for uri in self.def.to.iter() {
            let ep = Endpoint::resolve(uri, &self.env)?;
            sinks.push((ep.uri.clone(), self.registry.sink(&ep)?));
        }

        let mut chain = Chain::build(route, &self.def.processors, &self.metrics, self.env.clone())?;

        let route_metrics = self.metrics.route(route);
        let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(self.settings.queue_capacity);
        let feeder = Feeder::new(tx, route, &source_ep.uri, route_metrics.clone());

        let source_cancel = cancel.child_token();
        let source_task = tokio::spawn(source.run(feeder, source_cancel));

        self.state.advance(RouteState::Running);
        tracing::info!(
            route = %route,
            source = %source_ep.uri,
            sinks = sinks.len(),
            processors = chain.len(),
            "route running"
        );

        let op_timeout = self.settings.op_timeout();
        loop {
            let deadline = chain.next_deadline();
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => {
                        route_metrics.messages_in(1);
                        let out = chain.process(msg, cancel).await;
                        route_metrics.messages_out(out.len() as u64);
                        fan_out(&sinks, out, &route_metrics, cancel, op_timeout).await;
                    }
                    // The source dropped its feeder: EOF or failure,
                    // disambiguated by its join result below.
                    None => break,
                },
                _ = sleep_or_never(deadline) => {
                    let out = chain.flush_due(Instant::now(), cancel).await;
                    route_metrics.messages_out(out.len() as u64);
                    fan_out(&sinks, out, &route_metrics, cancel, op_timeout).await;
                }
                _ = cancel.cancelled() => break,
            }
        }

        // Close the queue before joining the source: a source suspended
        // in a full `feed` must observe the closed channel to return.
        drop(rx);

        match source_task.await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => return Err(err),
            Err(join) => {
                return Err(Error::SourceFatal(anyhow::anyhow!(
                    "source task aborted: {join}"
                )))
            }
        }

        // Drain: flush open aggregate windows once, best-effort. The
        // flush runs under a fresh token: the route's own token may
        // already be cancelled, and a pre-cancelled flush would discard
        // the very windows it is meant to deliver. Operations stay
        // bounded by their timeouts, and the supervisor's grace deadline
        // still caps the whole drain.
        self.state.advance(RouteState::Stopping);
        let drain_cancel = CancellationToken::new();
        let rest = chain.drain(&drain_cancel).await;
        if !rest.is_empty() {
            route_metrics.messages_out(rest.len() as u64);
            fan_out(&sinks, rest, &route_metrics, &drain_cancel, op_timeout).await;
        }

        for (uri, sink) in &sinks {
            if let Err(err) = sink.stop().await {
                tracing::warn!(sink = %uri, error = %err, "sink stop failed");
            }
        }
        Ok(())
    }
}

/// Deliver each message to every sink concurrently. A failed or timed
/// out delivery is logged and counted; it cancels neither peer sinks nor
/// the route, and there is no rollback across sinks. Messages go out in
/// order, so each sink sees the post-processor stream in route order.
async fn fan_out(
    sinks: &[(String, Box<dyn Sink>)],
    msgs: Vec<Message>,
    metrics: &Scope,
    cancel: &CancellationToken,
    op_timeout: Duration,
) {
    for msg in msgs {
        let deliveries = sinks.iter().map(|(uri, sink)| {
            let msg = msg.clone();
            async move {
                let result = match tokio::time::timeout(
                    op_timeout,
                    sink.deliver(msg, cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_elapsed) => Err(Error::Delivery {
                        uri: uri.clone(),
                        source: anyhow::anyhow!("delivery timed out after {op_timeout:?}"),
                    }),
                };
                if let Err(err) = result {
                    metrics.error(&err);
                    tracing::warn!(sink = %uri, error = %err, "delivery failed");
                }
            }
        });
        futures::future::join_all(deliveries).await;
    }
}

async fn sleep_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_state_advances_monotonically() {
        let state = StateCell::new();
        assert_eq!(state.get(), RouteState::Created);

        state.advance(RouteState::Starting);
        state.advance(RouteState::Running);
        assert_eq!(state.get(), RouteState::Running);

        // Running never returns to Starting.
        state.advance(RouteState::Starting);
        assert_eq!(state.get(), RouteState::Running);

        state.advance(RouteState::Stopping);
        state.advance(RouteState::Stopped);
        assert_eq!(state.get(), RouteState::Stopped);

        // Terminal states are sticky.
        state.advance(RouteState::Failed);
        assert_eq!(state.get(), RouteState::Stopped);
    }

    #[test]
    fn test_failed_is_reachable_from_starting() {
        let state = StateCell::new();
        state.advance(RouteState::Starting);
        state.advance(RouteState::Failed);
        assert_eq!(state.get(), RouteState::Failed);
    }
}
