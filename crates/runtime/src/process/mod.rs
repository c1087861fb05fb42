//! Processor stages and the per-route chain that runs them in order.

pub mod aggregate;
pub mod debug;
pub mod external;
pub mod filter;
pub mod transform;

use models::{Message, ProcessorDef};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, Scope};
use crate::Error;

/// Chain is a route's ordered processor stages. Messages run through
/// stages sequentially; a stage may forward, drop, buffer (aggregate),
/// or fail a message. Per-message errors never propagate out of the
/// chain: they are counted and the message is discarded.
pub struct Chain {
    stages: Vec<Stage>,
}

struct Stage {
    label: String,
    metrics: Scope,
    kind: StageKind,
}

enum StageKind {
    Filter(filter::Filter),
    Transform(transform::Transform),
    Aggregate(aggregate::Aggregate),
    Debug(debug::Debug),
    External(external::External),
}

/// What a stage did with one input message.
enum Applied {
    Forward(Vec<Message>),
    Dropped,
    Buffered,
    Cancelled,
}

impl Chain {
    /// Build the chain for `route`. Configuration problems (bad
    /// predicates, malformed templates) surface here, before the route
    /// starts moving messages.
    pub fn build(
        route: &str,
        defs: &[ProcessorDef],
        metrics: &MetricsSink,
        env: Arc<BTreeMap<String, String>>,
    ) -> Result<Self, Error> {
        let stages = defs
            .iter()
            .enumerate()
            .map(|(position, def)| {
                let label = format!("{position}:{}", def.kind());
                let kind = match def {
                    ProcessorDef::Filter { predicate } => {
                        StageKind::Filter(filter::Filter::new(predicate)?)
                    }
                    ProcessorDef::Transform { template } => {
                        StageKind::Transform(transform::Transform::new(template)?)
                    }
                    ProcessorDef::Aggregate {
                        strategy: models::AggregateStrategy::Collect,
                        timeout,
                        max_size,
                        group_by,
                    } => StageKind::Aggregate(aggregate::Aggregate::new(
                        *timeout,
                        max_size.get(),
                        group_by.clone(),
                    )),
                    ProcessorDef::Debug { prefix } => StageKind::Debug(debug::Debug::new(prefix)),
                    ProcessorDef::External {
                        command,
                        args,
                        config,
                        input_format,
                        output_format,
                    } => StageKind::External(external::External::new(
                        command,
                        args,
                        config,
                        *input_format,
                        *output_format,
                        env.clone(),
                    )),
                };
                Ok(Stage {
                    metrics: metrics.processor(route, &label),
                    label,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run one source message through the whole chain, returning the
    /// messages that exit the final stage (none when filtered, buffered,
    /// or failed).
    pub async fn process(&mut self, msg: Message, cancel: &CancellationToken) -> Vec<Message> {
        self.process_from(0, vec![msg], cancel).await
    }

    async fn process_from(
        &mut self,
        from: usize,
        mut in_flight: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Vec<Message> {
        for stage in self.stages[from..].iter_mut() {
            if in_flight.is_empty() {
                break;
            }
            let mut next = Vec::new();
            for msg in in_flight {
                stage.metrics.messages_in(1);
                let started = std::time::Instant::now();
                let applied = stage.apply(msg, cancel).await;
                stage.metrics.processing_time(started.elapsed());

                match applied {
                    Ok(Applied::Forward(outputs)) => {
                        stage.metrics.messages_out(outputs.len() as u64);
                        next.extend(outputs);
                    }
                    Ok(Applied::Dropped) => stage.metrics.drops(1),
                    Ok(Applied::Buffered) | Ok(Applied::Cancelled) => (),
                    Err(err) => {
                        stage.metrics.error(&err);
                        tracing::warn!(
                            stage = %stage.label,
                            error = %err,
                            "processor error; dropping message"
                        );
                    }
                }
            }
            in_flight = next;
        }
        in_flight
    }

    /// The earliest instant at which some aggregate window times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.stages
            .iter()
            .filter_map(|stage| match &stage.kind {
                StageKind::Aggregate(agg) => agg.next_deadline(),
                _ => None,
            })
            .min()
    }

    /// Flush aggregate windows due as of `now`, running their collected
    /// outputs through the stages downstream of each aggregate.
    pub async fn flush_due(
        &mut self,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Vec<Message> {
        self.flush(cancel, |agg| agg.take_due(now)).await
    }

    /// Flush every non-empty aggregate window, due or not: the single
    /// best-effort flush on source EOF and on cancellation.
    pub async fn drain(&mut self, cancel: &CancellationToken) -> Vec<Message> {
        self.flush(cancel, aggregate::Aggregate::take_all).await
    }

    async fn flush<F>(&mut self, cancel: &CancellationToken, mut take: F) -> Vec<Message>
    where
        F: FnMut(&mut aggregate::Aggregate) -> Vec<Message>,
    {
        let mut flushed: Vec<(usize, Vec<Message>)> = Vec::new();
        for (position, stage) in self.stages.iter_mut().enumerate() {
            if let StageKind::Aggregate(agg) = &mut stage.kind {
                let windows = take(agg);
                if !windows.is_empty() {
                    stage.metrics.messages_out(windows.len() as u64);
                    flushed.push((position, windows));
                }
            }
        }

        let mut out = Vec::new();
        for (position, windows) in flushed {
            out.extend(self.process_from(position + 1, windows, cancel).await);
        }
        out
    }
}

impl Stage {
    async fn apply(
        &mut self,
        msg: Message,
        cancel: &CancellationToken,
    ) -> Result<Applied, Error> {
        match &mut self.kind {
            StageKind::Filter(filter) => Ok(match filter.apply(msg)? {
                Some(msg) => Applied::Forward(vec![msg]),
                None => Applied::Dropped,
            }),
            StageKind::Transform(transform) => {
                Ok(Applied::Forward(vec![transform.apply(msg)?]))
            }
            StageKind::Aggregate(agg) => Ok(match agg.push(msg) {
                Some(window) => Applied::Forward(vec![window]),
                None => Applied::Buffered,
            }),
            StageKind::Debug(debug) => Ok(Applied::Forward(vec![debug.apply(msg)])),
            StageKind::External(ext) => Ok(match ext.apply(msg, cancel).await? {
                Some(msg) => Applied::Forward(vec![msg]),
                None => Applied::Cancelled,
            }),
        }
    }
}
