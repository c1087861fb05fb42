//! The weir routing runtime: route lifecycle supervision, the
//! source -> processor-chain -> sink data flow, built-in and external
//! processors, URI resolution, and the engine's failure policy.
//!
//! Embedders hand the engine an already-parsed configuration document
//! (the YAML front-end lives elsewhere) and optionally register extra
//! endpoint schemes, then drive it:
//!
//! ```no_run
//! # async fn example(config: models::ConfigDoc) -> anyhow::Result<()> {
//! let engine = runtime::Engine::new(config, runtime::Registry::with_builtins())?;
//! engine.serve().await?;
//! # Ok(())
//! # }
//! ```

pub mod endpoints;
mod error;
pub mod metrics;
pub mod process;
mod registry;
mod route;
mod supervisor;
mod uri;

pub use error::Error;
pub use metrics::{CounterSnapshot, MetricsSink};
pub use registry::{Closed, EndpointFactory, Feeder, Registry, Role, Sink, Source};
pub use supervisor::{Engine, RouteStatus};
pub use uri::Endpoint;
