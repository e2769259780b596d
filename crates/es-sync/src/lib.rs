//! # ES Sync
//!
//! Incremental synchronization of one document type into two Elasticsearch
//! targets.
//!
//! ## Strategies
//!
//! - `Reindex`: writes go to the primary only; the secondary catches up
//!   through server-side reindex tasks when the run completes
//! - `Multiplex`: every write goes to both targets
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut orchestrator = IncrementalSyncOrchestrator::new(transport, factory, primary, secondary)
//!     .with_config(config.orchestrator.clone());
//!
//! orchestrator.start(BootstrapMethod::Failure).await?;
//! for doc in docs {
//!     orchestrator.wait_to_write(doc).await?;
//! }
//! orchestrator.complete(None).await?;
//! orchestrator.dispose().await?;
//! ```

pub mod context;
pub mod orchestrator;
pub mod resolver;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{PostCompleteHook, PreBootstrapTask, ResolvedTargets, SyncContext, TargetAliases};
pub use orchestrator::{CompletionPhase, DateFields, IncrementalSyncOrchestrator};
pub use resolver::{resolve_strategy, SchemaCheck, StrategyResolver, SyncStrategy};
pub use tasks::{TaskMonitor, TaskOutcome};
