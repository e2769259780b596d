//! Run context shared with callbacks
//!
//! Resolved names are cached during `start` and handed out as a read-only
//! snapshot once completion finishes.

use crate::resolver::SyncStrategy;
use chrono::{DateTime, Utc};
use es_sync_core::prelude::*;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Callback run before either channel registers its schema
pub type PreBootstrapTask =
    Box<dyn Fn(Arc<dyn ClusterApi>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Callback run once at the end of completion
pub type PostCompleteHook = Box<dyn Fn(SyncContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Write and read aliases of one side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAliases {
    pub write_alias: String,
    pub read_alias: Option<String>,
}

/// Names resolved during `start`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedTargets {
    pub primary_write_alias: String,
    pub secondary_write_alias: String,
    pub primary_index: String,
    pub secondary_index: String,
    /// Concrete index behind the secondary write alias, pinned before any write
    pub secondary_reindex_target: Option<String>,
}

/// Snapshot passed to the post-complete hook
#[derive(Clone)]
pub struct SyncContext {
    pub transport: Arc<dyn ClusterApi>,
    pub run_id: Uuid,
    pub strategy: SyncStrategy,
    pub batch_timestamp: DateTime<Utc>,
    pub primary: TargetAliases,
    pub secondary: TargetAliases,
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("run_id", &self.run_id)
            .field("strategy", &self.strategy)
            .field("batch_timestamp", &self.batch_timestamp)
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .finish_non_exhaustive()
    }
}

/// Latest concrete index behind `write_alias`, if any
///
/// Rotating indices sort by their date suffix, so the greatest name wins.
pub async fn resolve_concrete_index(
    transport: &dyn ClusterApi,
    write_alias: &str,
) -> Result<Option<String>> {
    let indices = transport.resolve_alias(write_alias).await?;
    let concrete = indices.into_iter().max();
    debug!(alias = write_alias, ?concrete, "Resolved concrete index");
    Ok(concrete)
}
