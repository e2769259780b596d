//! Collaborator traits
//!
//! The orchestrator only ever talks to the remote service through these
//! seams, which keeps the sync logic testable against in-memory doubles.
//!
//! ```text
//!               ┌──────────────────┐
//!               │   Orchestrator   │
//!               └───┬──────────┬───┘
//!       ┌───────────┘          └───────────┐
//! ┌─────▼──────────┐              ┌────────▼───────┐
//! │ IngestChannel  │              │ IngestChannel  │
//! │   (primary)    │              │  (secondary)   │
//! └─────┬──────────┘              └────────┬───────┘
//!       └──────────┐          ┌────────────┘
//!               ┌──▼──────────▼──┐
//!               │   ClusterApi   │  (shared transport)
//!               └────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::descriptor::TypeDescriptor;
use crate::error::Result;

/// How schema registration failures are handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootstrapMethod {
    /// Skip schema registration entirely
    None,
    /// Swallow failures and report `false`
    Silent,
    /// Propagate failures with the remote diagnostic
    #[default]
    Failure,
}

impl std::fmt::Display for BootstrapMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Silent => "silent",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// A document that can be written through an ingest channel
pub trait SyncDocument: Serialize + Clone + Send + Sync + 'static {
    /// Stable identifier; documents without one are indexed with a server id
    fn document_id(&self) -> Option<String> {
        None
    }
}

impl SyncDocument for Value {
    fn document_id(&self) -> Option<String> {
        match self.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Render a timestamp the way it is stored in date fields and range queries
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// Transport
// ============================================================================

/// Bulk API response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkResponse {
    #[serde(default)]
    pub took: u64,
    #[serde(default)]
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl BulkResponse {
    /// Failed items as `(id, reason)` pairs
    pub fn failures(&self) -> Vec<(String, String)> {
        self.items
            .iter()
            .filter_map(|item| item.as_object().and_then(|o| o.values().next()))
            .filter_map(|op| {
                let error = op.get("error")?;
                let id = op["_id"].as_str().unwrap_or("unknown").to_string();
                let reason = error["reason"].as_str().unwrap_or("unknown").to_string();
                Some((id, reason))
            })
            .collect()
    }
}

/// Shared connection to the search cluster
///
/// Implementations must be safe for concurrent logical use; callers never
/// mutate transport state.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Lightweight existence check for an index or alias (HEAD)
    async fn exists(&self, target: &str) -> Result<bool>;

    /// Concrete indices currently behind an alias; empty when absent
    async fn resolve_alias(&self, alias: &str) -> Result<Vec<String>>;

    /// Create an index; `false` when it already exists
    async fn create_index(&self, index: &str) -> Result<bool>;

    /// Make recent writes visible to reads
    async fn refresh(&self, target: &str) -> Result<bool>;

    /// Apply a list of `_aliases` actions atomically
    async fn update_aliases(&self, actions: Vec<Value>) -> Result<bool>;

    /// Stored index template, `None` when absent
    async fn get_index_template(&self, name: &str) -> Result<Option<Value>>;

    /// Register an index template
    async fn put_index_template(&self, name: &str, body: &Value) -> Result<()>;

    /// Submit an NDJSON bulk body
    async fn bulk(&self, body: String) -> Result<BulkResponse>;

    /// Start a server-side reindex without waiting for completion
    async fn start_reindex(&self, body: &Value) -> Result<Value>;

    /// Start a delete-by-query against `target` without waiting for completion
    async fn start_delete_by_query(&self, target: &str, body: &Value) -> Result<Value>;

    /// Fetch task status by `node-id:task-number` identifier
    async fn task_status(&self, task_id: &str) -> Result<Value>;
}

// ============================================================================
// Ingest Channel
// ============================================================================

/// Buffered writer for one target
#[async_trait]
pub trait IngestChannel<D: SyncDocument>: Send + Sync {
    /// Buffer an item without suspending; `false` when the buffer is full
    fn try_write(&self, item: D) -> bool;

    /// Buffer an item, suspending until capacity is available
    async fn wait_to_write(&self, item: D) -> Result<bool>;

    /// Idempotently register the schema; `true` when it is in the desired state
    async fn bootstrap(&self, method: BootstrapMethod) -> Result<bool>;

    /// Suspend until the buffer is empty or `max_wait` elapses
    async fn drain(&self, max_wait: Option<Duration>) -> Result<()>;

    async fn refresh(&self) -> Result<bool>;

    /// Point the write and read aliases at `index_name`
    async fn apply_aliases(&self, index_name: &str) -> Result<bool>;

    /// Schema hash recorded on the server, `None` when absent
    async fn stored_schema_hash(&self) -> Result<Option<String>>;

    /// Locally computed schema hash
    fn channel_hash(&self) -> String;

    /// Concrete index written to during this run
    fn index_name(&self) -> String;

    /// Flush and release the channel; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Creates channels once the orchestrator starts
pub trait ChannelFactory<D: SyncDocument>: Send + Sync {
    fn create(
        &self,
        transport: Arc<dyn ClusterApi>,
        descriptor: Arc<TypeDescriptor>,
        batch_timestamp: DateTime<Utc>,
    ) -> Result<Arc<dyn IngestChannel<D>>>;
}
