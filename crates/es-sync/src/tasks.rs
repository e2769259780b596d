//! Server-side task helpers
//!
//! Reindex and delete-by-query are started with `wait_for_completion=false`
//! and then tracked through the tasks API. Tracking is permissive: a missing
//! task id or a failed status fetch ends the wait without an error, so the
//! caller proceeds as if the task had finished.

use chrono::{DateTime, Utc};
use es_sync_core::prelude::*;
use es_sync_core::{format_timestamp, SyncMetrics};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Painless script turning a copied document into a delete on the destination
const DELETE_ON_COPY_SCRIPT: &str = "ctx.op = 'delete'";

/// How a task wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The tasks API reported `completed: true`
    Completed { task_id: String },
    /// No task id could be read from the start response
    Untracked,
    /// A status fetch failed; the task may still be running
    StatusUnavailable { task_id: String },
}

impl TaskOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Read a `node-id:task-number` identifier from a start response
pub fn extract_task_id(response: &Value) -> Option<String> {
    let task = response.get("task")?.as_str()?;
    let (node, number) = task.split_once(':')?;
    if node.is_empty() || number.parse::<u64>().is_err() {
        return None;
    }
    Some(task.to_string())
}

/// Copy documents changed at or after `since`
pub fn changed_documents_body(
    source: &str,
    dest: &str,
    last_updated_field: &str,
    since: DateTime<Utc>,
) -> Value {
    json!({
        "conflicts": "proceed",
        "source": {
            "index": source,
            "query": { "range": { last_updated_field: { "gte": format_timestamp(since) } } }
        },
        "dest": { "index": dest }
    })
}

/// Copy documents last seen before `before` as deletes on the destination
pub fn stale_documents_delete_body(
    source: &str,
    dest: &str,
    batch_index_date_field: &str,
    before: DateTime<Utc>,
) -> Value {
    json!({
        "conflicts": "proceed",
        "source": {
            "index": source,
            "query": stale_documents_query(batch_index_date_field, before)["query"].clone()
        },
        "dest": { "index": dest },
        "script": { "lang": "painless", "source": DELETE_ON_COPY_SCRIPT }
    })
}

/// Delete-by-query body for documents last seen before `before`
pub fn stale_documents_query(batch_index_date_field: &str, before: DateTime<Utc>) -> Value {
    json!({
        "query": { "range": { batch_index_date_field: { "lt": format_timestamp(before) } } }
    })
}

/// Start a reindex and return its task id, if one could be read
pub async fn start_reindex(transport: &dyn ClusterApi, body: &Value) -> Result<Option<String>> {
    let response = transport.start_reindex(body).await?;
    let task_id = extract_task_id(&response);
    debug!(?task_id, dest = %body["dest"]["index"], "Started reindex");
    Ok(task_id)
}

/// Start a delete-by-query and return its task id, if one could be read
pub async fn start_delete_by_query(
    transport: &dyn ClusterApi,
    target: &str,
    body: &Value,
) -> Result<Option<String>> {
    let response = transport.start_delete_by_query(target, body).await?;
    let task_id = extract_task_id(&response);
    debug!(?task_id, target, "Started delete by query");
    Ok(task_id)
}

/// Polls the tasks API on a fixed interval
///
/// There is no upper bound on the total wait; cancellation is the only way
/// to abandon a task that never completes.
pub struct TaskMonitor<'a> {
    transport: &'a dyn ClusterApi,
    poll_interval: Duration,
    cancel: &'a CancellationToken,
    metrics: &'a SyncMetrics,
}

impl<'a> TaskMonitor<'a> {
    pub fn new(
        transport: &'a dyn ClusterApi,
        poll_interval: Duration,
        cancel: &'a CancellationToken,
        metrics: &'a SyncMetrics,
    ) -> Self {
        Self {
            transport,
            poll_interval,
            cancel,
            metrics,
        }
    }

    /// Wait until the task reports completion
    ///
    /// Only cancellation is an error.
    pub async fn wait(&self, task_id: Option<&str>) -> Result<TaskOutcome> {
        let Some(task_id) = task_id else {
            warn!("No task id to track, continuing without waiting");
            return Ok(TaskOutcome::Untracked);
        };

        let mut polls = 0u32;
        loop {
            polls += 1;
            self.metrics.record_task_poll();

            let status = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                status = self.transport.task_status(task_id) => status,
            };

            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(task_id, error = %e, "Task status unavailable, continuing");
                    return Ok(TaskOutcome::StatusUnavailable {
                        task_id: task_id.to_string(),
                    });
                }
            };

            if status["completed"].as_bool().unwrap_or(false) {
                let failures = status["response"]["failures"]
                    .as_array()
                    .map_or(0, |f| f.len());
                if failures > 0 || status.get("error").is_some() {
                    warn!(task_id, failures, error = %status["error"], "Task completed with failures");
                }
                info!(
                    task_id,
                    polls,
                    total = %status["response"]["total"],
                    "Task completed"
                );
                return Ok(TaskOutcome::Completed {
                    task_id: task_id.to_string(),
                });
            }

            debug!(task_id, polls, "Task still running");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
