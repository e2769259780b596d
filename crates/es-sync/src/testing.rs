//! In-memory doubles shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use es_sync_core::prelude::*;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of every remote call, shared across doubles
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct MockCluster {
    log: CallLog,
    missing: HashSet<String>,
    aliases: HashMap<String, Vec<String>>,
    polls_until_complete: u32,
    polls: AtomicU32,
    failing_status: bool,
    failing_reindex: bool,
    task_ids: bool,
}

impl MockCluster {
    pub fn new() -> Self {
        Self {
            log: CallLog::default(),
            missing: HashSet::new(),
            aliases: HashMap::new(),
            polls_until_complete: 1,
            polls: AtomicU32::new(0),
            failing_status: false,
            failing_reindex: false,
            task_ids: true,
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_missing(mut self, target: &str) -> Self {
        self.missing.insert(target.to_string());
        self
    }

    pub fn with_alias(mut self, alias: &str, indices: &[&str]) -> Self {
        self.aliases.insert(
            alias.to_string(),
            indices.iter().map(|i| i.to_string()).collect(),
        );
        self
    }

    pub fn with_polls_until_complete(mut self, polls: u32) -> Self {
        self.polls_until_complete = polls;
        self
    }

    pub fn with_failing_status(mut self) -> Self {
        self.failing_status = true;
        self
    }

    pub fn with_failing_reindex(mut self) -> Self {
        self.failing_reindex = true;
        self
    }

    pub fn without_task_ids(mut self) -> Self {
        self.task_ids = false;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.calls()
    }

    pub fn count(&self, call: &str) -> usize {
        self.log.count(call)
    }

    fn task_response(&self) -> Value {
        if self.task_ids {
            json!({ "task": "node-1:4242" })
        } else {
            json!({ "took": 1 })
        }
    }
}

#[async_trait]
impl ClusterApi for MockCluster {
    async fn exists(&self, target: &str) -> Result<bool> {
        self.log.push(format!("exists({target})"));
        Ok(!self.missing.contains(target))
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Vec<String>> {
        self.log.push(format!("resolve-alias({alias})"));
        Ok(self.aliases.get(alias).cloned().unwrap_or_default())
    }

    async fn create_index(&self, index: &str) -> Result<bool> {
        self.log.push(format!("create-index({index})"));
        Ok(true)
    }

    async fn refresh(&self, target: &str) -> Result<bool> {
        self.log.push(format!("cluster-refresh({target})"));
        Ok(true)
    }

    async fn update_aliases(&self, _actions: Vec<Value>) -> Result<bool> {
        self.log.push("update-aliases");
        Ok(true)
    }

    async fn get_index_template(&self, name: &str) -> Result<Option<Value>> {
        self.log.push(format!("get-template({name})"));
        Ok(None)
    }

    async fn put_index_template(&self, name: &str, _body: &Value) -> Result<()> {
        self.log.push(format!("put-template({name})"));
        Ok(())
    }

    async fn bulk(&self, _body: String) -> Result<BulkResponse> {
        self.log.push("bulk");
        Ok(BulkResponse::default())
    }

    async fn start_reindex(&self, body: &Value) -> Result<Value> {
        let kind = if body.get("script").is_some() {
            "deletions"
        } else {
            "updates"
        };
        self.log.push(format!("reindex-start({kind})"));
        if self.failing_reindex {
            return Err(SyncError::elasticsearch("reindex rejected: too many requests"));
        }
        Ok(self.task_response())
    }

    async fn start_delete_by_query(&self, target: &str, _body: &Value) -> Result<Value> {
        self.log.push(format!("delete-by-query({target})"));
        Ok(self.task_response())
    }

    async fn task_status(&self, _task_id: &str) -> Result<Value> {
        self.log.push("poll");
        if self.failing_status {
            return Err(SyncError::elasticsearch("task endpoint unavailable"));
        }
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "completed": polls >= self.polls_until_complete }))
    }
}

/// Channel double recording its calls into the shared log
pub struct MockChannel {
    side: &'static str,
    log: CallLog,
    local_hash: String,
    stored_hash: Option<String>,
    index: String,
    accept_writes: AtomicBool,
    failing_drain: AtomicBool,
    failing_refresh: AtomicBool,
    stalled_drain: AtomicBool,
    drain_waits: Mutex<Vec<Option<Duration>>>,
    writes: Mutex<Vec<Value>>,
    alias_targets: Mutex<Vec<String>>,
    bootstrap_methods: Mutex<Vec<BootstrapMethod>>,
}

impl MockChannel {
    pub fn new(side: &'static str, log: CallLog, index: &str) -> Self {
        Self {
            side,
            log,
            local_hash: "abc".to_string(),
            stored_hash: Some("abc".to_string()),
            index: index.to_string(),
            accept_writes: AtomicBool::new(true),
            failing_drain: AtomicBool::new(false),
            failing_refresh: AtomicBool::new(false),
            stalled_drain: AtomicBool::new(false),
            drain_waits: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            alias_targets: Mutex::new(Vec::new()),
            bootstrap_methods: Mutex::new(Vec::new()),
        }
    }

    pub fn with_stored_hash(mut self, hash: Option<&str>) -> Self {
        self.stored_hash = hash.map(str::to_string);
        self
    }

    pub fn reject_writes(&self) {
        self.accept_writes.store(false, Ordering::SeqCst);
    }

    pub fn fail_drain(&self) {
        self.failing_drain.store(true, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self) {
        self.failing_refresh.store(true, Ordering::SeqCst);
    }

    /// Drains sit out their whole bound, as a backed-up buffer would
    pub fn stall_drain(&self) {
        self.stalled_drain.store(true, Ordering::SeqCst);
    }

    pub fn drain_waits(&self) -> Vec<Option<Duration>> {
        self.drain_waits.lock().unwrap().clone()
    }

    pub fn written(&self) -> Vec<Value> {
        self.writes.lock().unwrap().clone()
    }

    pub fn alias_targets(&self) -> Vec<String> {
        self.alias_targets.lock().unwrap().clone()
    }

    pub fn bootstrap_methods(&self) -> Vec<BootstrapMethod> {
        self.bootstrap_methods.lock().unwrap().clone()
    }

    fn record_write(&self, item: Value) -> bool {
        self.log.push(format!("write({})", self.side));
        let accepted = self.accept_writes.load(Ordering::SeqCst);
        if accepted {
            self.writes.lock().unwrap().push(item);
        }
        accepted
    }
}

#[async_trait]
impl IngestChannel<Value> for MockChannel {
    fn try_write(&self, item: Value) -> bool {
        self.record_write(item)
    }

    async fn wait_to_write(&self, item: Value) -> Result<bool> {
        Ok(self.record_write(item))
    }

    async fn bootstrap(&self, method: BootstrapMethod) -> Result<bool> {
        self.log.push(format!("bootstrap({})", self.side));
        self.bootstrap_methods.lock().unwrap().push(method);
        Ok(true)
    }

    async fn drain(&self, max_wait: Option<Duration>) -> Result<()> {
        self.log.push(format!("drain({})", self.side));
        self.drain_waits.lock().unwrap().push(max_wait);
        if self.failing_drain.load(Ordering::SeqCst) {
            return Err(SyncError::elasticsearch(format!(
                "3 documents lost on `{}`",
                self.index
            )));
        }
        if self.stalled_drain.load(Ordering::SeqCst) {
            if let Some(limit) = max_wait {
                tokio::time::sleep(limit).await;
            }
        }
        Ok(())
    }

    async fn refresh(&self) -> Result<bool> {
        self.log.push(format!("refresh({})", self.side));
        if self.failing_refresh.load(Ordering::SeqCst) {
            return Err(SyncError::elasticsearch("refresh rejected: index closed"));
        }
        Ok(true)
    }

    async fn apply_aliases(&self, index_name: &str) -> Result<bool> {
        self.log.push(format!("applyAliases({})", self.side));
        self.alias_targets
            .lock()
            .unwrap()
            .push(index_name.to_string());
        Ok(true)
    }

    async fn stored_schema_hash(&self) -> Result<Option<String>> {
        Ok(self.stored_hash.clone())
    }

    fn channel_hash(&self) -> String {
        self.local_hash.clone()
    }

    fn index_name(&self) -> String {
        self.index.clone()
    }

    async fn close(&self) -> Result<()> {
        self.log.push(format!("close({})", self.side));
        Ok(())
    }
}

/// Hands out prepared channels by descriptor name
pub struct MockFactory {
    channels: HashMap<String, Arc<MockChannel>>,
    created: AtomicU32,
    timestamps: Mutex<Vec<DateTime<Utc>>>,
}

impl MockFactory {
    pub fn new(primary: (&str, Arc<MockChannel>), secondary: (&str, Arc<MockChannel>)) -> Self {
        let mut channels = HashMap::new();
        channels.insert(primary.0.to_string(), primary.1);
        channels.insert(secondary.0.to_string(), secondary.1);
        Self {
            channels,
            created: AtomicU32::new(0),
            timestamps: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.timestamps.lock().unwrap().clone()
    }
}

impl ChannelFactory<Value> for MockFactory {
    fn create(
        &self,
        _transport: Arc<dyn ClusterApi>,
        descriptor: Arc<TypeDescriptor>,
        batch_timestamp: DateTime<Utc>,
    ) -> Result<Arc<dyn IngestChannel<Value>>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.timestamps.lock().unwrap().push(batch_timestamp);
        let channel: Arc<dyn IngestChannel<Value>> = self
            .channels
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| SyncError::config(format!("no mock for `{}`", descriptor.name)))?;
        Ok(channel)
    }
}
