//! Buffered bulk ingest channel
//!
//! Writers push documents into a bounded buffer; a background worker drains
//! it into `_bulk` requests. Documents carrying an id are written as scripted
//! upserts so that unchanged content only has its batch date refreshed, which
//! is what lets the orchestrator copy "changed since" and purge "stale before"
//! a single batch timestamp.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use es_sync_core::prelude::*;
use es_sync_core::{format_timestamp, ChannelConfig, ChannelMetrics};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batcher::Batcher;

/// State shared between the channel handle and its worker
struct Shared {
    transport: Arc<dyn ClusterApi>,
    descriptor: Arc<TypeDescriptor>,
    config: ChannelConfig,
    metrics: ChannelMetrics,
    batch_timestamp: DateTime<Utc>,
    schema_hash: String,
    index_name: RwLock<String>,
    /// Buffered plus in-flight documents
    outstanding: AtomicU64,
    /// Signalled whenever a bulk request settles
    settled: Notify,
    /// Asks the worker to flush without waiting for the interval
    flush_requested: Notify,
    /// First bulk failure since the last drain
    last_failure: Mutex<Option<String>>,
}

impl Shared {
    fn current_index(&self) -> String {
        self.index_name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_index(&self, name: String) {
        match self.index_name.write() {
            Ok(mut guard) => *guard = name,
            Err(poisoned) => *poisoned.into_inner() = name,
        }
    }

    fn record_failure(&self, message: String) {
        if let Ok(mut slot) = self.last_failure.lock() {
            slot.get_or_insert(message);
        }
    }

    fn take_failure(&self) -> Option<String> {
        self.last_failure.lock().ok().and_then(|mut slot| slot.take())
    }

    /// Painless script for content-aware upserts
    fn upsert_script(&self) -> String {
        format!(
            "if (ctx._source['{hash}'] == params.hash) {{ \
               ctx._source['{batch}'] = params.batch; \
             }} else {{ \
               ctx._source.clear(); ctx._source.putAll(params.doc); \
               ctx._source['{hash}'] = params.hash; \
               ctx._source['{batch}'] = params.batch; \
               ctx._source['{updated}'] = params.batch; \
             }}",
            hash = self.config.content_hash_field,
            batch = self.config.batch_index_date_field,
            updated = self.config.last_updated_field,
        )
    }

    /// Render one document as bulk action + body lines
    fn bulk_lines<D: SyncDocument>(&self, index: &str, doc: &D, out: &mut String) -> Result<()> {
        let source = serde_json::to_value(doc)?;
        let Value::Object(mut source) = source else {
            return Err(SyncError::Serialization {
                message: "documents must serialize to JSON objects".to_string(),
                source: None,
            });
        };
        let content_hash = content_hash(&source);
        let batch = format_timestamp(self.batch_timestamp);

        match doc.document_id() {
            Some(id) => {
                let action = json!({
                    "update": { "_index": index, "_id": id, "retry_on_conflict": 3 }
                });
                let body = json!({
                    "scripted_upsert": true,
                    "script": {
                        "lang": "painless",
                        "source": self.upsert_script(),
                        "params": { "doc": source, "hash": content_hash, "batch": batch }
                    },
                    "upsert": {}
                });
                out.push_str(&serde_json::to_string(&action)?);
                out.push('\n');
                out.push_str(&serde_json::to_string(&body)?);
                out.push('\n');
            }
            None => {
                source.insert(self.config.content_hash_field.clone(), json!(content_hash));
                source.insert(self.config.batch_index_date_field.clone(), json!(batch));
                source.insert(self.config.last_updated_field.clone(), json!(batch));
                let action = json!({ "index": { "_index": index } });
                out.push_str(&serde_json::to_string(&action)?);
                out.push('\n');
                out.push_str(&serde_json::to_string(&source)?);
                out.push('\n');
            }
        }
        Ok(())
    }

    async fn flush<D: SyncDocument>(&self, batch: Vec<D>) {
        if batch.is_empty() {
            return;
        }

        let count = batch.len() as u64;
        let index = self.current_index();
        let mut body = String::new();
        let mut rejected = 0u64;
        for doc in &batch {
            if let Err(e) = self.bulk_lines(&index, doc, &mut body) {
                warn!(error = %e, index = %index, "Skipping document that cannot be encoded");
                rejected += 1;
            }
        }

        match self.transport.bulk(body).await {
            Ok(response) => {
                let failures = response.failures();
                for (id, reason) in failures.iter().take(10) {
                    warn!(doc_id = %id, reason = %reason, index = %index, "Document rejected");
                }
                if let Some((id, reason)) = failures.first() {
                    self.record_failure(format!(
                        "{} documents rejected on `{}`, first `{}`: {}",
                        failures.len(),
                        index,
                        id,
                        reason
                    ));
                }
                rejected += failures.len() as u64;
                self.metrics
                    .record_docs_indexed(count.saturating_sub(rejected), &index);
                if rejected > 0 {
                    self.metrics.record_docs_failed(rejected, &index);
                }
                debug!(count, rejected, index = %index, "Flushed batch");
            }
            Err(e) => {
                error!(error = %e, count, index = %index, "Bulk write failed");
                self.metrics.record_docs_failed(count, &index);
                self.record_failure(format!("{} documents lost on `{}`: {}", count, index, e));
            }
        }

        let remaining = self.outstanding.fetch_sub(count, Ordering::SeqCst) - count;
        self.metrics.set_buffer_size(remaining);
        self.settled.notify_waiters();
    }
}

/// Digest of a document's own content, before stamping
fn content_hash(source: &Map<String, Value>) -> String {
    let canonical = Value::Object(source.clone()).to_string();
    let mut hash = hex::encode(Sha256::digest(canonical.as_bytes()));
    hash.truncate(16);
    hash
}

async fn run_worker<D: SyncDocument>(shared: Arc<Shared>, mut rx: mpsc::Receiver<D>) {
    let mut batcher = Batcher::new(shared.config.bulk_size, shared.config.flush_interval);

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(doc) => {
                    batcher.add(doc);
                    if batcher.should_flush() {
                        shared.flush(batcher.drain()).await;
                    }
                }
                None => break,
            },
            _ = tokio::time::sleep(batcher.time_until_due()), if !batcher.is_empty() => {
                shared.flush(batcher.drain()).await;
            }
            _ = shared.flush_requested.notified() => {
                while let Ok(doc) = rx.try_recv() {
                    batcher.add(doc);
                    if batcher.is_full() {
                        shared.flush(batcher.drain()).await;
                    }
                }
                shared.flush(batcher.drain()).await;
            }
        }
    }

    shared.flush(batcher.drain()).await;
    debug!(index = %shared.current_index(), "Channel worker stopped");
}

/// Bulk ingest channel for one target
pub struct BulkIngestChannel<D: SyncDocument> {
    shared: Arc<Shared>,
    sender: RwLock<Option<mpsc::Sender<D>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    _doc: PhantomData<fn(D)>,
}

impl<D: SyncDocument> BulkIngestChannel<D> {
    /// Create a channel and spawn its worker on the current runtime
    pub fn new(
        transport: Arc<dyn ClusterApi>,
        descriptor: Arc<TypeDescriptor>,
        batch_timestamp: DateTime<Utc>,
        config: ChannelConfig,
    ) -> Result<Self> {
        if config.buffer_capacity == 0 || config.bulk_size == 0 {
            return Err(SyncError::config("channel buffer and bulk size must be positive"));
        }

        let index_name = descriptor.concrete_index_name(batch_timestamp)?;
        let (tx, rx) = mpsc::channel(config.buffer_capacity);
        let shared = Arc::new(Shared {
            transport,
            metrics: ChannelMetrics::new(format!("channel_{}", descriptor.name)),
            schema_hash: descriptor.schema_hash(),
            descriptor,
            config,
            batch_timestamp,
            index_name: RwLock::new(index_name),
            outstanding: AtomicU64::new(0),
            settled: Notify::new(),
            flush_requested: Notify::new(),
            last_failure: Mutex::new(None),
        });

        let worker = tokio::spawn(run_worker(shared.clone(), rx));

        Ok(Self {
            shared,
            sender: RwLock::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            _doc: PhantomData,
        })
    }

    fn sender(&self) -> Option<mpsc::Sender<D>> {
        self.sender.read().ok().and_then(|s| s.clone())
    }

    /// Documents buffered or in flight
    pub fn outstanding(&self) -> u64 {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.shared.descriptor
    }

    /// Register the template unless the stored hash already matches
    ///
    /// Returns whether the stored hash matched.
    async fn register_template(&self) -> Result<bool> {
        let local = self.shared.schema_hash.clone();
        if self.stored_schema_hash().await?.as_deref() == Some(local.as_str()) {
            debug!(type_name = %self.shared.descriptor.name, hash = %local, "Template up to date");
            return Ok(true);
        }

        let descriptor = &self.shared.descriptor;
        let body = json!({
            "index_patterns": descriptor.index_patterns()?,
            "priority": 100,
            "template": {
                "settings": descriptor.settings,
                "mappings": descriptor.mappings,
            },
            "_meta": { "hash": local, "managed_by": "es-sync" }
        });
        self.shared
            .transport
            .put_index_template(&descriptor.template_name()?, &body)
            .await?;
        info!(type_name = %descriptor.name, hash = %local, "Registered index template");
        Ok(false)
    }

    /// Pick the concrete index for this run
    ///
    /// A rotating target keeps writing into the index behind its write alias
    /// as long as the schema did not change.
    async fn resolve_index(&self, schema_matched: bool) -> Result<()> {
        let descriptor = &self.shared.descriptor;
        if !descriptor.is_rotating() || !schema_matched {
            return Ok(());
        }
        let alias = descriptor.write_alias()?;
        if let Some(existing) = self.shared.transport.resolve_alias(&alias).await?.pop() {
            debug!(alias = %alias, index = %existing, "Reusing current index");
            self.shared.set_index(existing);
        }
        Ok(())
    }
}

#[async_trait]
impl<D: SyncDocument> IngestChannel<D> for BulkIngestChannel<D> {
    fn try_write(&self, item: D) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                false
            }
        }
    }

    async fn wait_to_write(&self, item: D) -> Result<bool> {
        let Some(tx) = self.sender() else {
            return Ok(false);
        };
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        match tx.send(item).await {
            Ok(()) => Ok(true),
            Err(_) => {
                self.shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    async fn bootstrap(&self, method: BootstrapMethod) -> Result<bool> {
        if method == BootstrapMethod::None {
            return Ok(true);
        }

        let target = self.shared.descriptor.name.clone();
        let outcome = match self.register_template().await {
            Ok(matched) => self.resolve_index(matched).await,
            Err(e) => Err(e),
        };

        match (outcome, method) {
            (Ok(()), _) => Ok(true),
            (Err(e), BootstrapMethod::Silent) => {
                warn!(type_name = %target, error = %e, "Bootstrap failed, continuing");
                Ok(false)
            }
            (Err(e), _) => Err(SyncError::bootstrap(target, e.to_string())),
        }
    }

    async fn drain(&self, max_wait: Option<Duration>) -> Result<()> {
        let wait_for_empty = async {
            loop {
                let settled = self.shared.settled.notified();
                tokio::pin!(settled);
                settled.as_mut().enable();

                if self.outstanding() == 0 {
                    break;
                }
                self.shared.flush_requested.notify_one();
                settled.await;
            }
        };

        match max_wait {
            Some(limit) => {
                if tokio::time::timeout(limit, wait_for_empty).await.is_err() {
                    warn!(
                        index = %self.shared.current_index(),
                        outstanding = self.outstanding(),
                        waited_ms = limit.as_millis() as u64,
                        "Drain wait elapsed with documents still buffered"
                    );
                }
            }
            None => wait_for_empty.await,
        }

        match self.shared.take_failure() {
            Some(message) => Err(SyncError::elasticsearch(message)),
            None => Ok(()),
        }
    }

    async fn refresh(&self) -> Result<bool> {
        self.shared
            .transport
            .refresh(&self.shared.current_index())
            .await
    }

    async fn apply_aliases(&self, index_name: &str) -> Result<bool> {
        let descriptor = &self.shared.descriptor;
        let target = descriptor.target()?;
        let mut actions = Vec::new();

        if descriptor.is_rotating() {
            let pattern = format!("{}-*", target);
            let write_alias = descriptor.write_alias()?;
            actions.push(json!({
                "remove": { "index": pattern, "alias": write_alias, "must_exist": false }
            }));
            actions.push(json!({
                "add": { "index": index_name, "alias": write_alias, "is_write_index": true }
            }));
            if let Some(ref read_alias) = descriptor.read_alias {
                actions.push(json!({
                    "remove": { "index": pattern, "alias": read_alias, "must_exist": false }
                }));
            }
        }
        if let Some(ref read_alias) = descriptor.read_alias {
            actions.push(json!({ "add": { "index": index_name, "alias": read_alias } }));
        }

        if actions.is_empty() {
            return Ok(true);
        }
        let acknowledged = self.shared.transport.update_aliases(actions).await?;
        debug!(index = index_name, acknowledged, "Applied aliases");
        Ok(acknowledged)
    }

    async fn stored_schema_hash(&self) -> Result<Option<String>> {
        let name = self.shared.descriptor.template_name()?;
        let template = self.shared.transport.get_index_template(&name).await?;
        Ok(template.and_then(|t| t["_meta"]["hash"].as_str().map(str::to_string)))
    }

    fn channel_hash(&self) -> String {
        self.shared.schema_hash.clone()
    }

    fn index_name(&self) -> String {
        self.shared.current_index()
    }

    async fn close(&self) -> Result<()> {
        let sender = match self.sender.write() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        if let Some(worker) = self.worker.lock().await.take() {
            worker
                .await
                .map_err(|e| SyncError::Internal(format!("channel worker panicked: {}", e)))?;
        }
        Ok(())
    }
}

/// Creates [`BulkIngestChannel`]s for the orchestrator
#[derive(Debug, Clone, Default)]
pub struct BulkChannelFactory {
    config: ChannelConfig,
}

impl BulkChannelFactory {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }
}

impl<D: SyncDocument> ChannelFactory<D> for BulkChannelFactory {
    fn create(
        &self,
        transport: Arc<dyn ClusterApi>,
        descriptor: Arc<TypeDescriptor>,
        batch_timestamp: DateTime<Utc>,
    ) -> Result<Arc<dyn IngestChannel<D>>> {
        let channel =
            BulkIngestChannel::<D>::new(transport, descriptor, batch_timestamp, self.config.clone())?;
        Ok(Arc::new(channel))
    }
}
