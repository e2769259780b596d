//! Incremental dual-target sync orchestrator
//!
//! Owns one ingest channel per target, resolves the sync strategy while
//! starting, fans writes out accordingly, and drives the completion protocol:
//!
//! ```text
//! Started → Draining → Reconciling → Purging → AliasSwitching → Refreshing → PostHookRunning → Done
//! ```
//!
//! Phases run strictly in sequence. Nothing is rolled back: a failure or a
//! cancellation leaves whatever earlier phases already committed.

use crate::context::{
    resolve_concrete_index, PostCompleteHook, PreBootstrapTask, ResolvedTargets, SyncContext,
    TargetAliases,
};
use crate::resolver::{SchemaCheck, StrategyResolver, SyncStrategy};
use crate::tasks::{self, TaskMonitor, TaskOutcome};
use chrono::{DateTime, Utc};
use es_sync_core::prelude::*;
use es_sync_core::{
    ChannelConfig, ErrorContext, ErrorContextExt, LatencyTimer, OrchestratorConfig, SyncMetrics,
};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "orchestrator";

/// States of the completion protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPhase {
    Started,
    Draining,
    Reconciling,
    Purging,
    AliasSwitching,
    Refreshing,
    PostHookRunning,
    Done,
}

impl CompletionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Draining => "draining",
            Self::Reconciling => "reconciling",
            Self::Purging => "purging",
            Self::AliasSwitching => "alias_switching",
            Self::Refreshing => "refreshing",
            Self::PostHookRunning => "post_hook_running",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for CompletionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields the range queries of the completion protocol run against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateFields {
    /// Stamped when a document's content changed
    pub last_updated: String,
    /// Stamped on every write
    pub batch_index_date: String,
}

impl Default for DateFields {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

impl From<&ChannelConfig> for DateFields {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            last_updated: config.last_updated_field.clone(),
            batch_index_date: config.batch_index_date_field.clone(),
        }
    }
}

struct Channels<D: SyncDocument> {
    primary: Arc<dyn IngestChannel<D>>,
    secondary: Arc<dyn IngestChannel<D>>,
}

/// Coordinates writes into a primary and a secondary target
pub struct IncrementalSyncOrchestrator<D: SyncDocument> {
    transport: Arc<dyn ClusterApi>,
    factory: Arc<dyn ChannelFactory<D>>,
    primary: Arc<TypeDescriptor>,
    secondary: Arc<TypeDescriptor>,
    batch_timestamp: DateTime<Utc>,
    run_id: Uuid,
    config: OrchestratorConfig,
    fields: DateFields,
    cancel: CancellationToken,
    metrics: SyncMetrics,
    channels: Option<Channels<D>>,
    strategy: SyncStrategy,
    targets: ResolvedTargets,
    pre_bootstrap_tasks: Vec<PreBootstrapTask>,
    post_complete_hook: Option<PostCompleteHook>,
}

impl<D: SyncDocument> IncrementalSyncOrchestrator<D> {
    /// Create an orchestrator; the batch timestamp is captured here
    pub fn new(
        transport: Arc<dyn ClusterApi>,
        factory: Arc<dyn ChannelFactory<D>>,
        primary: Arc<TypeDescriptor>,
        secondary: Arc<TypeDescriptor>,
    ) -> Self {
        Self {
            transport,
            factory,
            primary,
            secondary,
            batch_timestamp: Utc::now(),
            run_id: Uuid::now_v7(),
            config: OrchestratorConfig::default(),
            fields: DateFields::default(),
            cancel: CancellationToken::new(),
            metrics: SyncMetrics::new(COMPONENT),
            channels: None,
            strategy: SyncStrategy::default(),
            targets: ResolvedTargets::default(),
            pre_bootstrap_tasks: Vec::new(),
            post_complete_hook: None,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_date_fields(mut self, fields: DateFields) -> Self {
        self.fields = fields;
        self
    }

    /// Register a task run before either schema is bootstrapped
    ///
    /// Tasks run once per `start`, in registration order, each awaited
    /// before the next begins.
    pub fn add_pre_bootstrap_task<F, Fut>(mut self, task: F) -> Self
    where
        F: Fn(Arc<dyn ClusterApi>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.pre_bootstrap_tasks
            .push(Box::new(move |transport| task(transport).boxed()));
        self
    }

    /// Register the hook run at the end of `complete`
    pub fn on_complete<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(SyncContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.post_complete_hook = Some(Box::new(move |ctx| hook(ctx).boxed()));
        self
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    pub fn batch_timestamp(&self) -> DateTime<Utc> {
        self.batch_timestamp
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn targets(&self) -> &ResolvedTargets {
        &self.targets
    }

    pub fn is_started(&self) -> bool {
        self.channels.is_some()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    /// Create both channels, bootstrap their schemas and resolve the strategy
    ///
    /// Calling this again re-creates the channels and bootstraps again.
    pub async fn start(&mut self, method: BootstrapMethod) -> Result<SyncStrategy> {
        info!(
            run_id = %self.run_id,
            primary = %self.primary.name,
            secondary = %self.secondary.name,
            bootstrap = %method,
            batch_timestamp = %self.batch_timestamp,
            "Starting incremental sync"
        );

        self.channels = None;
        self.strategy = SyncStrategy::default();

        let channels = Channels {
            primary: self.factory.create(
                self.transport.clone(),
                self.primary.clone(),
                self.batch_timestamp,
            )?,
            secondary: self.factory.create(
                self.transport.clone(),
                self.secondary.clone(),
                self.batch_timestamp,
            )?,
        };

        let resolved = match self.bootstrap_channels(&channels, method).await {
            Ok(resolved) => resolved,
            Err(e) => {
                for channel in [&channels.primary, &channels.secondary] {
                    if let Err(close_err) = channel.close().await {
                        warn!(error = %close_err, "Failed to close channel after failed start");
                    }
                }
                return Err(e);
            }
        };

        let (strategy, targets) = resolved;
        self.strategy = strategy;
        self.targets = targets;
        self.channels = Some(channels);
        self.metrics.record_strategy(strategy.as_str());

        info!(
            run_id = %self.run_id,
            strategy = %strategy,
            primary_write_alias = %self.targets.primary_write_alias,
            secondary_write_alias = %self.targets.secondary_write_alias,
            reindex_target = ?self.targets.secondary_reindex_target,
            "Sync strategy resolved"
        );
        Ok(strategy)
    }

    async fn bootstrap_channels(
        &self,
        channels: &Channels<D>,
        method: BootstrapMethod,
    ) -> Result<(SyncStrategy, ResolvedTargets)> {
        for (position, task) in self.pre_bootstrap_tasks.iter().enumerate() {
            debug!(position, "Running pre-bootstrap task");
            self.checkpoint(task(self.transport.clone()))
                .await
                .with_context(ErrorContext::new(COMPONENT, "pre_bootstrap_task"))?;
        }

        let mut resolver = StrategyResolver::new();

        let primary_hash = self.stored_hash(&*channels.primary, &self.primary.name).await?;
        resolver.observe_schema(
            &self.primary.name,
            &SchemaCheck::new(channels.primary.channel_hash(), primary_hash),
        );
        self.bootstrap(&*channels.primary, &self.primary.name, method)
            .await?;

        let primary_write_alias = self.primary.write_alias()?;
        let secondary_write_alias = self.secondary.write_alias()?;
        let secondary_exists = self
            .checkpoint(self.transport.exists(&secondary_write_alias))
            .await
            .with_context(
                ErrorContext::new(COMPONENT, "check_secondary").with_index(&secondary_write_alias),
            )?;
        resolver.observe_secondary(&secondary_write_alias, secondary_exists);

        let secondary_hash = self
            .stored_hash(&*channels.secondary, &self.secondary.name)
            .await?;
        resolver.observe_schema(
            &self.secondary.name,
            &SchemaCheck::new(channels.secondary.channel_hash(), secondary_hash),
        );
        self.bootstrap(&*channels.secondary, &self.secondary.name, method)
            .await?;

        let strategy = resolver.strategy();
        let secondary_reindex_target = match strategy {
            SyncStrategy::Reindex => {
                let concrete = self
                    .checkpoint(resolve_concrete_index(&*self.transport, &secondary_write_alias))
                    .await
                    .with_context(
                        ErrorContext::new(COMPONENT, "resolve_reindex_target")
                            .with_index(&secondary_write_alias),
                    )?;
                // a plain index exists but has no alias entry
                concrete.or_else(|| secondary_exists.then(|| secondary_write_alias.clone()))
            }
            SyncStrategy::Multiplex => None,
        };

        Ok((
            strategy,
            ResolvedTargets {
                primary_write_alias,
                secondary_write_alias,
                primary_index: channels.primary.index_name(),
                secondary_index: channels.secondary.index_name(),
                secondary_reindex_target,
            },
        ))
    }

    /// An unreadable stored hash counts as absent
    async fn stored_hash(
        &self,
        channel: &dyn IngestChannel<D>,
        type_name: &str,
    ) -> Result<Option<String>> {
        match self.checkpoint(channel.stored_schema_hash()).await {
            Ok(hash) => Ok(hash),
            Err(SyncError::Cancelled) => Err(SyncError::Cancelled),
            Err(e) => {
                warn!(type_name, error = %e, "Stored schema hash unreadable, treating as drift");
                Ok(None)
            }
        }
    }

    async fn bootstrap(
        &self,
        channel: &dyn IngestChannel<D>,
        type_name: &str,
        method: BootstrapMethod,
    ) -> Result<()> {
        let ready = self
            .checkpoint(channel.bootstrap(method))
            .await
            .with_context(ErrorContext::new(COMPONENT, "bootstrap").with_index(type_name))?;
        if !ready {
            warn!(type_name, bootstrap = %method, "Schema is not in the desired state");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    fn channels(&self, operation: &'static str) -> Result<&Channels<D>> {
        self.channels
            .as_ref()
            .ok_or_else(|| SyncError::not_started(operation))
    }

    fn accepted(&self, descriptor: &TypeDescriptor, accepted: bool) -> bool {
        if !accepted {
            self.metrics.record_write_rejected(&descriptor.name);
        }
        accepted
    }

    /// Buffer a document without waiting
    ///
    /// Under `Multiplex` both channels are always offered the document and the
    /// result is `true` only if both accepted it.
    pub fn try_write(&self, item: D) -> Result<bool> {
        let channels = self.channels("try_write")?;
        match self.strategy {
            SyncStrategy::Reindex => {
                Ok(self.accepted(&self.primary, channels.primary.try_write(item)))
            }
            SyncStrategy::Multiplex => {
                let primary = self.accepted(&self.primary, channels.primary.try_write(item.clone()));
                let secondary = self.accepted(&self.secondary, channels.secondary.try_write(item));
                Ok(primary & secondary)
            }
        }
    }

    /// Buffer a document, waiting for room
    pub async fn wait_to_write(&self, item: D) -> Result<bool> {
        let channels = self.channels("wait_to_write")?;
        match self.strategy {
            SyncStrategy::Reindex => {
                let accepted = self
                    .checkpoint(channels.primary.wait_to_write(item))
                    .await?;
                Ok(self.accepted(&self.primary, accepted))
            }
            SyncStrategy::Multiplex => {
                let primary = self
                    .checkpoint(channels.primary.wait_to_write(item.clone()))
                    .await;
                let secondary = self
                    .checkpoint(channels.secondary.wait_to_write(item))
                    .await;
                let primary = self.accepted(&self.primary, primary?);
                let secondary = self.accepted(&self.secondary, secondary?);
                Ok(primary & secondary)
            }
        }
    }

    /// `try_write` over every item; written items stay written
    pub fn try_write_many<I>(&self, items: I) -> Result<bool>
    where
        I: IntoIterator<Item = D>,
    {
        let mut all = true;
        for item in items {
            all &= self.try_write(item)?;
        }
        Ok(all)
    }

    /// `wait_to_write` over every item; written items stay written
    pub async fn wait_to_write_many<I>(&self, items: I) -> Result<bool>
    where
        I: IntoIterator<Item = D>,
    {
        let mut all = true;
        for item in items {
            all &= self.wait_to_write(item).await?;
        }
        Ok(all)
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Run the completion protocol for the resolved strategy
    ///
    /// Returns `true` when every refresh and alias switch was acknowledged.
    /// `max_drain_wait` falls back to the configured bound.
    pub async fn complete(&self, max_drain_wait: Option<Duration>) -> Result<bool> {
        let channels = self.channels("complete")?;
        let max_wait = max_drain_wait.or(self.config.max_drain_wait);

        info!(
            run_id = %self.run_id,
            strategy = %self.strategy,
            phase = %CompletionPhase::Started,
            max_drain_wait = ?max_wait,
            "Completing incremental sync"
        );

        let acknowledged = match self.strategy {
            SyncStrategy::Reindex => self.complete_reindex(channels, max_wait).await?,
            SyncStrategy::Multiplex => self.complete_multiplex(channels, max_wait).await?,
        };

        if let Some(hook) = &self.post_complete_hook {
            let _phase = self.enter(CompletionPhase::PostHookRunning);
            self.checkpoint(hook(self.context()))
                .await
                .map_err(|e| match e {
                    SyncError::Cancelled => SyncError::Cancelled,
                    other => SyncError::hook(other.to_string()),
                })
                .with_context(
                    ErrorContext::new(COMPONENT, "complete")
                        .with_phase(CompletionPhase::PostHookRunning),
                )?;
        }

        info!(
            run_id = %self.run_id,
            strategy = %self.strategy,
            phase = %CompletionPhase::Done,
            acknowledged,
            "Incremental sync complete"
        );
        Ok(acknowledged)
    }

    async fn complete_reindex(
        &self,
        channels: &Channels<D>,
        max_wait: Option<Duration>,
    ) -> Result<bool> {
        let targets = &self.targets;
        let mut acknowledged = true;

        {
            let _phase = self.enter(CompletionPhase::Draining);
            acknowledged &= self
                .settle(
                    CompletionPhase::Draining,
                    &*channels.primary,
                    &targets.primary_write_alias,
                    max_wait,
                )
                .await?;
        }

        let dest = {
            let phase = CompletionPhase::Reconciling;
            let _phase = self.enter(phase);
            let dest = match &targets.secondary_reindex_target {
                Some(dest) => dest.clone(),
                None => self.create_reindex_target(channels).await?,
            };

            let source = &targets.primary_write_alias;
            let updates = tasks::changed_documents_body(
                source,
                &dest,
                &self.fields.last_updated,
                self.batch_timestamp,
            );
            self.run_task(phase, &dest, tasks::start_reindex(&*self.transport, &updates))
                .await?;

            let deletions = tasks::stale_documents_delete_body(
                source,
                &dest,
                &self.fields.batch_index_date,
                self.batch_timestamp,
            );
            self.run_task(phase, &dest, tasks::start_reindex(&*self.transport, &deletions))
                .await?;
            dest
        };

        self.purge_primary().await?;

        {
            let phase = CompletionPhase::AliasSwitching;
            let _phase = self.enter(phase);
            let primary_index = channels.primary.index_name();
            acknowledged &= self
                .step(
                    phase,
                    &targets.primary_write_alias,
                    channels.primary.apply_aliases(&primary_index),
                )
                .await?;
            acknowledged &= self
                .step(phase, &dest, channels.secondary.apply_aliases(&dest))
                .await?;
        }

        {
            let phase = CompletionPhase::Refreshing;
            let _phase = self.enter(phase);
            acknowledged &= self
                .step(phase, &targets.primary_write_alias, channels.primary.refresh())
                .await?;
            acknowledged &= self
                .step(phase, &dest, channels.secondary.refresh())
                .await?;
        }

        Ok(acknowledged)
    }

    async fn complete_multiplex(
        &self,
        channels: &Channels<D>,
        max_wait: Option<Duration>,
    ) -> Result<bool> {
        let targets = &self.targets;
        let mut acknowledged = true;

        {
            let _phase = self.enter(CompletionPhase::Draining);
            acknowledged &= self
                .settle(
                    CompletionPhase::Draining,
                    &*channels.primary,
                    &targets.primary_write_alias,
                    max_wait,
                )
                .await?;
            acknowledged &= self
                .settle(
                    CompletionPhase::Draining,
                    &*channels.secondary,
                    &targets.secondary_write_alias,
                    max_wait,
                )
                .await?;
        }

        self.purge_primary().await?;

        {
            let phase = CompletionPhase::Refreshing;
            let _phase = self.enter(phase);
            acknowledged &= self
                .step(phase, &targets.primary_write_alias, channels.primary.refresh())
                .await?;
        }

        Ok(acknowledged)
    }

    /// Drain, refresh, then point the aliases at the channel's index
    async fn settle(
        &self,
        phase: CompletionPhase,
        channel: &dyn IngestChannel<D>,
        label: &str,
        max_wait: Option<Duration>,
    ) -> Result<bool> {
        self.step(phase, label, channel.drain(max_wait)).await?;
        let refreshed = self.step(phase, label, channel.refresh()).await?;
        let index = channel.index_name();
        let aliased = self
            .step(phase, label, channel.apply_aliases(&index))
            .await?;
        Ok(refreshed & aliased)
    }

    /// Bootstrap the secondary strictly and create its concrete index
    async fn create_reindex_target(&self, channels: &Channels<D>) -> Result<String> {
        let phase = CompletionPhase::Reconciling;
        let alias = &self.targets.secondary_write_alias;
        warn!(
            alias = %alias,
            "No concrete index behind the secondary write alias, creating one"
        );

        self.step(
            phase,
            alias,
            channels.secondary.bootstrap(BootstrapMethod::Failure),
        )
        .await?;
        let index = channels.secondary.index_name();
        let created = self
            .step(phase, &index, self.transport.create_index(&index))
            .await?;
        if !created {
            debug!(index = %index, "Reindex target already existed");
        }
        Ok(index)
    }

    /// Delete primary documents not seen in this batch
    async fn purge_primary(&self) -> Result<TaskOutcome> {
        let phase = CompletionPhase::Purging;
        let _phase = self.enter(phase);
        let target = &self.targets.primary_write_alias;
        let query = tasks::stale_documents_query(&self.fields.batch_index_date, self.batch_timestamp);
        self.run_task(
            phase,
            target,
            tasks::start_delete_by_query(&*self.transport, target, &query),
        )
        .await
    }

    async fn run_task<F>(&self, phase: CompletionPhase, index: &str, start: F) -> Result<TaskOutcome>
    where
        F: Future<Output = Result<Option<String>>>,
    {
        let task_id = self.step(phase, index, start).await?;
        let monitor = TaskMonitor::new(
            &*self.transport,
            self.config.task_poll_interval,
            &self.cancel,
            &self.metrics,
        );
        let outcome = monitor.wait(task_id.as_deref()).await;
        self.in_phase(phase, index, outcome)
    }

    // ------------------------------------------------------------------
    // Utility surface
    // ------------------------------------------------------------------

    pub async fn drain_all(&self, max_wait: Option<Duration>) -> Result<()> {
        let channels = self.channels("drain_all")?;
        self.checkpoint(channels.primary.drain(max_wait)).await?;
        self.checkpoint(channels.secondary.drain(max_wait)).await
    }

    pub async fn refresh_all(&self) -> Result<bool> {
        let channels = self.channels("refresh_all")?;
        let primary = self.checkpoint(channels.primary.refresh()).await?;
        let secondary = self.checkpoint(channels.secondary.refresh()).await?;
        Ok(primary & secondary)
    }

    pub async fn apply_all_aliases(&self) -> Result<bool> {
        let channels = self.channels("apply_all_aliases")?;
        let primary_index = channels.primary.index_name();
        let secondary_index = match (&self.strategy, &self.targets.secondary_reindex_target) {
            (SyncStrategy::Reindex, Some(dest)) => dest.clone(),
            _ => channels.secondary.index_name(),
        };
        let primary = self
            .checkpoint(channels.primary.apply_aliases(&primary_index))
            .await?;
        let secondary = self
            .checkpoint(channels.secondary.apply_aliases(&secondary_index))
            .await?;
        Ok(primary & secondary)
    }

    /// Close both channels; a no-op when not started
    pub async fn dispose(&mut self) -> Result<()> {
        let Some(channels) = self.channels.take() else {
            return Ok(());
        };
        let primary = channels.primary.close().await;
        let secondary = channels.secondary.close().await;
        info!(run_id = %self.run_id, "Orchestrator disposed");
        primary.and(secondary)
    }

    /// Snapshot handed to the post-complete hook
    pub fn context(&self) -> SyncContext {
        SyncContext {
            transport: self.transport.clone(),
            run_id: self.run_id,
            strategy: self.strategy,
            batch_timestamp: self.batch_timestamp,
            primary: TargetAliases {
                write_alias: self.targets.primary_write_alias.clone(),
                read_alias: self.primary.read_alias.clone(),
            },
            secondary: TargetAliases {
                write_alias: self.targets.secondary_write_alias.clone(),
                read_alias: self.secondary.read_alias.clone(),
            },
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    /// Await `fut` unless the token fires first
    async fn checkpoint<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = fut => result,
        }
    }

    async fn step<T, F>(&self, phase: CompletionPhase, index: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let result = self.checkpoint(fut).await;
        self.in_phase(phase, index, result)
    }

    fn in_phase<T>(&self, phase: CompletionPhase, index: &str, result: Result<T>) -> Result<T> {
        result
            .with_context(
                ErrorContext::new(COMPONENT, "complete")
                    .with_phase(phase)
                    .with_index(index),
            )
            .map_err(|e| match e {
                SyncError::Cancelled => SyncError::Cancelled,
                other => SyncError::phase(phase, index, other.to_string()),
            })
    }

    fn enter(&self, phase: CompletionPhase) -> LatencyTimer<impl FnOnce(Duration)> {
        info!(run_id = %self.run_id, phase = %phase, "Entering completion phase");
        let metrics = self.metrics.clone();
        LatencyTimer::start(move |elapsed| metrics.record_phase_duration(phase.as_str(), elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CallLog, MockChannel, MockCluster, MockFactory};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const PRIMARY_TARGET: &str = "docs-a";
    const SECONDARY_TARGET: &str = "docs-b";

    struct Fixture {
        log: CallLog,
        primary: Arc<MockChannel>,
        secondary: Arc<MockChannel>,
        factory: Arc<MockFactory>,
        orchestrator: IncrementalSyncOrchestrator<Value>,
    }

    fn fixture(log: CallLog, cluster: MockCluster, secondary: MockChannel) -> Fixture {
        let cluster = Arc::new(cluster.with_log(log.clone()));
        let primary = Arc::new(MockChannel::new("primary", log.clone(), PRIMARY_TARGET));
        let secondary = Arc::new(secondary);
        let factory = Arc::new(MockFactory::new(
            ("primary", primary.clone()),
            ("secondary", secondary.clone()),
        ));

        let orchestrator = IncrementalSyncOrchestrator::<Value>::new(
            cluster,
            factory.clone(),
            Arc::new(TypeDescriptor::new("primary").with_write_target(PRIMARY_TARGET)),
            Arc::new(
                TypeDescriptor::new("secondary")
                    .with_write_target(SECONDARY_TARGET)
                    .with_read_alias("docs"),
            ),
        )
        .with_config(OrchestratorConfig {
            task_poll_interval: Duration::from_millis(1),
            ..Default::default()
        });

        Fixture {
            log,
            primary,
            secondary,
            factory,
            orchestrator,
        }
    }

    /// Both hashes match and the secondary exists behind an alias
    fn reindex_fixture() -> Fixture {
        let log = CallLog::default();
        fixture(
            log.clone(),
            MockCluster::new().with_alias(SECONDARY_TARGET, &["docs-b-000002", "docs-b-000001"]),
            MockChannel::new("secondary", log, SECONDARY_TARGET),
        )
    }

    fn multiplex_fixture() -> Fixture {
        let log = CallLog::default();
        fixture(
            log.clone(),
            MockCluster::new().with_missing(SECONDARY_TARGET),
            MockChannel::new("secondary", log, SECONDARY_TARGET),
        )
    }

    #[tokio::test]
    async fn test_missing_secondary_forces_multiplex() {
        let mut f = multiplex_fixture();
        let strategy = f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();

        assert_eq!(strategy, SyncStrategy::Multiplex);
        assert_eq!(f.orchestrator.strategy(), SyncStrategy::Multiplex);
        assert!(f.orchestrator.targets().secondary_reindex_target.is_none());
        assert_eq!(f.log.count("resolve-alias(docs-b)"), 0);
    }

    #[tokio::test]
    async fn test_secondary_drift_forces_multiplex() {
        let log = CallLog::default();
        let mut f = fixture(
            log.clone(),
            MockCluster::new().with_alias(SECONDARY_TARGET, &["docs-b-000001"]),
            MockChannel::new("secondary", log, SECONDARY_TARGET).with_stored_hash(Some("old")),
        );
        let strategy = f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        assert_eq!(strategy, SyncStrategy::Multiplex);
    }

    #[tokio::test]
    async fn test_start_order_and_reindex_target() {
        let log = CallLog::default();
        let first = log.clone();
        let second = log.clone();
        let mut f = fixture(
            log.clone(),
            MockCluster::new().with_alias(SECONDARY_TARGET, &["docs-b-000002", "docs-b-000001"]),
            MockChannel::new("secondary", log, SECONDARY_TARGET),
        );
        f.orchestrator = f
            .orchestrator
            .add_pre_bootstrap_task(move |_transport| {
                let log = first.clone();
                async move {
                    log.push("task-1");
                    Ok(())
                }
            })
            .add_pre_bootstrap_task(move |_transport| {
                let log = second.clone();
                async move {
                    log.push("task-2");
                    Ok(())
                }
            });

        let strategy = f.orchestrator.start(BootstrapMethod::Silent).await.unwrap();

        assert_eq!(strategy, SyncStrategy::Reindex);
        assert_eq!(
            f.log.calls(),
            vec![
                "task-1",
                "task-2",
                "bootstrap(primary)",
                "exists(docs-b)",
                "bootstrap(secondary)",
                "resolve-alias(docs-b)",
            ]
        );
        assert_eq!(
            f.orchestrator.targets().secondary_reindex_target.as_deref(),
            Some("docs-b-000002")
        );
        assert_eq!(f.secondary.bootstrap_methods(), vec![BootstrapMethod::Silent]);
    }

    #[tokio::test]
    async fn test_failed_pre_bootstrap_task_aborts_start() {
        let mut f = reindex_fixture();
        f.orchestrator = f.orchestrator.add_pre_bootstrap_task(|_transport| async {
            Err(SyncError::config("shared pipeline missing"))
        });

        let err = f.orchestrator.start(BootstrapMethod::Failure).await.unwrap_err();
        assert!(matches!(err, SyncError::Configuration { .. }));
        assert!(!f.orchestrator.is_started());
        assert_eq!(f.log.count("bootstrap(primary)"), 0);
        assert_eq!(f.log.count("close(primary)"), 1);
        assert!(f.orchestrator.try_write(json!({"id": 1})).is_err());
    }

    #[tokio::test]
    async fn test_reindex_completion_sequence() {
        let mut f = reindex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.log.clear();

        let acknowledged = f.orchestrator.complete(None).await.unwrap();

        assert!(acknowledged);
        assert_eq!(
            f.log.calls(),
            vec![
                "drain(primary)",
                "refresh(primary)",
                "applyAliases(primary)",
                "reindex-start(updates)",
                "poll",
                "reindex-start(deletions)",
                "poll",
                "delete-by-query(docs-a)",
                "poll",
                "applyAliases(primary)",
                "applyAliases(secondary)",
                "refresh(primary)",
                "refresh(secondary)",
            ]
        );
        assert_eq!(f.secondary.alias_targets(), vec!["docs-b-000002"]);
        assert_eq!(f.primary.alias_targets(), vec!["docs-a", "docs-a"]);
    }

    #[tokio::test]
    async fn test_plain_secondary_index_is_pinned_as_reindex_target() {
        let log = CallLog::default();
        let mut f = fixture(
            log.clone(),
            MockCluster::new(),
            MockChannel::new("secondary", log, SECONDARY_TARGET),
        );
        f.orchestrator.start(BootstrapMethod::Silent).await.unwrap();
        assert_eq!(f.orchestrator.strategy(), SyncStrategy::Reindex);
        assert_eq!(
            f.orchestrator.targets().secondary_reindex_target.as_deref(),
            Some(SECONDARY_TARGET)
        );

        f.orchestrator.complete(None).await.unwrap();

        assert_eq!(f.log.count("create-index(docs-b)"), 0);
        assert_eq!(f.secondary.bootstrap_methods(), vec![BootstrapMethod::Silent]);
        assert_eq!(f.secondary.alias_targets(), vec![SECONDARY_TARGET]);
    }

    #[tokio::test]
    async fn test_reindex_without_concrete_target_creates_one() {
        let log = CallLog::default();
        let mut f = fixture(
            log.clone(),
            MockCluster::new(),
            MockChannel::new("secondary", log, "docs-b-2024.03.09"),
        );
        f.orchestrator.start(BootstrapMethod::Silent).await.unwrap();
        assert_eq!(f.orchestrator.strategy(), SyncStrategy::Reindex);
        f.orchestrator.targets.secondary_reindex_target = None;
        f.log.clear();

        f.orchestrator.complete(None).await.unwrap();

        let calls = f.log.calls();
        assert_eq!(
            &calls[3..6],
            &[
                "bootstrap(secondary)",
                "create-index(docs-b-2024.03.09)",
                "reindex-start(updates)",
            ]
        );
        assert_eq!(
            f.secondary.bootstrap_methods(),
            vec![BootstrapMethod::Silent, BootstrapMethod::Failure]
        );
        assert_eq!(f.secondary.alias_targets(), vec!["docs-b-2024.03.09"]);
    }

    #[tokio::test]
    async fn test_multiplex_completion_sequence() {
        let mut f = multiplex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.log.clear();

        assert!(f.orchestrator.complete(None).await.unwrap());
        assert_eq!(
            f.log.calls(),
            vec![
                "drain(primary)",
                "refresh(primary)",
                "applyAliases(primary)",
                "drain(secondary)",
                "refresh(secondary)",
                "applyAliases(secondary)",
                "delete-by-query(docs-a)",
                "poll",
                "refresh(primary)",
            ]
        );
    }

    fn assert_phase_failure(err: SyncError, expected_phase: &str, expected_target: &str) {
        match err {
            SyncError::Phase { phase, target, .. } => {
                assert_eq!(phase, expected_phase);
                assert_eq!(target, expected_target);
            }
            other => panic!("expected a phase failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_drain_names_phase_and_target() {
        let mut f = multiplex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.secondary.fail_drain();
        f.log.clear();

        let err = f.orchestrator.complete(None).await.unwrap_err();
        assert!(err.to_string().contains("3 documents lost on `docs-b`"));
        assert_phase_failure(err, "draining", SECONDARY_TARGET);
        assert_eq!(f.log.count("refresh(secondary)"), 0);
        assert_eq!(f.log.count("delete-by-query(docs-a)"), 0);
    }

    #[tokio::test]
    async fn test_failed_reindex_names_phase_and_target() {
        let log = CallLog::default();
        let mut f = fixture(
            log.clone(),
            MockCluster::new()
                .with_alias(SECONDARY_TARGET, &["docs-b-000002", "docs-b-000001"])
                .with_failing_reindex(),
            MockChannel::new("secondary", log, SECONDARY_TARGET),
        );
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.log.clear();

        let err = f.orchestrator.complete(None).await.unwrap_err();
        assert_phase_failure(err, "reconciling", "docs-b-000002");
        assert_eq!(f.log.count("reindex-start(updates)"), 1);
        assert_eq!(f.log.count("reindex-start(deletions)"), 0);
        assert_eq!(f.log.count("delete-by-query(docs-a)"), 0);
        assert!(f.secondary.alias_targets().is_empty());
    }

    #[tokio::test]
    async fn test_failed_refresh_names_phase_and_target() {
        let mut f = reindex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.secondary.fail_refresh();

        let err = f.orchestrator.complete(None).await.unwrap_err();
        assert!(err.to_string().contains("index closed"));
        assert_phase_failure(err, "refreshing", "docs-b-000002");
        assert_eq!(f.secondary.alias_targets(), vec!["docs-b-000002"]);
    }

    #[tokio::test]
    async fn test_elapsed_drain_wait_proceeds_with_completion() {
        let mut f = multiplex_fixture();
        f.orchestrator = f.orchestrator.with_config(OrchestratorConfig {
            task_poll_interval: Duration::from_millis(1),
            max_drain_wait: Some(Duration::from_millis(10)),
            ..Default::default()
        });
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.primary.stall_drain();
        f.secondary.stall_drain();

        assert!(f.orchestrator.complete(None).await.unwrap());
        assert!(f.orchestrator.complete(Some(Duration::from_millis(5))).await.unwrap());

        let bounds = vec![Some(Duration::from_millis(10)), Some(Duration::from_millis(5))];
        assert_eq!(f.primary.drain_waits(), bounds);
        assert_eq!(f.secondary.drain_waits(), bounds);
        assert_eq!(f.log.count("delete-by-query(docs-a)"), 2);
    }

    #[tokio::test]
    async fn test_fan_out_follows_strategy() {
        let mut f = multiplex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        for i in 0..5 {
            assert!(f.orchestrator.try_write(json!({"id": i})).unwrap());
        }
        assert_eq!(f.primary.written().len(), 5);
        assert_eq!(f.secondary.written().len(), 5);

        let mut f = reindex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        let docs = (0..5).map(|i| json!({"id": i}));
        assert!(f.orchestrator.wait_to_write_many(docs).await.unwrap());
        assert_eq!(f.primary.written().len(), 5);
        assert!(f.secondary.written().is_empty());
    }

    #[tokio::test]
    async fn test_multiplex_write_does_not_short_circuit() {
        let mut f = multiplex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.primary.reject_writes();

        assert!(!f.orchestrator.try_write(json!({"id": 1})).unwrap());
        assert!(!f.orchestrator.wait_to_write(json!({"id": 2})).await.unwrap());
        assert!(f.primary.written().is_empty());
        assert_eq!(f.secondary.written().len(), 2);

        let docs = vec![json!({"id": 3}), json!({"id": 4})];
        assert!(!f.orchestrator.try_write_many(docs).unwrap());
        assert_eq!(f.secondary.written().len(), 4);
    }

    #[tokio::test]
    async fn test_operations_before_start_fail() {
        let f = reindex_fixture();

        let err = f.orchestrator.try_write(json!({"id": 1})).unwrap_err();
        assert!(err.is_usage_error());
        assert!(f
            .orchestrator
            .wait_to_write(json!({"id": 1}))
            .await
            .unwrap_err()
            .is_usage_error());
        assert!(f.orchestrator.complete(None).await.unwrap_err().is_usage_error());
        assert!(f.orchestrator.refresh_all().await.unwrap_err().is_usage_error());

        assert_eq!(f.factory.created(), 0);
        assert!(f.log.calls().is_empty());
        assert!(!f.orchestrator.is_started());
    }

    #[tokio::test]
    async fn test_batch_timestamp_is_captured_once() {
        let mut f = reindex_fixture();
        let captured = f.orchestrator.batch_timestamp();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.orchestrator.batch_timestamp(), captured);

        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.orchestrator.complete(None).await.unwrap();
        assert_eq!(f.orchestrator.batch_timestamp(), captured);
        assert_eq!(f.factory.timestamps(), vec![captured, captured]);
    }

    #[tokio::test]
    async fn test_post_complete_hook_receives_context() {
        let seen: Arc<Mutex<Option<SyncContext>>> = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let mut f = reindex_fixture();
        f.orchestrator = f.orchestrator.on_complete(move |ctx| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() = Some(ctx);
                Ok(())
            }
        });

        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.orchestrator.complete(None).await.unwrap();

        let ctx = seen.lock().unwrap().clone().expect("hook ran");
        assert_eq!(ctx.strategy, SyncStrategy::Reindex);
        assert_eq!(ctx.run_id, f.orchestrator.run_id());
        assert_eq!(ctx.batch_timestamp, f.orchestrator.batch_timestamp());
        assert_eq!(ctx.primary.write_alias, "docs-a");
        assert_eq!(ctx.secondary.write_alias, "docs-b");
        assert_eq!(ctx.secondary.read_alias.as_deref(), Some("docs"));
    }

    #[tokio::test]
    async fn test_post_complete_hook_failure_propagates() {
        let mut f = multiplex_fixture();
        f.orchestrator = f
            .orchestrator
            .on_complete(|_ctx| async { Err(SyncError::Internal("boom".to_string())) });

        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        let err = f.orchestrator.complete(None).await.unwrap_err();

        assert!(matches!(err, SyncError::Hook { .. }));
        assert!(err.to_string().contains("boom"));
        // aliases were already switched
        assert_eq!(f.log.count("applyAliases(secondary)"), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_completion() {
        let mut f = reindex_fixture();
        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.log.clear();

        f.orchestrator.cancellation_token().cancel();
        let err = f.orchestrator.complete(None).await.unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert!(f.log.calls().is_empty());
    }

    #[tokio::test]
    async fn test_utility_surface_and_dispose() {
        let mut f = reindex_fixture();
        f.orchestrator.dispose().await.unwrap();

        f.orchestrator.start(BootstrapMethod::Failure).await.unwrap();
        f.orchestrator.drain_all(None).await.unwrap();
        assert!(f.orchestrator.refresh_all().await.unwrap());
        assert!(f.orchestrator.apply_all_aliases().await.unwrap());
        assert_eq!(f.secondary.alias_targets(), vec!["docs-b-000002"]);

        f.orchestrator.dispose().await.unwrap();
        f.orchestrator.dispose().await.unwrap();
        assert_eq!(f.log.count("close(primary)"), 1);
        assert_eq!(f.log.count("close(secondary)"), 1);
        assert!(!f.orchestrator.is_started());
    }

    #[test]
    fn test_date_fields_follow_channel_config() {
        let config = ChannelConfig {
            last_updated_field: "modified".to_string(),
            ..Default::default()
        };
        let fields = DateFields::from(&config);
        assert_eq!(fields.last_updated, "modified");
        assert_eq!(fields.batch_index_date, "batch_index_date");
    }
}
