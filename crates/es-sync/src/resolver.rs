//! Sync strategy resolution
//!
//! Decides once per run whether the secondary target can be reconciled with a
//! server-side copy (`Reindex`) or must receive every write directly
//! (`Multiplex`). The decision only ever moves towards `Multiplex`.

use std::fmt;
use tracing::info;

/// How writes reach the secondary target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SyncStrategy {
    /// Write to primary only; copy changes into secondary on completion
    #[default]
    Reindex,
    /// Write to both targets
    Multiplex,
}

impl SyncStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reindex => "reindex",
            Self::Multiplex => "multiplex",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local versus server-stored schema hash for one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaCheck {
    pub local_hash: String,
    pub stored_hash: Option<String>,
}

impl SchemaCheck {
    pub fn new(local_hash: impl Into<String>, stored_hash: Option<String>) -> Self {
        Self {
            local_hash: local_hash.into(),
            stored_hash,
        }
    }

    /// An absent or empty stored hash never counts as a match
    pub fn matches(&self) -> bool {
        match self.stored_hash.as_deref() {
            Some(stored) => !stored.is_empty() && stored == self.local_hash,
            None => false,
        }
    }
}

/// Monotonic accumulator over the start-phase observations
#[derive(Debug, Default)]
pub struct StrategyResolver {
    strategy: SyncStrategy,
}

impl StrategyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(&self) -> SyncStrategy {
        self.strategy
    }

    /// Schema drift on either target forces `Multiplex`
    pub fn observe_schema(&mut self, target: &str, check: &SchemaCheck) {
        if !check.matches() {
            self.force_multiplex(target, "schema changed since last run");
            info!(
                index = target,
                local_hash = %check.local_hash,
                stored_hash = check.stored_hash.as_deref().unwrap_or(""),
                "Schema drift detected"
            );
        }
    }

    /// A missing secondary leaves nothing to reconcile into
    pub fn observe_secondary(&mut self, write_alias: &str, exists: bool) {
        if !exists {
            self.force_multiplex(write_alias, "secondary target does not exist");
        }
    }

    fn force_multiplex(&mut self, target: &str, reason: &str) {
        if self.strategy != SyncStrategy::Multiplex {
            info!(index = target, reason, "Switching to multiplex strategy");
        }
        self.strategy = SyncStrategy::Multiplex;
    }
}

/// Pure form of the decision made during `start`
pub fn resolve_strategy(
    primary: &SchemaCheck,
    secondary: &SchemaCheck,
    secondary_exists: bool,
) -> SyncStrategy {
    let mut resolver = StrategyResolver::new();
    resolver.observe_schema("primary", primary);
    resolver.observe_secondary("secondary", secondary_exists);
    resolver.observe_schema("secondary", secondary);
    resolver.strategy()
}
