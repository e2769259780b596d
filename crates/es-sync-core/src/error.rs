//! Error types for the incremental sync
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.

use std::fmt;
use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Primary error type for all sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Elasticsearch connection, transport or non-2xx response errors
    #[error("Elasticsearch error: {message}")]
    Elasticsearch {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Document or request body serialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors, including missing descriptor targets
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// An operation was invoked before `start`
    #[error("Orchestrator not started: `{operation}` requires a completed start")]
    NotStarted { operation: &'static str },

    /// Schema registration failed under `BootstrapMethod::Failure`
    #[error("Bootstrap of `{target}` failed: {details}")]
    Bootstrap { target: String, details: String },

    /// A completion phase failed against a specific target
    #[error("Phase {phase} failed on `{target}`: {message}")]
    Phase {
        phase: String,
        target: String,
        message: String,
    },

    /// The post-complete hook or a pre-bootstrap task failed
    #[error("Hook failed: {message}")]
    Hook { message: String },

    /// The cancellation token fired at a suspension point
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create an Elasticsearch error
    pub fn elasticsearch(message: impl Into<String>) -> Self {
        Self::Elasticsearch {
            message: message.into(),
            source: None,
        }
    }

    /// Create an Elasticsearch error with source
    pub fn elasticsearch_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Elasticsearch {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a usage error for calls made before `start`
    pub fn not_started(operation: &'static str) -> Self {
        Self::NotStarted { operation }
    }

    /// Create a bootstrap failure carrying the remote diagnostic
    pub fn bootstrap(target: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Bootstrap {
            target: target.into(),
            details: details.into(),
        }
    }

    /// Create a phase failure
    pub fn phase(
        phase: impl fmt::Display,
        target: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Phase {
            phase: phase.to_string(),
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a hook failure
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook {
            message: message.into(),
        }
    }

    /// Check if error is a programmer error rather than a runtime failure
    pub fn is_usage_error(&self) -> bool {
        matches!(self, Self::NotStarted { .. } | Self::Configuration { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }
}

/// Error context for enhanced debugging
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub operation: String,
    pub phase: Option<String>,
    pub index: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        Self {
            component,
            operation: operation.into(),
            phase: None,
            index: None,
        }
    }

    pub fn with_phase(mut self, phase: impl fmt::Display) -> Self {
        self.phase = Some(phase.to_string());
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}::{}]", self.component, self.operation)?;
        if let Some(ref phase) = self.phase {
            write!(f, " phase={}", phase)?;
        }
        if let Some(ref idx) = self.index {
            write!(f, " index={}", idx)?;
        }
        Ok(())
    }
}

/// Extension trait for adding context to errors
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                component = ctx.component,
                operation = %ctx.operation,
                phase = ?ctx.phase,
                index = ?ctx.index,
                "Operation failed"
            );
            e
        })
    }
}
