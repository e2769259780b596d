//! # ES Sync Core
//!
//! Core types, collaborator traits, and configuration for the incremental
//! dual-target synchronization of Elasticsearch indices.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐     ┌───────────────┐     ┌───────────────┐
//! │TypeDescriptor │────►│ IngestChannel │────►│  ClusterApi   │
//! │  (metadata)   │     │ (per target)  │     │  (transport)  │
//! └───────────────┘     └───────────────┘     └───────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod metrics;

pub use self::channel::*;
pub use self::config::*;
pub use self::descriptor::*;
pub use self::error::*;
pub use self::metrics::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::channel::{
        BootstrapMethod, BulkResponse, ChannelFactory, ClusterApi, IngestChannel, SyncDocument,
    };
    pub use crate::config::SyncConfig;
    pub use crate::descriptor::{DescriptorRegistry, TypeDescriptor};
    pub use crate::error::{Result, SyncError};
}
