//! # ES Ingest
//!
//! Elasticsearch transport and buffered bulk ingest channels.
//!
//! ## Components
//!
//! - `EsClient`: reqwest-based [`ClusterApi`](es_sync_core::ClusterApi)
//!   with host round-robin and bulk retry on 429/502/503/504
//! - `BulkIngestChannel`: bounded write buffer drained by a background
//!   worker into `_bulk` requests
//! - `BulkChannelFactory`: hands channels to the orchestrator on start
//!
//! ## Features
//!
//! - Content-hash scripted upserts; unchanged documents only get their
//!   batch date refreshed
//! - Idempotent template bootstrap keyed by the schema hash
//! - Atomic alias swaps onto the concrete index of the run

pub mod batcher;
pub mod channel;
pub mod client;
pub mod retry;

pub use batcher::*;
pub use channel::*;
pub use client::*;
pub use retry::*;
