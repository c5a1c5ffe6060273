//! # ThemisDB Core
//!
//! Core storage and query engine for ThemisDB: a multi-model embedded
//! database exposing relational, graph, vector, time-series, and content
//! blob models over one key-value substrate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Database                          │
//! │   (orchestrator: lifecycle, commit coordination)      │
//! └───────┬──────────────┬───────────────┬───────────────┘
//!         │              │               │
//! ┌───────▼──────┐ ┌─────▼──────┐ ┌──────▼───────────────┐
//! │ QueryEngine  │ │ Encryption │ │  Index Managers       │
//! │ (AQL → plan) │ │ (KEK→DEK→  │ │  (secondary, spatial, │
//! │              │ │  field key)│ │   vector, graph, TTL) │
//! └───────┬──────┘ └─────┬──────┘ └──────┬───────────────┘
//!         │              │               │
//! ┌───────▼──────────────▼───────────────▼───────────────┐
//! │                KvStore (themis_storage)               │
//! │   column families, atomic batches, snapshots          │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Key Invariants
//!
//! - **Atomic co-updates**: an entity write commits its bytes, every
//!   declared index entry, and one CDC event at a single sequence
//! - **Single committer**: all mutating batches pass through the
//!   orchestrator's commit lock
//! - **Reconstructable indexes**: every index is a deterministic function
//!   of entities plus the registry
//! - **Single-form fields**: a field is plaintext or encrypted, never both

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod aql;
pub mod audit;
pub mod changefeed;
pub mod config;
pub mod content;
pub mod crypto;
mod database;
mod error;
pub mod graph;
pub mod index;
pub mod integrity;
pub mod query;
pub mod semcache;
pub mod spatial;
mod stats;
pub mod timeseries;
pub mod update;
pub mod vector;

pub use config::Config;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use stats::{DatabaseStats, StatsSnapshot};

pub use themis_codec::{Entity, Value};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
