//! # ThemisDB Storage
//!
//! Key-value substrate for ThemisDB.
//!
//! This crate provides the lowest-level persistent state for the database:
//! a set of ordered column families over a write-ahead batch log. The write
//! batch is the only atomicity primitive; every committed batch is assigned
//! a monotonic sequence number that the change-data log consumes.
//!
//! ## Design Principles
//!
//! - Backends are **opaque byte stores** (read, append, flush); the store
//!   owns all record framing
//! - Batch commit is log-first: a batch is durable before it is visible
//! - Readers observing sequence `s` observe every write at or below `s`
//! - Column families are fixed at open time
//!
//! ## Example
//!
//! ```
//! use themis_storage::{ColumnFamily, KvStore, WriteBatch};
//!
//! let store = KvStore::open_in_memory().unwrap();
//! let mut batch = WriteBatch::new();
//! batch.put(ColumnFamily::Default, b"users:alice".to_vec(), b"payload".to_vec());
//! let seq = store.write_batch(batch).unwrap();
//! assert_eq!(seq, 1);
//! assert_eq!(store.get(ColumnFamily::Default, b"users:alice").unwrap().unwrap(), b"payload");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod batch;
mod cf;
mod error;
mod file;
mod kv;
mod memory;
mod record;
mod snapshot;

pub use backend::StorageBackend;
pub use batch::{BatchOp, WriteBatch};
pub use cf::ColumnFamily;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use kv::{KvStore, KvStoreOptions};
pub use memory::InMemoryBackend;
pub use record::crc32;
pub use snapshot::Snapshot;
