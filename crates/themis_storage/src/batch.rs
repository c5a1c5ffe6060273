//! Write batch: the store's only atomicity primitive.

use crate::cf::ColumnFamily;

/// A single operation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or replace a key.
    Put {
        /// Target column family.
        cf: ColumnFamily,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target column family.
        cf: ColumnFamily,
        /// Key bytes.
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// Returns the column family this operation targets.
    #[must_use]
    pub fn cf(&self) -> ColumnFamily {
        match self {
            BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => *cf,
        }
    }

    /// Returns the key this operation targets.
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key, .. } => key,
        }
    }
}

/// An ordered set of operations committed atomically.
///
/// All operations in a batch become visible at a single commit sequence, or
/// none do. Later operations on the same key win within a batch.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a put operation.
    pub fn put(&mut self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Put { cf, key, value });
        self
    }

    /// Adds a delete operation.
    pub fn delete(&mut self, cf: ColumnFamily, key: Vec<u8>) -> &mut Self {
        self.ops.push(BatchOp::Delete { cf, key });
        self
    }

    /// Appends all operations from another batch.
    pub fn extend(&mut self, other: WriteBatch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    /// Returns the operations in insertion order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if the batch contains no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Consumes the batch, returning its operations.
    #[must_use]
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
