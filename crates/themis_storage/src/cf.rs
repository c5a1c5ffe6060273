//! Column family definitions.

use crate::error::{StorageError, StorageResult};

/// The fixed set of column families a store opens with.
///
/// Column families partition the keyspace so that unrelated subsystems
/// (entities, graph adjacency, vector indexes, time-series points, security
/// signatures, the change-data log) never collide and can be scanned
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ColumnFamily {
    /// Entities, secondary indexes, key material, caches.
    Default = 0,
    /// Graph adjacency lists.
    Graph = 1,
    /// Serialized vector (ANN) indexes.
    Vector = 2,
    /// Time-series points and chunks.
    Timeseries = 3,
    /// File integrity signatures.
    SecuritySignatures = 4,
    /// Change-data-capture events.
    Changefeed = 5,
}

impl ColumnFamily {
    /// All column families, in id order.
    pub const ALL: [ColumnFamily; 6] = [
        ColumnFamily::Default,
        ColumnFamily::Graph,
        ColumnFamily::Vector,
        ColumnFamily::Timeseries,
        ColumnFamily::SecuritySignatures,
        ColumnFamily::Changefeed,
    ];

    /// Returns the stable name of this column family.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Graph => "graph",
            ColumnFamily::Vector => "vector",
            ColumnFamily::Timeseries => "timeseries",
            ColumnFamily::SecuritySignatures => "security_signatures",
            ColumnFamily::Changefeed => "changefeed",
        }
    }

    /// Converts the column family to its log byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Converts a log byte back to a column family.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownColumnFamily`] for unknown bytes.
    pub fn from_byte(id: u8) -> StorageResult<Self> {
        match id {
            0 => Ok(ColumnFamily::Default),
            1 => Ok(ColumnFamily::Graph),
            2 => Ok(ColumnFamily::Vector),
            3 => Ok(ColumnFamily::Timeseries),
            4 => Ok(ColumnFamily::SecuritySignatures),
            5 => Ok(ColumnFamily::Changefeed),
            id => Err(StorageError::UnknownColumnFamily { id }),
        }
    }
}

impl std::fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
