//! Point-in-time read view.

use crate::cf::ColumnFamily;
use std::collections::BTreeMap;
use std::ops::Bound;

/// A consistent point-in-time view of every column family.
///
/// Snapshots are taken under the commit lock, so a snapshot at sequence `s`
/// observes every write at or below `s` and none beyond. Snapshots are
/// detached: later commits do not change them.
#[derive(Debug, Clone)]
pub struct Snapshot {
    sequence: u64,
    tables: Vec<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Snapshot {
    pub(crate) fn new(sequence: u64, tables: Vec<BTreeMap<Vec<u8>, Vec<u8>>>) -> Self {
        debug_assert_eq!(tables.len(), ColumnFamily::ALL.len());
        Self { sequence, tables }
    }

    /// Returns the commit sequence this snapshot observes.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Reads a key from the snapshot.
    #[must_use]
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<&[u8]> {
        self.tables[cf.as_byte() as usize]
            .get(key)
            .map(Vec::as_slice)
    }

    /// Scans all keys with the given prefix, ascending.
    #[must_use]
    pub fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let table = &self.tables[cf.as_byte() as usize];
        let (lo, hi) = prefix_bounds(prefix);
        table
            .range((lo, hi))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns the number of keys in a column family.
    #[must_use]
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.tables[cf.as_byte() as usize].len()
    }

    /// Returns true if the column family holds no keys.
    #[must_use]
    pub fn is_empty(&self, cf: ColumnFamily) -> bool {
        self.tables[cf.as_byte() as usize].is_empty()
    }

    /// Iterates every key-value pair of a column family, ascending.
    pub fn iter(&self, cf: ColumnFamily) -> impl Iterator<Item = (&Vec<u8>, &Vec<u8>)> {
        self.tables[cf.as_byte() as usize].iter()
    }
}

/// Computes the `[prefix, successor)` bound pair covering every key that
/// starts with `prefix`.
pub(crate) fn prefix_bounds(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    if prefix.is_empty() {
        return (Bound::Unbounded, Bound::Unbounded);
    }
    let mut upper = prefix.to_vec();
    // Strip trailing 0xff bytes, then increment; an all-0xff prefix has no
    // finite successor.
    while let Some(&last) = upper.last() {
        if last == 0xff {
            upper.pop();
        } else {
            *upper.last_mut().expect("non-empty") += 1;
            return (Bound::Included(prefix.to_vec()), Bound::Excluded(upper));
        }
    }
    (Bound::Included(prefix.to_vec()), Bound::Unbounded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_bounds_basic() {
        let (lo, hi) = prefix_bounds(b"idx:");
        assert_eq!(lo, Bound::Included(b"idx:".to_vec()));
        assert_eq!(hi, Bound::Excluded(b"idx;".to_vec()));
    }

    #[test]
    fn prefix_bounds_trailing_ff() {
        let (_, hi) = prefix_bounds(&[b'a', 0xff]);
        assert_eq!(hi, Bound::Excluded(vec![b'b']));
    }

    #[test]
    fn prefix_bounds_all_ff() {
        let (_, hi) = prefix_bounds(&[0xff, 0xff]);
        assert_eq!(hi, Bound::Unbounded);
    }

    #[test]
    fn prefix_bounds_empty_covers_all() {
        let (lo, hi) = prefix_bounds(b"");
        assert_eq!(lo, Bound::Unbounded);
        assert_eq!(hi, Bound::Unbounded);
    }
}
