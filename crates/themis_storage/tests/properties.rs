//! Property-based laws for the store.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ops::Bound;
use themis_storage::{ColumnFamily, KvStore, WriteBatch};

fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..12)
}

fn kv_map() -> impl Strategy<Value = BTreeMap<Vec<u8>, Vec<u8>>> {
    prop::collection::btree_map(
        key_strategy(),
        prop::collection::vec(any::<u8>(), 0..16),
        0..24,
    )
}

proptest! {
    /// scan_range returns exactly the keys inside the bounds, in order,
    /// truncated at the limit.
    #[test]
    fn range_scan_bounds_law(
        data in kv_map(),
        lo in key_strategy(),
        hi in key_strategy(),
        limit in 0usize..16,
        reverse in any::<bool>(),
    ) {
        let store = KvStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        for (key, value) in &data {
            batch.put(ColumnFamily::Default, key.clone(), value.clone());
        }
        if !batch.is_empty() {
            store.write_batch(batch).unwrap();
        }

        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let scanned = store
            .scan_range(
                ColumnFamily::Default,
                Bound::Included(lo.clone()),
                Bound::Included(hi.clone()),
                Some(limit),
                reverse,
            )
            .unwrap();

        // Reference result straight from the map.
        let mut expected: Vec<(Vec<u8>, Vec<u8>)> = data
            .range::<Vec<u8>, _>((Bound::Included(&lo), Bound::Included(&hi)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if reverse {
            expected.reverse();
        }
        expected.truncate(limit);

        prop_assert_eq!(scanned, expected);
    }

    /// A batch is all-or-nothing and later writes win.
    #[test]
    fn batch_last_writer_wins(data in prop::collection::vec((key_strategy(), key_strategy()), 1..24)) {
        let store = KvStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        let mut expected: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, value) in &data {
            batch.put(ColumnFamily::Default, key.clone(), value.clone());
            expected.insert(key.clone(), value.clone());
        }
        store.write_batch(batch).unwrap();

        for (key, value) in expected {
            prop_assert_eq!(
                store.get(ColumnFamily::Default, &key).unwrap(),
                Some(value)
            );
        }
    }

    /// Snapshots pin state: commits after the snapshot are invisible.
    #[test]
    fn snapshot_isolation_law(
        before in kv_map(),
        after in kv_map(),
    ) {
        let store = KvStore::open_in_memory().unwrap();
        let mut batch = WriteBatch::new();
        for (key, value) in &before {
            batch.put(ColumnFamily::Default, key.clone(), value.clone());
        }
        if !batch.is_empty() {
            store.write_batch(batch).unwrap();
        }

        let snapshot = store.snapshot().unwrap();

        let mut batch = WriteBatch::new();
        for (key, value) in &after {
            batch.put(ColumnFamily::Default, key.clone(), value.clone());
        }
        for key in before.keys() {
            batch.delete(ColumnFamily::Default, key.clone());
        }
        if !batch.is_empty() {
            store.write_batch(batch).unwrap();
        }

        for (key, value) in &before {
            prop_assert_eq!(snapshot.get(ColumnFamily::Default, key), Some(value.as_slice()));
        }
    }
}
