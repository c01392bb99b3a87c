//! # Property-Based Tests for cowavl
//!
//! Randomized operation sequences checked against a `BTreeSet` oracle. The
//! worker is stepped between phases, so every property is evaluated on a
//! drained tree.
//!
//! ## Test Properties
//!
//! - Insert-then-lookup: all inserted keys are retrievable, nothing else is
//! - Remove-then-lookup: removed keys are gone, the rest remain
//! - Bounds: min/max track the true extremes and are absent when empty
//! - Shape: the AVL invariant holds after any drained sequence
//! - Scans: `iter` and `iterate` report exactly the live keys

mod common;

use common::stepped;
use cowavl::Config;
use proptest::prelude::*;
use std::collections::BTreeSet;

// ===========================================================================
// Strategy Helpers
// ===========================================================================

/// Generate a vector of unique keys
fn unique_keys(max_len: usize) -> impl Strategy<Value = Vec<i32>> {
	prop::collection::hash_set(any::<i32>(), 0..max_len).prop_map(|s| s.into_iter().collect())
}

/// A batch of operations applied between two drains of the worker.
#[derive(Debug, Clone)]
enum Op {
	Insert(i16),
	Remove(i16),
}

fn batches(max_batches: usize) -> impl Strategy<Value = Vec<Vec<Op>>> {
	let op = prop_oneof![
		3 => any::<i16>().prop_map(|k| Op::Insert(k % 256)),
		2 => any::<i16>().prop_map(|k| Op::Remove(k % 256)),
	];
	prop::collection::vec(prop::collection::vec(op, 0..64), 0..max_batches)
}

// ===========================================================================
// Insert / Remove Properties
// ===========================================================================

proptest! {
	/// Property: every inserted key can be found, no other key can
	#[test]
	fn inserted_keys_are_found(keys in unique_keys(400), queries in prop::collection::vec(any::<i32>(), 0..100)) {
		let (tree, mut worker) = stepped(Config::default().initial_capacity(32));
		for &k in &keys {
			tree.insert(k);
		}
		worker.run_pending();
		tree.assert_invariants();

		let expected: BTreeSet<i32> = keys.iter().copied().collect();
		for k in &keys {
			prop_assert_eq!(tree.get(k), Some(*k));
		}
		for p in &queries {
			prop_assert_eq!(tree.contains(p), expected.contains(p), "query {}", p);
		}
		prop_assert_eq!(tree.len(), expected.len());
	}

	/// Property: N inserts then M removes leave N - M keys
	#[test]
	fn removes_leave_the_rest(keys in unique_keys(300), split in 0usize..300) {
		let (tree, mut worker) = stepped(Config::default());
		for &k in &keys {
			tree.insert(k);
		}
		worker.run_pending();

		let split = split.min(keys.len());
		let (gone, kept) = keys.split_at(split);
		for &k in gone {
			tree.remove(k);
		}
		worker.run_pending();
		tree.assert_invariants();

		prop_assert_eq!(tree.len(), kept.len());
		for k in gone {
			prop_assert!(!tree.contains(k), "key {} should be gone", k);
		}
		for k in kept {
			prop_assert!(tree.contains(k), "key {} should remain", k);
		}
	}
}

// ===========================================================================
// Oracle Comparison
// ===========================================================================

proptest! {
	/// Property: a drained tree always matches a `BTreeSet` fed the same
	/// batches, with inserts applied before removes within a batch
	#[test]
	fn matches_btreeset_oracle(batches in batches(12)) {
		let (tree, mut worker) = stepped(Config::default().initial_capacity(16));
		let mut oracle = BTreeSet::new();

		for batch in batches {
			for op in &batch {
				if let Op::Insert(k) = op {
					tree.insert(*k);
					oracle.insert(*k);
				}
			}
			worker.run_pending();
			for op in &batch {
				if let Op::Remove(k) = op {
					tree.remove(*k);
					oracle.remove(k);
				}
			}
			worker.run_pending();

			tree.assert_invariants();
			prop_assert_eq!(tree.len(), oracle.len());
			prop_assert_eq!(tree.min(), oracle.first().copied());
			prop_assert_eq!(tree.max(), oracle.last().copied());
		}

		prop_assert_eq!(tree.sorted_keys(), oracle.iter().copied().collect::<Vec<_>>());
	}

	/// Property: once idle, physical-order scans report each key exactly once
	#[test]
	fn scans_report_live_keys(keys in unique_keys(200), removed in prop::collection::vec(any::<prop::sample::Index>(), 0..50)) {
		let (tree, mut worker) = stepped(Config::default().initial_capacity(8));
		for &k in &keys {
			tree.insert(k);
		}
		worker.run_pending();
		let mut expected: BTreeSet<i32> = keys.iter().copied().collect();
		if !keys.is_empty() {
			for index in &removed {
				let k = keys[index.index(keys.len())];
				tree.remove(k);
				expected.remove(&k);
			}
		}
		worker.run_pending();

		let mut scanned: Vec<i32> = tree.iter().collect();
		scanned.sort_unstable();
		prop_assert_eq!(&scanned, &expected.iter().copied().collect::<Vec<_>>());

		let mut visited = 0;
		tree.iterate(|k| {
			visited += 1;
			assert!(expected.contains(k));
			true
		});
		prop_assert_eq!(visited, expected.len());
	}
}
