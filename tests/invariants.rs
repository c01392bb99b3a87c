//! # Invariant Testing for cowavl
//!
//! These tests drive the worker step by step and validate the structure of
//! the tree after every batch. They focus on:
//!
//! - Rotation shapes: every single and double rotation case
//! - Two-child removals at the root and deep in the tree
//! - Randomized operation sequences with invariant validation

mod common;

use common::stepped;
use cowavl::Config;
use rand::prelude::*;

// ===========================================================================
// Rotation Tests
// ===========================================================================

/// Each three-key order triggers exactly one of the four rotation cases.
#[test]
fn every_rotation_case() {
	for order in [[1, 2, 3], [3, 2, 1], [1, 3, 2], [3, 1, 2]] {
		let (tree, mut worker) = stepped(Config::default());
		for k in order {
			tree.insert(k);
		}
		worker.run_pending();

		tree.assert_invariants();
		assert_eq!(tree.sorted_keys(), vec![1, 2, 3], "order {order:?}");
		assert_eq!(tree.height(), 1, "order {order:?}");
		assert!(tree.stats().pending_reclaim > 0, "order {order:?} should have rotated");
	}
}

#[test]
fn level_order_inserts_need_no_rotation() {
	let (tree, mut worker) = stepped(Config::default());
	for k in [5, 3, 8, 1, 4, 7, 9] {
		tree.insert(k);
	}
	worker.run_pending();

	tree.assert_invariants();
	assert_eq!(tree.sorted_keys(), vec![1, 3, 4, 5, 7, 8, 9]);
	assert_eq!(tree.min(), Some(1));
	assert_eq!(tree.max(), Some(9));
	assert_eq!(tree.height(), 2);
	// Inserted in level order: no rotation needed.
	assert_eq!(tree.stats().pending_reclaim, 0);
}

#[test]
fn ascending_and_descending_runs() {
	for descending in [false, true] {
		let (tree, mut worker) = stepped(Config::default());
		let keys: Vec<i32> = if descending {
			(0..1000).rev().collect()
		} else {
			(0..1000).collect()
		};
		for k in keys {
			tree.insert(k);
		}
		worker.run_pending();

		tree.assert_invariants();
		assert_eq!(tree.len(), 1000);
		// AVL height stays below 1.44 log2(n + 2).
		assert!(tree.height() <= 14, "height {} too large", tree.height());
	}
}

// ===========================================================================
// Removal Tests
// ===========================================================================

#[test]
fn remove_median_repeatedly() {
	let (tree, mut worker) = stepped(Config::default());
	for k in 0..127 {
		tree.insert(k);
	}
	worker.run_pending();

	let mut remaining = 127;
	while let Some(median) = tree.sorted_keys().get(remaining / 2).copied() {
		tree.remove(median);
		worker.run_pending();
		remaining -= 1;
		tree.assert_invariants();
		assert_eq!(tree.len(), remaining);
		assert!(!tree.contains(&median));
	}
	assert!(tree.is_empty());
}

#[test]
fn remove_extremes_updates_bounds() {
	let (tree, mut worker) = stepped(Config::default());
	for k in 0..64 {
		tree.insert(k);
	}
	worker.run_pending();

	for i in 0..32 {
		tree.remove(i);
		tree.remove(63 - i);
		worker.run_pending();
		tree.assert_invariants();
		if i < 31 {
			assert_eq!(tree.min(), Some(i + 1));
			assert_eq!(tree.max(), Some(62 - i));
		}
	}
	assert_eq!(tree.min(), None);
	assert_eq!(tree.max(), None);
}

#[test]
fn inserts_after_removals_reuse_the_tree() {
	let (tree, mut worker) = stepped(Config::default().initial_capacity(16));
	for round in 0..5 {
		for k in 0..100 {
			tree.insert(k * 5 + round);
		}
		worker.run_pending();
		for k in 0..50 {
			tree.remove(k * 5 + round);
		}
		worker.run_pending();
		tree.assert_invariants();
	}
	assert_eq!(tree.len(), 5 * 50);
}

// ===========================================================================
// Randomized Tests
// ===========================================================================

#[test]
fn random_batches_keep_invariants() {
	let (tree, mut worker) = stepped(Config::default().initial_capacity(64));
	let mut rng = StdRng::seed_from_u64(0x5eed);
	let mut expected = std::collections::BTreeSet::new();

	for _ in 0..50 {
		// Inserts and removes of the same batch may be applied in any
		// interleaving, so keep the two key sets disjoint.
		let inserts: Vec<u16> = (0..40).map(|_| rng.random_range(0..500)).collect();
		let removes: Vec<u16> = expected
			.iter()
			.copied()
			.filter(|k| !inserts.contains(k) && rng.random_bool(0.3))
			.collect();

		for &k in &inserts {
			tree.insert(k);
			expected.insert(k);
		}
		for &k in &removes {
			tree.remove(k);
			expected.remove(&k);
		}
		worker.run_pending();

		tree.assert_invariants();
		assert_eq!(tree.len(), expected.len());
	}
	assert_eq!(tree.sorted_keys(), expected.into_iter().collect::<Vec<_>>());
}
