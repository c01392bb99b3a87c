//! Physical-order scans over the node arena.
//!
//! Both [`Tree::iterate`](crate::Tree::iterate) and [`Iter`] walk the slabs
//! slot by slot rather than descending the tree. They report every slot that
//! is `Live` at the moment it is visited, so they never block the worker and
//! never need to retry, but the order is the order of allocation and the
//! result is not a snapshot.

use crossbeam_epoch::{self as epoch, Guard};

use crate::arena::NodeStore;
use crate::node::{Node, State};

#[inline]
fn live_key<T>(node: &Node<T>) -> Option<&T> {
	if node.state() != State::Live {
		return None;
	}
	// SAFETY: a slot observed `Live` under a pinned guard keeps its key until
	// the guard is dropped.
	unsafe { node.key() }
}

/// Calls `visitor` on every live key until it returns `false`.
pub(crate) fn scan<T, F>(nodes: &NodeStore<T>, guard: &Guard, mut visitor: F)
where
	F: FnMut(&T) -> bool,
{
	for slab in nodes.slabs(guard) {
		for key in slab.iter().filter_map(live_key) {
			if !visitor(key) {
				return;
			}
		}
	}
}

/// Iterator over clones of the live keys of a tree, in arena order.
///
/// Created by [`Tree::iter`](crate::Tree::iter). Slabs appended while the
/// iterator is alive are picked up when it reaches them.
pub struct Iter<'t, T> {
	nodes: &'t NodeStore<T>,
	guard: Guard,
	slab: usize,
	slot: usize,
}

impl<'t, T> Iter<'t, T> {
	pub(crate) fn new(nodes: &'t NodeStore<T>) -> Self {
		Iter {
			nodes,
			guard: epoch::pin(),
			slab: 0,
			slot: 0,
		}
	}
}

impl<T: Clone> Iterator for Iter<'_, T> {
	type Item = T;

	fn next(&mut self) -> Option<T> {
		loop {
			let slabs = self.nodes.slabs(&self.guard);
			let slab = slabs.get(self.slab)?;
			let Some(node) = slab.get(self.slot) else {
				self.slab += 1;
				self.slot = 0;
				continue;
			};
			self.slot += 1;
			if let Some(key) = live_key(node) {
				return Some(key.clone());
			}
		}
	}
}
