//! Slab arena holding every node of a tree.
//!
//! The arena is split along the reader/writer boundary:
//!
//! - [`NodeStore`] is shared with readers. It maps a [`Handle`] to its node
//!   through an epoch-protected directory of slabs.
//! - [`Arena`] is owned by the worker. It owns the free list and is the only
//!   place that grows the store.
//!
//! ```text
//!   directory (epoch::Atomic<Vec<Slab>>)
//!        │
//!        ├──► slab 0: [initial_capacity nodes]   handles 0 .. C
//!        ├──► slab 1: [C / 4 nodes]              handles C .. C + C/4
//!        └──► slab 2: [C / 4 nodes]              ...
//! ```
//!
//! Growth builds a new directory that shares every existing slab and swaps it
//! in, so a slab never moves once allocated. Readers holding an older
//! directory keep valid references until their guard is dropped.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{Handle, Node};

/// A contiguous run of nodes. Never reallocated.
pub(crate) type Slab<T> = Arc<[Node<T>]>;

fn new_slab<T>(len: usize) -> Slab<T> {
	(0..len).map(|_| Node::default()).collect()
}

/// Arithmetic mapping between handles and `(slab, slot)` positions.
#[derive(Debug, Clone, Copy)]
struct Layout {
	base: usize,
	growth: usize,
}

impl Layout {
	#[inline]
	fn locate(&self, handle: Handle) -> (usize, usize) {
		let index = handle.index();
		if index < self.base {
			(0, index)
		} else {
			let rest = index - self.base;
			(1 + rest / self.growth, rest % self.growth)
		}
	}

	#[inline]
	fn first_index(&self, slab: usize) -> usize {
		if slab == 0 {
			0
		} else {
			self.base + (slab - 1) * self.growth
		}
	}
}

/// Read side of the arena, shared between the worker and all readers.
pub(crate) struct NodeStore<T> {
	layout: Layout,
	directory: Atomic<Vec<Slab<T>>>,
}

impl<T> NodeStore<T> {
	fn new(base: usize, growth: usize) -> Self {
		NodeStore {
			layout: Layout {
				base,
				growth,
			},
			directory: Atomic::new(vec![new_slab(base)]),
		}
	}

	/// Returns the slabs visible under `guard`, in handle order.
	#[inline]
	pub(crate) fn slabs<'a>(&'a self, guard: &'a Guard) -> &'a [Slab<T>] {
		// SAFETY: the directory is never null while the store is alive, and
		// replaced directories are destroyed through the epoch.
		unsafe { self.directory.load(Ordering::Acquire, guard).deref() }.as_slice()
	}

	/// Resolves a handle to its node.
	///
	/// # Panics
	///
	/// Panics if `handle` is nil or was never handed out by the arena.
	#[inline]
	pub(crate) fn get<'a>(&'a self, handle: Handle, guard: &'a Guard) -> &'a Node<T> {
		let (slab, slot) = self.layout.locate(handle);
		&self.slabs(guard)[slab][slot]
	}

	/// Handle of the first slot of `slab`.
	#[inline]
	pub(crate) fn first_handle(&self, slab: usize) -> Handle {
		Handle::new(self.layout.first_index(slab))
	}

	/// Appends a slab and returns the index of its first slot.
	fn push_slab(&self, guard: &Guard) -> usize {
		let current = self.slabs(guard);
		let first = self.layout.first_index(current.len());
		let mut next = Vec::with_capacity(current.len() + 1);
		next.extend(current.iter().cloned());
		next.push(new_slab(self.layout.growth));

		let old = self.directory.swap(Owned::new(next), Ordering::AcqRel, guard);
		// SAFETY: the old directory is unreachable from now on; readers that
		// loaded it are protected by their guards.
		unsafe { guard.defer_destroy(old) };
		first
	}
}

impl<T> Drop for NodeStore<T> {
	fn drop(&mut self) {
		// SAFETY: `&mut self` proves no reader holds a reference into the store.
		unsafe {
			let guard = epoch::unprotected();
			let directory = self.directory.swap(Shared::null(), Ordering::Relaxed, guard);
			if !directory.is_null() {
				drop(directory.into_owned());
			}
		}
	}
}

/// Write side of the arena, owned by the worker.
pub(crate) struct Arena<T> {
	store: Arc<NodeStore<T>>,
	free: Vec<Handle>,
	growth: usize,
	capacity: usize,
	ceiling: usize,
}

impl<T> Arena<T> {
	pub(crate) fn new(config: &Config) -> Self {
		let ceiling = config.ceiling();
		let base = config.initial_capacity.min(ceiling);
		Arena {
			store: Arc::new(NodeStore::new(base, config.growth())),
			// Popped from the back, so slots are handed out in ascending order.
			free: (0..base).rev().map(Handle::new).collect(),
			growth: config.growth(),
			capacity: base,
			ceiling,
		}
	}

	pub(crate) fn store(&self) -> &Arc<NodeStore<T>> {
		&self.store
	}

	/// Usable slots across all slabs.
	pub(crate) fn capacity(&self) -> usize {
		self.capacity
	}

	pub(crate) fn free_len(&self) -> usize {
		self.free.len()
	}

	/// Grows the arena until at least `needed` slots are free.
	pub(crate) fn reserve(&mut self, needed: usize, guard: &Guard) -> Result<()> {
		if needed > self.free.len() + (self.ceiling - self.capacity) {
			return Err(Error::ArenaExhausted {
				capacity: self.ceiling,
			});
		}
		while self.free.len() < needed {
			self.grow(guard)?;
		}
		Ok(())
	}

	/// Takes a free slot, growing by one slab when none is left.
	pub(crate) fn allocate(&mut self, guard: &Guard) -> Result<Handle> {
		if self.free.is_empty() {
			self.grow(guard)?;
		}
		self.free.pop().ok_or(Error::ArenaExhausted {
			capacity: self.ceiling,
		})
	}

	/// Resets a reclaimed node and puts its slot back on the free list.
	pub(crate) fn release(&mut self, handle: Handle, guard: &Guard) {
		let node = self.store.get(handle, guard);
		// SAFETY: the reclaimer only releases nodes whose grace period and
		// epoch have both passed, so no reader can reach this slot.
		unsafe { node.reset() };
		self.free.push(handle);
	}

	fn grow(&mut self, guard: &Guard) -> Result<()> {
		if self.capacity >= self.ceiling {
			return Err(Error::ArenaExhausted {
				capacity: self.ceiling,
			});
		}
		let first = self.store.push_slab(guard);
		let end = (first + self.growth).min(self.ceiling);
		self.free.extend((first..end).rev().map(Handle::new));
		self.capacity = end;
		debug!(added = end - first, capacity = end, "grew node arena");
		Ok(())
	}
}
