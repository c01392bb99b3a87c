//! The published entry points of a tree: root handle, cached bounds, length.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::node::Handle;

pub(crate) struct IndexRoot<T> {
	root: AtomicU32,
	min: Atomic<T>,
	max: Atomic<T>,
	len: AtomicUsize,
}

impl<T> IndexRoot<T> {
	pub(crate) fn new() -> Self {
		IndexRoot {
			root: AtomicU32::new(Handle::NIL.to_raw()),
			min: Atomic::null(),
			max: Atomic::null(),
			len: AtomicUsize::new(0),
		}
	}

	/// The root link, for the balancer to update.
	pub(crate) fn link(&self) -> &AtomicU32 {
		&self.root
	}

	#[inline]
	pub(crate) fn root(&self) -> Handle {
		Handle::from_raw(self.root.load(Ordering::Acquire))
	}

	#[inline]
	pub(crate) fn len(&self) -> usize {
		self.len.load(Ordering::Acquire)
	}

	pub(crate) fn grew(&self) {
		self.len.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn shrank(&self) {
		self.len.fetch_sub(1, Ordering::AcqRel);
	}

	/// Cached smallest and largest key. Either is `None` on an empty tree.
	#[inline]
	pub(crate) fn bounds<'a>(&'a self, guard: &'a Guard) -> (Option<&'a T>, Option<&'a T>) {
		// SAFETY: replaced bounds are destroyed through the epoch, so a value
		// loaded under `guard` outlives it.
		unsafe {
			(
				self.min.load(Ordering::Acquire, guard).as_ref(),
				self.max.load(Ordering::Acquire, guard).as_ref(),
			)
		}
	}

	/// Stretches the bounds to cover `key`. Called before the key is linked.
	pub(crate) fn widen(&self, key: &T, guard: &Guard)
	where
		T: Ord + Clone,
	{
		let (min, max) = self.bounds(guard);
		if min.map_or(true, |min| key < min) {
			publish(&self.min, Some(key.clone()), guard);
		}
		if max.map_or(true, |max| key > max) {
			publish(&self.max, Some(key.clone()), guard);
		}
	}

	/// Replaces both bounds. Called after the old extremes were unlinked.
	pub(crate) fn set_bounds(&self, min: Option<T>, max: Option<T>, guard: &Guard) {
		publish(&self.min, min, guard);
		publish(&self.max, max, guard);
	}
}

fn publish<T>(slot: &Atomic<T>, value: Option<T>, guard: &Guard) {
	let new = match value {
		Some(value) => Owned::new(value).into_shared(guard),
		None => Shared::null(),
	};
	let old = slot.swap(new, Ordering::AcqRel, guard);
	if !old.is_null() {
		// SAFETY: `old` is no longer reachable through `slot`.
		unsafe { guard.defer_destroy(old) };
	}
}

impl<T> Drop for IndexRoot<T> {
	fn drop(&mut self) {
		// SAFETY: `&mut self` proves no reader is left.
		unsafe {
			let guard = epoch::unprotected();
			for slot in [&self.min, &self.max] {
				let value = slot.swap(Shared::null(), Ordering::Relaxed, guard);
				if !value.is_null() {
					drop(value.into_owned());
				}
			}
		}
	}
}
