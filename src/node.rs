//! Tree nodes as stored in arena slots.
//!
//! A node is written by the worker and read concurrently by any number of
//! readers, so every field a reader touches is either atomic or is the key,
//! which is only ever written while the slot is unreachable:
//!
//! - `Free` slot: no key, not linked anywhere, not visible to readers.
//! - `Live` slot: key set before the first link to it is published, never
//!   overwritten while live.
//! - `Retired` slot: unlinked, key still readable by readers that reached it
//!   before it was unlinked. Reset only after reclamation.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Index of a node slot in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Handle(u32);

impl Handle {
	/// The absent child.
	pub(crate) const NIL: Handle = Handle(u32::MAX);

	#[inline]
	pub(crate) fn new(index: usize) -> Handle {
		debug_assert!(index < u32::MAX as usize);
		Handle(index as u32)
	}

	#[inline]
	pub(crate) fn index(self) -> usize {
		self.0 as usize
	}

	#[inline]
	pub(crate) fn is_nil(self) -> bool {
		self == Handle::NIL
	}

	#[inline]
	pub(crate) fn to_raw(self) -> u32 {
		self.0
	}

	#[inline]
	pub(crate) fn from_raw(raw: u32) -> Handle {
		Handle(raw)
	}
}

/// Child side. The discriminant indexes `Node::links`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
	Left = 0,
	Right = 1,
}

impl Dir {
	#[inline]
	pub(crate) fn opposite(self) -> Dir {
		match self {
			Dir::Left => Dir::Right,
			Dir::Right => Dir::Left,
		}
	}

	/// Balance contribution of growing this side.
	#[inline]
	pub(crate) fn sign(self) -> i8 {
		match self {
			Dir::Left => -1,
			Dir::Right => 1,
		}
	}
}

/// Liveness of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
	Free = 0,
	Live = 1,
	Retired = 2,
}

impl State {
	#[inline]
	fn from_raw(raw: u8) -> State {
		match raw {
			1 => State::Live,
			2 => State::Retired,
			_ => State::Free,
		}
	}
}

/// A single AVL node.
pub(crate) struct Node<T> {
	key: UnsafeCell<Option<T>>,
	links: [AtomicU32; 2],
	/// `height(right) - height(left)`.
	balance: AtomicI8,
	state: AtomicU8,
	/// Reclamation deadline in nanoseconds past the reclaimer's origin, 0 while live.
	expires_at: AtomicU64,
}

// SAFETY: the key is written only by the single worker while the slot is
// unreachable, and read by other threads only through shared references.
unsafe impl<T: Send + Sync> Sync for Node<T> {}
unsafe impl<T: Send> Send for Node<T> {}

impl<T> Default for Node<T> {
	fn default() -> Self {
		Node {
			key: UnsafeCell::new(None),
			links: [AtomicU32::new(Handle::NIL.to_raw()), AtomicU32::new(Handle::NIL.to_raw())],
			balance: AtomicI8::new(0),
			state: AtomicU8::new(State::Free as u8),
			expires_at: AtomicU64::new(0),
		}
	}
}

impl<T> Node<T> {
	#[inline]
	pub(crate) fn child(&self, dir: Dir) -> Handle {
		Handle::from_raw(self.links[dir as usize].load(Ordering::Acquire))
	}

	/// Publishes `child` under this node. Everything written to `child`
	/// before this call is visible to readers that follow the link.
	#[inline]
	pub(crate) fn set_child(&self, dir: Dir, child: Handle) {
		self.links[dir as usize].store(child.to_raw(), Ordering::Release);
	}

	#[inline]
	pub(crate) fn balance(&self) -> i8 {
		self.balance.load(Ordering::Relaxed)
	}

	#[inline]
	pub(crate) fn set_balance(&self, balance: i8) {
		self.balance.store(balance, Ordering::Relaxed);
	}

	#[inline]
	pub(crate) fn state(&self) -> State {
		State::from_raw(self.state.load(Ordering::Acquire))
	}

	#[inline]
	pub(crate) fn expires_at(&self) -> u64 {
		self.expires_at.load(Ordering::Relaxed)
	}

	/// Returns the key of the node.
	///
	/// # Safety
	///
	/// The caller is the worker, or holds an epoch guard that was pinned
	/// before it observed this node either through a child link or in the
	/// `Live` state.
	#[inline]
	pub(crate) unsafe fn key(&self) -> Option<&T> {
		(*self.key.get()).as_ref()
	}

	/// Initializes a freshly allocated slot and marks it live.
	///
	/// # Safety
	///
	/// Only the worker may call this, on a slot it just took off the free
	/// list and has not linked anywhere yet.
	pub(crate) unsafe fn fill(&self, key: T, left: Handle, right: Handle, balance: i8) {
		*self.key.get() = Some(key);
		self.links[0].store(left.to_raw(), Ordering::Relaxed);
		self.links[1].store(right.to_raw(), Ordering::Relaxed);
		self.balance.store(balance, Ordering::Relaxed);
		self.expires_at.store(0, Ordering::Relaxed);
		self.state.store(State::Live as u8, Ordering::Release);
	}

	/// Marks the node retired. Readers already inside it may keep reading.
	pub(crate) fn retire(&self, expires_at: u64) {
		self.expires_at.store(expires_at.max(1), Ordering::Relaxed);
		self.state.store(State::Retired as u8, Ordering::Release);
	}

	/// Drops the key and returns the slot to its pristine state.
	///
	/// # Safety
	///
	/// Only the worker may call this, once no reader can still reach the
	/// node.
	pub(crate) unsafe fn reset(&self) {
		self.state.store(State::Free as u8, Ordering::Release);
		*self.key.get() = None;
		self.links[0].store(Handle::NIL.to_raw(), Ordering::Relaxed);
		self.links[1].store(Handle::NIL.to_raw(), Ordering::Relaxed);
		self.balance.store(0, Ordering::Relaxed);
		self.expires_at.store(0, Ordering::Relaxed);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nil_handle_is_nil() {
		assert!(Handle::NIL.is_nil());
		assert!(!Handle::new(0).is_nil());
		assert_eq!(Handle::new(7).index(), 7);
	}

	#[test]
	fn directions_mirror() {
		assert_eq!(Dir::Left.opposite(), Dir::Right);
		assert_eq!(Dir::Right.opposite(), Dir::Left);
		assert_eq!(Dir::Left.sign() + Dir::Right.sign(), 0);
	}

	#[test]
	fn node_lifecycle() {
		let node: Node<u32> = Node::default();
		assert_eq!(node.state(), State::Free);
		assert!(unsafe { node.key() }.is_none());

		unsafe { node.fill(42, Handle::new(1), Handle::NIL, -1) };
		assert_eq!(node.state(), State::Live);
		assert_eq!(unsafe { node.key() }, Some(&42));
		assert_eq!(node.child(Dir::Left), Handle::new(1));
		assert!(node.child(Dir::Right).is_nil());
		assert_eq!(node.balance(), -1);
		assert_eq!(node.expires_at(), 0);

		node.retire(99);
		assert_eq!(node.state(), State::Retired);
		assert_eq!(node.expires_at(), 99);
		assert_eq!(unsafe { node.key() }, Some(&42));

		unsafe { node.reset() };
		assert_eq!(node.state(), State::Free);
		assert!(unsafe { node.key() }.is_none());
		assert!(node.child(Dir::Left).is_nil());
		assert_eq!(node.expires_at(), 0);
	}

	#[test]
	fn retire_never_stamps_zero() {
		let node: Node<u32> = Node::default();
		unsafe { node.fill(1, Handle::NIL, Handle::NIL, 0) };
		node.retire(0);
		assert!(node.expires_at() > 0);
	}
}
