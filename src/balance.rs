//! AVL insertion, removal and rotations with copy-on-write.
//!
//! The balancer runs only on the worker. It follows the classic recursive
//! top-down search / bottom-up rebalance scheme, with one twist: any node
//! whose *topology* changes is replaced by a fresh copy instead of being
//! edited, and the original is retired. Links are the only in-place writes
//! readers can observe, and each one publishes a subtree that is already
//! complete:
//!
//! ```text
//!   single rotation (d = Left)            double rotation (d = Left)
//!
//!       R                 S                    R                    P
//!      / \               / \                  / \                 /   \
//!     a   S      ──►    R'  c                a   C      ──►      R'    C'
//!        / \           / \                      / \             / \   / \
//!       b   c         a   b                    P   d           a  b  c   d
//!                                             / \
//!                                            b   c
//!
//!   R' is a copy of R; S keeps its identity.   R' and C' are copies; P keeps its identity.
//! ```
//!
//! Balance factors are plain atomics updated in place; readers never
//! consult them.

use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicU32};

use crossbeam_epoch::Guard;
use smallvec::SmallVec;

use crate::arena::{Arena, NodeStore};
use crate::error::Result;
use crate::node::{Dir, Handle, Node};
use crate::reclaim::Retired;

/// Nodes on a search path, with the direction taken below each.
type Path = SmallVec<[(Handle, Dir); 64]>;

/// Where the root of a subtree is stored.
#[derive(Debug, Clone, Copy)]
enum Link {
	Root,
	Child(Handle, Dir),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Insertion {
	/// The key was already present.
	Present,
	/// Inserted, and the subtree height is unchanged.
	Absorbed,
	/// Inserted, and the subtree grew by one level.
	Grew,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
	/// The key was not present.
	Missing,
	/// Removed, and the subtree height is unchanged.
	Settled,
	/// Removed, and the subtree lost one level.
	Shrunk,
}

/// One structural mutation in progress.
pub(crate) struct Balancer<'a, T> {
	nodes: &'a NodeStore<T>,
	arena: &'a mut Arena<T>,
	root: &'a AtomicU32,
	guard: &'a Guard,
	deadline: u64,
	retired: Retired,
}

impl<'a, T: Ord + Clone> Balancer<'a, T> {
	/// Starts a mutation. Nodes retired by it are stamped with `deadline`.
	pub(crate) fn new(
		nodes: &'a NodeStore<T>,
		arena: &'a mut Arena<T>,
		root: &'a AtomicU32,
		guard: &'a Guard,
		deadline: u64,
	) -> Self {
		Balancer {
			nodes,
			arena,
			root,
			guard,
			deadline,
			retired: Retired::new(),
		}
	}

	/// Handles retired so far, to be handed to the reclaimer.
	pub(crate) fn finish(self) -> Retired {
		self.retired
	}

	// -----------------------------------------------------------------------
	// Node access
	// -----------------------------------------------------------------------

	#[inline]
	fn node(&self, handle: Handle) -> &'a Node<T> {
		self.nodes.get(handle, self.guard)
	}

	#[inline]
	fn key_of(&self, handle: Handle) -> &'a T {
		// SAFETY: the balancer runs on the worker, the only writer of keys.
		match unsafe { self.node(handle).key() } {
			Some(key) => key,
			None => unreachable!("linked node {handle:?} has no key - arena bookkeeping violated"),
		}
	}

	#[inline]
	fn load(&self, link: Link) -> Handle {
		match link {
			Link::Root => Handle::from_raw(self.root.load(atomic::Ordering::Acquire)),
			Link::Child(parent, dir) => self.node(parent).child(dir),
		}
	}

	#[inline]
	fn store(&self, link: Link, handle: Handle) {
		match link {
			Link::Root => self.root.store(handle.to_raw(), atomic::Ordering::Release),
			Link::Child(parent, dir) => self.node(parent).set_child(dir, handle),
		}
	}

	/// Allocates an unlinked copy of `original`, optionally with another key.
	fn copy_of(&mut self, original: Handle, key: Option<T>) -> Result<Handle> {
		let source = self.node(original);
		let key = match key {
			Some(key) => key,
			None => self.key_of(original).clone(),
		};
		let copy = self.arena.allocate(self.guard)?;
		// SAFETY: `copy` was just taken off the free list and is not linked.
		unsafe {
			self.node(copy).fill(
				key,
				source.child(Dir::Left),
				source.child(Dir::Right),
				source.balance(),
			)
		};
		Ok(copy)
	}

	fn retire(&mut self, handle: Handle) {
		self.node(handle).retire(self.deadline);
		self.retired.push(handle);
	}

	/// Key at the far end of the tree in direction `dir`.
	pub(crate) fn extreme(&self, dir: Dir) -> Option<T> {
		let mut current = self.load(Link::Root);
		if current.is_nil() {
			return None;
		}
		loop {
			let next = self.node(current).child(dir);
			if next.is_nil() {
				return Some(self.key_of(current).clone());
			}
			current = next;
		}
	}

	// -----------------------------------------------------------------------
	// Slot accounting
	// -----------------------------------------------------------------------

	/// Makes sure `slots` nodes can be allocated without failing halfway.
	pub(crate) fn reserve(&mut self, slots: usize) -> Result<()> {
		self.arena.reserve(slots, self.guard)
	}

	/// Slots that inserting `key` will allocate, or `None` if it is present.
	///
	/// One for the new leaf, plus one or two for the rotation the first
	/// unbalanced ancestor needs, if any.
	pub(crate) fn insert_cost(&self, key: &T) -> Option<usize> {
		let mut path = Path::new();
		let mut current = self.load(Link::Root);
		while !current.is_nil() {
			let dir = match key.cmp(self.key_of(current)) {
				Ordering::Equal => return None,
				Ordering::Less => Dir::Left,
				Ordering::Greater => Dir::Right,
			};
			path.push((current, dir));
			current = self.node(current).child(dir);
		}

		// Direction the grown child below leans after its own update.
		let mut below: Option<Dir> = None;
		for &(handle, dir) in path.iter().rev() {
			match self.node(handle).balance() + dir.sign() {
				0 => return Some(1),
				-1 | 1 => below = Some(dir),
				_ => return Some(if below == Some(dir) { 2 } else { 3 }),
			}
		}
		Some(1)
	}

	/// Slots that removing `key` will allocate, or `None` if it is absent.
	///
	/// Unlinking a node with at most one child allocates nothing. A node with
	/// two children costs the copy that carries its predecessor. Every
	/// rotation on the way back up costs one or two more.
	pub(crate) fn remove_cost(&self, key: &T) -> Option<usize> {
		let mut path = Path::new();
		let mut cost = 0;
		let mut current = self.load(Link::Root);
		loop {
			if current.is_nil() {
				return None;
			}
			let node = self.node(current);
			let dir = match key.cmp(self.key_of(current)) {
				Ordering::Less => Dir::Left,
				Ordering::Greater => Dir::Right,
				Ordering::Equal => {
					let left = node.child(Dir::Left);
					if !left.is_nil() && !node.child(Dir::Right).is_nil() {
						cost += 1;
						path.push((current, Dir::Left));
						let mut heir = left;
						loop {
							let next = self.node(heir).child(Dir::Right);
							if next.is_nil() {
								break;
							}
							path.push((heir, Dir::Right));
							heir = next;
						}
					}
					break;
				}
			};
			path.push((current, dir));
			current = node.child(dir);
		}

		// The subtree under the last entry has just lost a level.
		for &(handle, dir) in path.iter().rev() {
			let node = self.node(handle);
			match node.balance() - dir.sign() {
				-1 | 1 => break,
				0 => {}
				_ => {
					let sibling = self.node(node.child(dir.opposite())).balance();
					cost += if sibling == dir.sign() { 2 } else { 1 };
					if sibling == 0 {
						break;
					}
				}
			}
		}
		Some(cost)
	}

	// -----------------------------------------------------------------------
	// Rotations
	// -----------------------------------------------------------------------

	/// Rotates the subtree at `root` towards `dir` and returns its new root.
	fn rotate_single(&mut self, root: Handle, dir: Dir) -> Result<Handle> {
		let opposite = dir.opposite();
		let pivot = self.node(root).child(opposite);

		let copy = self.copy_of(root, None)?;
		self.node(copy).set_child(opposite, self.node(pivot).child(dir));
		self.node(pivot).set_child(dir, copy);

		self.retire(root);
		Ok(pivot)
	}

	/// Lifts the inner grandchild of `root` to the top of the subtree.
	fn rotate_double(&mut self, root: Handle, dir: Dir) -> Result<Handle> {
		let opposite = dir.opposite();
		let child = self.node(root).child(opposite);
		let pivot = self.node(child).child(dir);

		let top = self.copy_of(root, None)?;
		let side = self.copy_of(child, None)?;
		let lifted = self.node(pivot);
		self.node(side).set_child(dir, lifted.child(opposite));
		self.node(top).set_child(opposite, lifted.child(dir));
		lifted.set_child(opposite, side);
		lifted.set_child(dir, top);

		self.retire(root);
		self.retire(child);
		Ok(pivot)
	}

	/// Sets the balance factors of the three nodes taking part in a double
	/// rotation from the pivot's balance before the rotation.
	fn adjust_balance(&self, root: Handle, dir: Dir, bal: i8) {
		let top = self.node(root);
		let child = self.node(top.child(dir));
		let pivot = self.node(child.child(dir.opposite()));
		match pivot.balance() {
			0 => {
				top.set_balance(0);
				child.set_balance(0);
			}
			b if b == bal => {
				top.set_balance(-bal);
				child.set_balance(0);
			}
			_ => {
				top.set_balance(0);
				child.set_balance(bal);
			}
		}
		pivot.set_balance(0);
	}

	// -----------------------------------------------------------------------
	// Insertion
	// -----------------------------------------------------------------------

	/// Inserts `key`. Returns `false` if an equal key was already present.
	pub(crate) fn insert(&mut self, key: T) -> Result<bool> {
		Ok(self.insert_at(Link::Root, key)? != Insertion::Present)
	}

	fn insert_at(&mut self, link: Link, key: T) -> Result<Insertion> {
		let current = self.load(link);
		if current.is_nil() {
			let fresh = self.arena.allocate(self.guard)?;
			// SAFETY: `fresh` was just taken off the free list and is not linked.
			unsafe { self.node(fresh).fill(key, Handle::NIL, Handle::NIL, 0) };
			self.store(link, fresh);
			return Ok(Insertion::Grew);
		}

		let dir = match key.cmp(self.key_of(current)) {
			Ordering::Equal => return Ok(Insertion::Present),
			Ordering::Less => Dir::Left,
			Ordering::Greater => Dir::Right,
		};

		match self.insert_at(Link::Child(current, dir), key)? {
			Insertion::Grew => {}
			outcome => return Ok(outcome),
		}

		let node = self.node(current);
		let balance = node.balance() + dir.sign();
		node.set_balance(balance);
		match balance {
			0 => Ok(Insertion::Absorbed),
			-1 | 1 => Ok(Insertion::Grew),
			_ => {
				let top = self.rebalance_after_insert(current, dir)?;
				self.store(link, top);
				Ok(Insertion::Absorbed)
			}
		}
	}

	/// `root` is two levels heavier on `dir` after an insertion below it.
	fn rebalance_after_insert(&mut self, root: Handle, dir: Dir) -> Result<Handle> {
		let top = self.node(root);
		let child = self.node(top.child(dir));
		let bal = dir.sign();
		if child.balance() == bal {
			top.set_balance(0);
			child.set_balance(0);
			self.rotate_single(root, dir.opposite())
		} else {
			self.adjust_balance(root, dir, bal);
			self.rotate_double(root, dir.opposite())
		}
	}

	// -----------------------------------------------------------------------
	// Removal
	// -----------------------------------------------------------------------

	/// Removes the key equal to `key`. Returns `false` if there was none.
	pub(crate) fn remove(&mut self, key: &T) -> Result<bool> {
		Ok(self.remove_at(Link::Root, key)? != Removal::Missing)
	}

	fn remove_at(&mut self, link: Link, key: &T) -> Result<Removal> {
		let mut current = self.load(link);
		if current.is_nil() {
			return Ok(Removal::Missing);
		}

		let heir_key: T;
		let mut key = key;
		let mut replaced = false;
		let dir = match key.cmp(self.key_of(current)) {
			Ordering::Less => Dir::Left,
			Ordering::Greater => Dir::Right,
			Ordering::Equal => {
				let node = self.node(current);
				let (left, right) = (node.child(Dir::Left), node.child(Dir::Right));
				if left.is_nil() || right.is_nil() {
					self.store(link, if left.is_nil() { right } else { left });
					self.retire(current);
					return Ok(Removal::Shrunk);
				}

				// Two children: a copy carrying the in-order predecessor takes
				// this node's place, then the predecessor leaves the left subtree.
				let mut heir = left;
				loop {
					let next = self.node(heir).child(Dir::Right);
					if next.is_nil() {
						break;
					}
					heir = next;
				}
				heir_key = self.key_of(heir).clone();
				let copy = self.copy_of(current, Some(heir_key.clone()))?;
				self.store(link, copy);
				self.retire(current);

				current = copy;
				key = &heir_key;
				replaced = true;
				Dir::Left
			}
		};

		match self.remove_at(Link::Child(current, dir), key)? {
			Removal::Shrunk => {}
			Removal::Missing if replaced => {
				unreachable!("in-order predecessor vanished during removal")
			}
			outcome => return Ok(outcome),
		}

		let node = self.node(current);
		let balance = node.balance() - dir.sign();
		node.set_balance(balance);
		match balance {
			-1 | 1 => Ok(Removal::Settled),
			0 => Ok(Removal::Shrunk),
			_ => {
				let (top, settled) = self.rebalance_after_remove(current, dir)?;
				self.store(link, top);
				Ok(if settled {
					Removal::Settled
				} else {
					Removal::Shrunk
				})
			}
		}
	}

	/// `root` is two levels lighter on `dir` after a removal below it.
	/// Returns the new subtree root and whether the subtree kept its height.
	fn rebalance_after_remove(&mut self, root: Handle, dir: Dir) -> Result<(Handle, bool)> {
		let top = self.node(root);
		let child = self.node(top.child(dir.opposite()));
		let bal = dir.sign();
		match child.balance() {
			b if b == -bal => {
				top.set_balance(0);
				child.set_balance(0);
				Ok((self.rotate_single(root, dir)?, false))
			}
			b if b == bal => {
				self.adjust_balance(root, dir.opposite(), -bal);
				Ok((self.rotate_double(root, dir)?, false))
			}
			_ => {
				top.set_balance(-bal);
				child.set_balance(bal);
				Ok((self.rotate_single(root, dir)?, true))
			}
		}
	}
}
