//! # cowavl: A Concurrent Copy-on-Write AVL Set
//!
//! This crate provides an ordered in-memory set in which reads are lock-free
//! and every mutation is applied by a single background worker. Readers never
//! block, never retry and never take a lock, no matter how many mutations are
//! in flight.
//!
//! ## Design Overview
//!
//! ### Key Concepts
//!
//! **Single mutator**: [`Tree::insert`] and [`Tree::remove`] only enqueue a
//! request on a bounded channel and return immediately. A [`Worker`] drains
//! the channels and is the only code that ever changes the tree, so the
//! balancer needs no synchronisation against other writers.
//!
//! **Copy-on-write rotations**: a node that a reader could be standing on is
//! never edited in a way that could send that reader the wrong way. Rotations
//! and two-child removals allocate fresh copies of the nodes whose shape
//! changes, link the copies in with a single atomic store, and retire the
//! originals. Subtrees that do not change are shared between versions.
//!
//! **Arena handles**: nodes live in slabs of an append-only arena and refer to
//! each other by `u32` handles. Slabs never move, so a handle stays valid for
//! as long as the reader that loaded it is pinned.
//!
//! **Two-gate reclamation**: a retired slot is reused only after the
//! `crossbeam_epoch` epoch has advanced past every reader that could have
//! reached it, *and* its grace period has elapsed.
//!
//! ### Structure
//!
//! ```text
//!    producers                      worker thread
//!   ┌──────────┐   insert queue   ┌──────────────┐
//!   │ insert() ├─────────────────►│              │
//!   │ remove() ├─────────────────►│   Balancer   ├──► Arena (slabs)
//!   └──────────┘   remove queue   │  Reclaimer   │       ▲
//!                                 └──────┬───────┘       │
//!    readers                             │ root, min,    │ handles
//!   ┌──────────┐                         ▼ max, len      │
//!   │ get()    ├──────────────────► IndexRoot ───────────┘
//!   │ iterate()│   (epoch pinned)
//!   └──────────┘
//! ```
//!
//! ## Basic Usage
//!
//! ```
//! use cowavl::Tree;
//!
//! let tree = Tree::new();
//!
//! // Mutations are asynchronous
//! tree.insert(5);
//! tree.insert(3);
//! tree.insert(8);
//!
//! // Wait until the worker has applied them
//! tree.sync().unwrap();
//!
//! assert_eq!(tree.get(&3), Some(3));
//! assert_eq!(tree.min(), Some(3));
//! assert_eq!(tree.max(), Some(8));
//! assert_eq!(tree.sorted_keys(), vec![3, 5, 8]);
//! ```
//!
//! ## Thread Safety
//!
//! `Tree<T>` is `Send + Sync` and is meant to be shared through an `Arc`.
//! Requests from one producer are applied in the order they were accepted
//! within each queue, but no order is guaranteed between the insert queue and
//! the remove queue. Call [`Tree::sync`] between dependent phases.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{atomic, Arc};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use crossbeam_epoch::{self as epoch, Guard};
use smallvec::SmallVec;
use tracing::{error, warn};

pub mod config;
pub mod error;
pub mod iter;

mod arena;
mod balance;
mod node;
mod reclaim;
mod root;
mod worker;

pub use config::Config;
pub use error::{Error, Queue, Result};
pub use worker::{Stats, Worker};

use arena::{Arena, NodeStore};
use node::{Dir, Handle};
use reclaim::Reclaimer;
use worker::Shared;

/// Name of the thread spawned by [`Tree::with_config`].
const WORKER_THREAD_NAME: &str = "cowavl-worker";

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// A concurrent ordered set with lock-free reads and a single mutator.
///
/// # Type Parameters
///
/// - `T`: The key type. Keys are compared with `Ord`; equal keys are
///   deduplicated, the first insert wins. Readers receive clones.
///
/// Dropping the tree closes both request queues and joins the worker thread,
/// if the tree spawned one. Requests still queued at that point are applied
/// before the worker exits.
pub struct Tree<T> {
	shared: Arc<Shared<T>>,
	/// `None` only while dropping.
	queues: Option<Queues<T>>,
	worker: Option<JoinHandle<()>>,
}

struct Queues<T> {
	inserts: Sender<T>,
	removes: Sender<T>,
}

impl<T> Tree<T>
where
	T: Ord + Clone + Send + Sync + 'static,
{
	// -----------------------------------------------------------------------
	// Construction
	// -----------------------------------------------------------------------

	/// Creates an empty tree with the default [`Config`] and spawns its worker.
	///
	/// # Panics
	///
	/// Panics if the operating system refuses to spawn the worker thread. Use
	/// [`Tree::with_config`] to handle that case.
	pub fn new() -> Self {
		match Self::with_config(Config::default()) {
			Ok(tree) => tree,
			Err(err) => panic!("failed to start tree worker: {err}"),
		}
	}

	/// Creates an empty tree with the given arena size and queue capacities.
	///
	/// ```
	/// use cowavl::Tree;
	///
	/// let tree: Tree<u64> = Tree::with_capacity(4096, 256, 256).unwrap();
	/// assert!(tree.is_empty());
	/// assert_eq!(tree.stats().capacity, 4096);
	/// ```
	pub fn with_capacity(
		arena_capacity: usize,
		insert_queue_capacity: usize,
		remove_queue_capacity: usize,
	) -> Result<Self> {
		Self::with_config(
			Config::default()
				.initial_capacity(arena_capacity)
				.insert_queue_capacity(insert_queue_capacity)
				.remove_queue_capacity(remove_queue_capacity),
		)
	}

	/// Creates an empty tree and runs its worker on a dedicated thread.
	pub fn with_config(config: Config) -> Result<Self> {
		let (mut tree, worker) = Self::detached(config)?;
		let handle = thread::Builder::new()
			.name(WORKER_THREAD_NAME.to_string())
			.spawn(move || worker.run())?;
		tree.worker = Some(handle);
		Ok(tree)
	}

	/// Creates an empty tree without starting its worker.
	///
	/// The caller decides where mutations run: move the [`Worker`] onto a
	/// thread with [`Worker::run`], or step it with [`Worker::run_pending`].
	///
	/// ```
	/// use cowavl::{Config, Tree};
	///
	/// let (tree, mut worker) = Tree::detached(Config::default()).unwrap();
	/// tree.insert(1);
	/// tree.insert(2);
	/// assert!(tree.is_empty());
	///
	/// assert_eq!(worker.run_pending(), 2);
	/// assert_eq!(tree.len(), 2);
	/// ```
	pub fn detached(config: Config) -> Result<(Self, Worker<T>)> {
		config.validate()?;
		let (insert_tx, insert_rx) = bounded(config.insert_queue_capacity);
		let (remove_tx, remove_rx) = bounded(config.remove_queue_capacity);
		let arena = Arena::new(&config);
		let reclaimer = Reclaimer::new(config.grace_period, config.reclaim_queue_capacity());
		let worker = Worker::new(arena, reclaimer, insert_rx, remove_rx);
		let tree = Tree {
			shared: worker.shared().clone(),
			queues: Some(Queues {
				inserts: insert_tx,
				removes: remove_tx,
			}),
			worker: None,
		};
		Ok((tree, worker))
	}

	// -----------------------------------------------------------------------
	// Mutations
	// -----------------------------------------------------------------------

	/// Requests that `key` be added. Never blocks.
	///
	/// If the insert queue is full the request is dropped and a warning is
	/// logged. Use [`try_insert`](Self::try_insert) to observe that.
	pub fn insert(&self, key: T) {
		if let Err(err) = self.try_insert(key) {
			warn!(%err, "insert request not queued");
		}
	}

	/// Requests that `key` be removed. Never blocks.
	///
	/// If the remove queue is full the request is dropped and a warning is
	/// logged. Use [`try_remove`](Self::try_remove) to observe that.
	pub fn remove(&self, key: T) {
		if let Err(err) = self.try_remove(key) {
			warn!(%err, "remove request not queued");
		}
	}

	/// Like [`insert`](Self::insert), but reports a dropped request.
	///
	/// # Errors
	///
	/// [`Error::QueueFull`] if the insert queue is at capacity, or
	/// [`Error::Disconnected`] if the worker has exited.
	pub fn try_insert(&self, key: T) -> Result<()> {
		self.enqueue(Queue::Insert, key)
	}

	/// Like [`remove`](Self::remove), but reports a dropped request.
	///
	/// # Errors
	///
	/// [`Error::QueueFull`] if the remove queue is at capacity, or
	/// [`Error::Disconnected`] if the worker has exited.
	pub fn try_remove(&self, key: T) -> Result<()> {
		self.enqueue(Queue::Remove, key)
	}

	fn enqueue(&self, queue: Queue, key: T) -> Result<()> {
		let queues = self.queues.as_ref().ok_or(Error::Disconnected)?;
		let sender = match queue {
			Queue::Insert => &queues.inserts,
			Queue::Remove => &queues.removes,
		};
		match sender.try_send(key) {
			Ok(()) => {
				self.shared.progress.accept();
				Ok(())
			}
			Err(TrySendError::Full(_)) => {
				self.shared.counters.dropped.fetch_add(1, atomic::Ordering::Relaxed);
				Err(Error::QueueFull {
					queue,
				})
			}
			Err(TrySendError::Disconnected(_)) => Err(Error::Disconnected),
		}
	}

	/// Blocks until every request accepted before this call has been
	/// processed, whether it was applied, turned out to be a no-op, or was
	/// rejected.
	///
	/// On a detached tree the [`Worker`] must be driven from another thread
	/// while this call waits.
	///
	/// # Errors
	///
	/// [`Error::Disconnected`] if the worker exited with requests outstanding.
	pub fn sync(&self) -> Result<()> {
		self.shared.progress.wait()
	}
}

impl<T> Tree<T> {
	// -----------------------------------------------------------------------
	// Point Reads
	// -----------------------------------------------------------------------

	/// Looks up `key` and, if present, calls `f` with the stored key.
	///
	/// The closure runs while the current epoch is pinned, so it must not
	/// block for long.
	///
	/// ```
	/// use cowavl::Tree;
	///
	/// let tree: Tree<String> = Tree::new();
	/// tree.insert("apple".to_string());
	/// tree.sync().unwrap();
	///
	/// assert_eq!(tree.lookup("apple", |k| k.len()), Some(5));
	/// assert_eq!(tree.lookup("pear", |k| k.len()), None);
	/// ```
	pub fn lookup<Q, R, F>(&self, key: &Q, f: F) -> Option<R>
	where
		T: Borrow<Q>,
		Q: ?Sized + Ord,
		F: FnOnce(&T) -> R,
	{
		let guard = epoch::pin();
		let (Some(min), Some(max)) = self.shared.index.bounds(&guard) else {
			return None;
		};
		let (min, max): (&Q, &Q) = (min.borrow(), max.borrow());
		if key < min || key > max {
			return None;
		}

		let mut current = self.shared.index.root();
		while !current.is_nil() {
			let node = self.shared.nodes.get(current, &guard);
			// SAFETY: `current` was reached through a link while pinned.
			let here = unsafe { node.key() }?;
			let stored: &Q = here.borrow();
			current = match key.cmp(stored) {
				Ordering::Equal => return Some(f(here)),
				Ordering::Less => node.child(Dir::Left),
				Ordering::Greater => node.child(Dir::Right),
			};
		}
		None
	}

	/// Returns a clone of the stored key equal to `key`.
	///
	/// ```
	/// use cowavl::Tree;
	///
	/// let tree = Tree::new();
	/// tree.insert(7);
	/// tree.sync().unwrap();
	///
	/// assert_eq!(tree.get(&7), Some(7));
	/// assert_eq!(tree.get(&8), None);
	/// ```
	pub fn get<Q>(&self, key: &Q) -> Option<T>
	where
		T: Borrow<Q> + Clone,
		Q: ?Sized + Ord,
	{
		self.lookup(key, T::clone)
	}

	/// Returns `true` if a key equal to `key` is in the tree.
	pub fn contains<Q>(&self, key: &Q) -> bool
	where
		T: Borrow<Q>,
		Q: ?Sized + Ord,
	{
		self.lookup(key, |_| ()).is_some()
	}

	/// Smallest key, read from the cached bound in O(1).
	pub fn min(&self) -> Option<T>
	where
		T: Clone,
	{
		let guard = epoch::pin();
		self.shared.index.bounds(&guard).0.cloned()
	}

	/// Largest key, read from the cached bound in O(1).
	pub fn max(&self) -> Option<T>
	where
		T: Clone,
	{
		let guard = epoch::pin();
		self.shared.index.bounds(&guard).1.cloned()
	}

	// -----------------------------------------------------------------------
	// Scans
	// -----------------------------------------------------------------------

	/// Visits every live key in arena order, not key order, until `visitor`
	/// returns `false`.
	///
	/// The scan is not a snapshot. While mutations are in flight it can see a
	/// key twice (an original and its copy) or a key that is not linked yet.
	///
	/// ```
	/// use cowavl::Tree;
	///
	/// let tree = Tree::new();
	/// for k in 0..10 {
	/// 	tree.insert(k);
	/// }
	/// tree.sync().unwrap();
	///
	/// let mut seen = 0;
	/// tree.iterate(|_| {
	/// 	seen += 1;
	/// 	seen < 3
	/// });
	/// assert_eq!(seen, 3);
	/// ```
	pub fn iterate<F>(&self, visitor: F)
	where
		F: FnMut(&T) -> bool,
	{
		let guard = epoch::pin();
		iter::scan(&self.shared.nodes, &guard, visitor);
	}

	/// Returns an iterator over clones of the live keys, in arena order.
	///
	/// The iterator keeps the current epoch pinned until it is dropped, which
	/// holds back reclamation of every node retired meanwhile.
	pub fn iter(&self) -> iter::Iter<'_, T>
	where
		T: Clone,
	{
		iter::Iter::new(&self.shared.nodes)
	}

	/// Returns clones of all keys in ascending order.
	pub fn sorted_keys(&self) -> Vec<T>
	where
		T: Clone,
	{
		let guard = epoch::pin();
		let nodes = &self.shared.nodes;
		let mut keys = Vec::with_capacity(self.len());
		let mut stack: SmallVec<[Handle; 64]> = SmallVec::new();
		let mut current = self.shared.index.root();
		loop {
			while !current.is_nil() {
				stack.push(current);
				current = nodes.get(current, &guard).child(Dir::Left);
			}
			let Some(handle) = stack.pop() else {
				break;
			};
			let node = nodes.get(handle, &guard);
			// SAFETY: reached through a link while pinned.
			if let Some(key) = unsafe { node.key() } {
				keys.push(key.clone());
			}
			current = node.child(Dir::Right);
		}
		keys
	}

	// -----------------------------------------------------------------------
	// Tree Metadata
	// -----------------------------------------------------------------------

	/// Number of keys, as of the last mutation the worker applied.
	pub fn len(&self) -> usize {
		self.shared.index.len()
	}

	/// Returns `true` if the tree holds no keys.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Number of edges on the longest root-to-leaf path.
	///
	/// An empty tree and a single-node tree both have height 0.
	///
	/// ```
	/// use cowavl::Tree;
	///
	/// let tree = Tree::new();
	/// for k in 1..=7 {
	/// 	tree.insert(k);
	/// }
	/// tree.sync().unwrap();
	/// assert_eq!(tree.height(), 2);
	/// ```
	pub fn height(&self) -> usize {
		fn levels<T>(nodes: &NodeStore<T>, handle: Handle, guard: &Guard) -> usize {
			if handle.is_nil() {
				return 0;
			}
			let node = nodes.get(handle, guard);
			1 + levels(nodes, node.child(Dir::Left), guard).max(levels(
				nodes,
				node.child(Dir::Right),
				guard,
			))
		}
		let guard = epoch::pin();
		levels(&self.shared.nodes, self.shared.index.root(), &guard).saturating_sub(1)
	}

	/// Arena, reclamation and request counters.
	pub fn stats(&self) -> Stats {
		self.shared.counters.snapshot(self.len())
	}
}

impl<T> Default for Tree<T>
where
	T: Ord + Clone + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}

impl<T> fmt::Debug for Tree<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Tree").field("stats", &self.stats()).finish()
	}
}

impl<T> Drop for Tree<T> {
	fn drop(&mut self) {
		// Disconnecting both queues lets the worker drain them and exit.
		drop(self.queues.take());
		if let Some(worker) = self.worker.take() {
			if worker.join().is_err() {
				error!("tree worker panicked");
			}
		}
	}
}

// ===========================================================================
// Test-Only Validation
// ===========================================================================

#[cfg(any(test, feature = "test-utils"))]
impl<T: Ord + fmt::Debug> Tree<T> {
	/// Validates the structure of the tree. Panics with diagnostic info if
	/// any invariant is violated.
	///
	/// Only meaningful once the worker is idle, e.g. right after
	/// [`sync`](Self::sync).
	///
	/// # Invariants Checked
	///
	/// 1. Key ordering: every key lies strictly between its ancestors' bounds
	/// 2. AVL balance: sibling heights differ by at most one
	/// 3. Balance factors: each stored factor equals the real height difference
	/// 4. Liveness: every linked node is `Live`
	/// 5. Length: `len()` equals the number of linked nodes
	/// 6. Bounds: cached min/max equal the leftmost and rightmost keys
	pub fn assert_invariants(&self) {
		let guard = epoch::pin();
		let mut count = 0;
		self.validate_subtree(self.shared.index.root(), None, None, &mut count, &guard);

		// Invariant 5: Length
		assert_eq!(count, self.len(), "len() disagrees with linked node count");

		// Invariant 6: Bounds
		let (min, max) = self.shared.index.bounds(&guard);
		assert_eq!(min, self.extreme(Dir::Left, &guard), "cached min is stale");
		assert_eq!(max, self.extreme(Dir::Right, &guard), "cached max is stale");
	}

	fn extreme<'g>(&'g self, dir: Dir, guard: &'g Guard) -> Option<&'g T> {
		let mut current = self.shared.index.root();
		let mut last = None;
		while !current.is_nil() {
			let node = self.shared.nodes.get(current, guard);
			// SAFETY: test-only walk while pinned.
			last = unsafe { node.key() };
			current = node.child(dir);
		}
		last
	}

	/// Returns the height of the subtree in levels.
	fn validate_subtree(
		&self,
		handle: Handle,
		lower: Option<&T>,
		upper: Option<&T>,
		count: &mut usize,
		guard: &Guard,
	) -> usize {
		if handle.is_nil() {
			return 0;
		}
		let node = self.shared.nodes.get(handle, guard);

		// Invariant 4: Liveness
		assert_eq!(node.state(), node::State::Live, "node {handle:?} is linked but not live");
		// SAFETY: test-only walk while pinned.
		let key = unsafe { node.key() }
			.unwrap_or_else(|| panic!("live node {handle:?} has no key"));

		// Invariant 1: Key ordering
		if let Some(lower) = lower {
			assert!(lower < key, "key {key:?} not above ancestor bound {lower:?}");
		}
		if let Some(upper) = upper {
			assert!(key < upper, "key {key:?} not below ancestor bound {upper:?}");
		}

		*count += 1;
		let left = self.validate_subtree(node.child(Dir::Left), lower, Some(key), count, guard);
		let right = self.validate_subtree(node.child(Dir::Right), Some(key), upper, count, guard);
		let diff = right as i64 - left as i64;

		// Invariant 2: AVL balance
		assert!(diff.abs() <= 1, "node {key:?} out of balance: right - left = {diff}");
		// Invariant 3: Balance factors
		assert_eq!(i64::from(node.balance()), diff, "stale balance factor on node {key:?}");

		1 + left.max(right)
	}
}
