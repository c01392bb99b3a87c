//! The single mutator of a tree.
//!
//! Every insert and remove is funnelled through two bounded channels into a
//! [`Worker`], which owns the arena and the reclaimer. Readers share only
//! [`Shared`] with it.
//!
//! ```text
//!   insert()  ──► [insert queue] ──┐
//!   remove()  ──► [remove queue] ──┼──► Worker ──► Balancer ──► Arena
//!   epoch     ──► [notices]      ──┘       │
//!                                          └──► Reclaimer
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver};
use crossbeam_epoch::{self as epoch, Guard};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::arena::{Arena, NodeStore};
use crate::balance::Balancer;
use crate::error::{Error, Result};
use crate::node::{Dir, Handle};
use crate::reclaim::Reclaimer;
use crate::root::IndexRoot;

/// How often the epoch is nudged while retirements wait on it.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Wake-up interval with nothing to reclaim.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// State shared between a tree handle, its readers and its worker.
pub(crate) struct Shared<T> {
	pub(crate) nodes: Arc<NodeStore<T>>,
	pub(crate) index: IndexRoot<T>,
	pub(crate) progress: Progress,
	pub(crate) counters: Counters,
}

/// Tracks accepted versus processed requests for [`Tree::sync`](crate::Tree::sync).
pub(crate) struct Progress {
	accepted: AtomicU64,
	processed: Mutex<u64>,
	changed: Condvar,
	closed: AtomicBool,
}

impl Progress {
	fn new() -> Self {
		Progress {
			accepted: AtomicU64::new(0),
			processed: Mutex::new(0),
			changed: Condvar::new(),
			closed: AtomicBool::new(false),
		}
	}

	pub(crate) fn accept(&self) {
		self.accepted.fetch_add(1, Ordering::AcqRel);
	}

	fn complete(&self, count: u64) {
		let mut processed = self.processed.lock();
		*processed += count;
		self.changed.notify_all();
	}

	fn close(&self) {
		let _processed = self.processed.lock();
		self.closed.store(true, Ordering::Release);
		self.changed.notify_all();
	}

	/// Blocks until everything accepted so far has been processed.
	pub(crate) fn wait(&self) -> Result<()> {
		let target = self.accepted.load(Ordering::Acquire);
		let mut processed = self.processed.lock();
		while *processed < target {
			if self.closed.load(Ordering::Acquire) {
				return Err(Error::Disconnected);
			}
			self.changed.wait(&mut processed);
		}
		Ok(())
	}
}

/// Counters published by the worker (and, for `dropped`, by producers).
#[derive(Default)]
pub(crate) struct Counters {
	pub(crate) capacity: AtomicUsize,
	pub(crate) free: AtomicUsize,
	pub(crate) slabs: AtomicUsize,
	pub(crate) pending_reclaim: AtomicUsize,
	pub(crate) reclaimed: AtomicU64,
	pub(crate) applied: AtomicU64,
	pub(crate) rejected: AtomicU64,
	pub(crate) dropped: AtomicU64,
}

impl Counters {
	pub(crate) fn snapshot(&self, len: usize) -> Stats {
		Stats {
			len,
			capacity: self.capacity.load(Ordering::Relaxed),
			free: self.free.load(Ordering::Relaxed),
			slabs: self.slabs.load(Ordering::Relaxed),
			pending_reclaim: self.pending_reclaim.load(Ordering::Relaxed),
			reclaimed: self.reclaimed.load(Ordering::Relaxed),
			applied: self.applied.load(Ordering::Relaxed),
			rejected: self.rejected.load(Ordering::Relaxed),
			dropped: self.dropped.load(Ordering::Relaxed),
		}
	}
}

/// A point-in-time view of a tree's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
	/// Keys in the tree.
	pub len: usize,
	/// Arena slots across all slabs.
	pub capacity: usize,
	/// Slots on the free list.
	pub free: usize,
	/// Slabs in the arena directory.
	pub slabs: usize,
	/// Retired nodes not yet reusable.
	pub pending_reclaim: usize,
	/// Slots returned to the free list so far.
	pub reclaimed: u64,
	/// Requests that changed the tree.
	pub applied: u64,
	/// Requests refused because the arena hit its ceiling.
	pub rejected: u64,
	/// Requests shed because their queue was full.
	pub dropped: u64,
}

/// The mutator of a tree created with [`Tree::detached`](crate::Tree::detached).
///
/// Drive it either by moving it onto a thread with [`Worker::run`], or by
/// calling [`Worker::run_pending`] whenever queued requests should be applied.
pub struct Worker<T> {
	shared: Arc<Shared<T>>,
	arena: Arena<T>,
	reclaimer: Reclaimer,
	inserts: Receiver<T>,
	removes: Receiver<T>,
	last_flush: Instant,
}

impl<T> Worker<T>
where
	T: Ord + Clone + Send + Sync + 'static,
{
	pub(crate) fn new(
		arena: Arena<T>,
		reclaimer: Reclaimer,
		inserts: Receiver<T>,
		removes: Receiver<T>,
	) -> Self {
		let shared = Arc::new(Shared {
			nodes: arena.store().clone(),
			index: IndexRoot::new(),
			progress: Progress::new(),
			counters: Counters::default(),
		});
		let worker = Worker {
			shared,
			arena,
			reclaimer,
			inserts,
			removes,
			last_flush: Instant::now(),
		};
		worker.publish_stats();
		worker
	}

	pub(crate) fn shared(&self) -> &Arc<Shared<T>> {
		&self.shared
	}

	/// Applies requests until every tree handle is dropped.
	pub fn run(mut self) {
		debug!("tree worker started");
		let inserts = self.inserts.clone();
		let removes = self.removes.clone();
		let notices = self.reclaimer.notices().clone();
		loop {
			let timeout = self.tick();
			select! {
				recv(inserts) -> msg => match msg {
					Ok(key) => self.apply_insert(key),
					Err(_) => break,
				},
				recv(removes) -> msg => match msg {
					Ok(key) => self.apply_remove(key),
					Err(_) => break,
				},
				recv(notices) -> msg => {
					if let Ok(handle) = msg {
						self.accept(handle);
					}
				},
				default(timeout) => {},
			}
			self.maintain(false);
		}
		// One queue disconnected; the other may still hold requests.
		self.run_pending();
		debug!(reclaimed = self.reclaimer.reclaimed(), "tree worker stopped");
	}

	/// Applies every request queued right now without blocking, then
	/// reclaims whatever has become reusable. Returns the number of
	/// requests processed.
	pub fn run_pending(&mut self) -> usize {
		let mut processed = 0;
		loop {
			let mut progressed = false;
			if let Ok(key) = self.inserts.try_recv() {
				self.apply_insert(key);
				processed += 1;
				progressed = true;
			}
			if let Ok(key) = self.removes.try_recv() {
				self.apply_remove(key);
				processed += 1;
				progressed = true;
			}
			if !progressed {
				break;
			}
		}
		self.maintain(true);
		processed
	}

	/// Time until the next reclamation step is due.
	///
	/// The epoch only needs nudging while retirements wait on it. Slots
	/// parked for their grace period just need a wake-up at the deadline.
	fn tick(&self) -> Duration {
		let mut timeout = IDLE_TICK;
		if self.reclaimer.awaiting_epoch() > 0 {
			timeout = FLUSH_INTERVAL;
		}
		if let Some(deadline) = self.reclaimer.next_deadline() {
			timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
		}
		timeout
	}

	fn apply_insert(&mut self, key: T) {
		let guard = epoch::pin();
		let outcome = self.insert(key, &guard);
		self.settle(outcome);
	}

	fn apply_remove(&mut self, key: T) {
		let guard = epoch::pin();
		let outcome = self.remove(&key, &guard);
		self.settle(outcome);
	}

	fn insert(&mut self, key: T, guard: &Guard) -> Result<bool> {
		let shared = &*self.shared;
		let deadline = self.reclaimer.deadline();
		let mut balancer =
			Balancer::new(&shared.nodes, &mut self.arena, shared.index.link(), guard, deadline);
		let Some(cost) = balancer.insert_cost(&key) else {
			return Ok(false);
		};
		balancer.reserve(cost)?;
		// Bounds cover the key before it is reachable, so a reader that
		// finds it never rejects it on the bounds check.
		shared.index.widen(&key, guard);
		balancer.insert(key)?;
		let retired = balancer.finish();
		self.reclaimer.defer(retired, guard);
		shared.index.grew();
		Ok(true)
	}

	fn remove(&mut self, key: &T, guard: &Guard) -> Result<bool> {
		let shared = &*self.shared;
		let deadline = self.reclaimer.deadline();
		let mut balancer =
			Balancer::new(&shared.nodes, &mut self.arena, shared.index.link(), guard, deadline);
		let Some(cost) = balancer.remove_cost(key) else {
			return Ok(false);
		};
		balancer.reserve(cost)?;
		balancer.remove(key)?;
		let (min, max) = shared.index.bounds(guard);
		if min == Some(key) || max == Some(key) {
			// Narrowed only after the key is unlinked.
			let (min, max) = (balancer.extreme(Dir::Left), balancer.extreme(Dir::Right));
			shared.index.set_bounds(min, max, guard);
		}
		let retired = balancer.finish();
		self.reclaimer.defer(retired, guard);
		shared.index.shrank();
		Ok(true)
	}

	fn settle(&mut self, outcome: Result<bool>) {
		let counters = &self.shared.counters;
		match outcome {
			Ok(true) => {
				counters.applied.fetch_add(1, Ordering::Relaxed);
			}
			Ok(false) => {}
			Err(err) => {
				error!(%err, "tree mutation rejected");
				counters.rejected.fetch_add(1, Ordering::Relaxed);
			}
		}
		self.publish_stats();
		self.shared.progress.complete(1);
	}

	fn accept(&mut self, handle: Handle) {
		let guard = epoch::pin();
		self.reclaimer.accept(handle, &mut self.arena, &guard);
	}

	/// Drains reclaim notices, frees expired slots and nudges the epoch.
	fn maintain(&mut self, force_flush: bool) {
		let guard = epoch::pin();
		if self.reclaimer.awaiting_epoch() > 0
			&& (force_flush || self.last_flush.elapsed() >= FLUSH_INTERVAL)
		{
			guard.flush();
			self.last_flush = Instant::now();
		}
		while let Ok(handle) = self.reclaimer.notices().try_recv() {
			self.reclaimer.accept(handle, &mut self.arena, &guard);
		}
		self.reclaimer.collect_expired(&mut self.arena, &guard);
		drop(guard);
		self.publish_stats();
	}

	fn publish_stats(&self) {
		let counters = &self.shared.counters;
		let guard = epoch::pin();
		counters.capacity.store(self.arena.capacity(), Ordering::Relaxed);
		counters.free.store(self.arena.free_len(), Ordering::Relaxed);
		counters.slabs.store(self.arena.store().slabs(&guard).len(), Ordering::Relaxed);
		counters.pending_reclaim.store(self.reclaimer.pending(), Ordering::Relaxed);
		counters.reclaimed.store(self.reclaimer.reclaimed(), Ordering::Relaxed);
	}
}

impl<T> Drop for Worker<T> {
	fn drop(&mut self) {
		self.shared.progress.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crossbeam_channel::bounded;

	fn worker(config: &Config) -> (Worker<u32>, crossbeam_channel::Sender<u32>, crossbeam_channel::Sender<u32>) {
		let (insert_tx, insert_rx) = bounded(config.insert_queue_capacity);
		let (remove_tx, remove_rx) = bounded(config.remove_queue_capacity);
		let worker = Worker::new(
			Arena::new(config),
			Reclaimer::new(config.grace_period, config.reclaim_queue_capacity()),
			insert_rx,
			remove_rx,
		);
		(worker, insert_tx, remove_tx)
	}

	#[test]
	fn run_pending_applies_and_counts() {
		let (mut worker, inserts, removes) = worker(&Config::default().initial_capacity(16));
		for k in [3, 1, 2, 2] {
			inserts.send(k).unwrap();
		}
		assert_eq!(worker.run_pending(), 4);
		let stats = worker.shared().counters.snapshot(worker.shared().index.len());
		assert_eq!(stats.len, 3);
		assert_eq!(stats.applied, 3);

		removes.send(2).unwrap();
		removes.send(7).unwrap();
		assert_eq!(worker.run_pending(), 2);
		assert_eq!(worker.shared().index.len(), 2);
	}

	#[test]
	fn bounds_follow_removals() {
		let (mut worker, inserts, removes) = worker(&Config::default().initial_capacity(16));
		for k in [5, 1, 9] {
			inserts.send(k).unwrap();
		}
		worker.run_pending();
		removes.send(1).unwrap();
		removes.send(9).unwrap();
		worker.run_pending();

		let guard = epoch::pin();
		assert_eq!(worker.shared().index.bounds(&guard), (Some(&5), Some(&5)));
		drop(guard);

		removes.send(5).unwrap();
		worker.run_pending();
		let guard = epoch::pin();
		assert_eq!(worker.shared().index.bounds(&guard), (None, None));
	}

	#[test]
	fn ceiling_rejects_instead_of_growing() {
		let config = Config::default().initial_capacity(4).max_capacity(4);
		let (mut worker, inserts, _removes) = worker(&config);
		for k in 0..4 {
			inserts.send(k).unwrap();
		}
		worker.run_pending();
		let counters = &worker.shared().counters;
		// 0 and 1 take a slot each, 2 takes a leaf plus a rotation copy.
		assert_eq!(counters.rejected.load(Ordering::Relaxed), 1);
		assert_eq!(counters.capacity.load(Ordering::Relaxed), 4);
		assert_eq!(worker.shared().index.len(), 3);
	}

	#[test]
	fn leaf_removal_succeeds_with_no_free_slot() {
		let config = Config::default().initial_capacity(4).max_capacity(4);
		let (mut worker, inserts, removes) = worker(&config);
		for k in 0..3 {
			inserts.send(k).unwrap();
		}
		let guard = epoch::pin();
		// The pin keeps the rotated-out slot from coming back.
		worker.run_pending();
		assert_eq!(worker.arena.free_len(), 0);

		removes.send(2).unwrap();
		worker.run_pending();
		drop(guard);

		let counters = &worker.shared().counters;
		assert_eq!(counters.rejected.load(Ordering::Relaxed), 0);
		assert_eq!(worker.shared().index.len(), 2);
		let guard = epoch::pin();
		assert_eq!(worker.shared().index.bounds(&guard), (Some(&0), Some(&1)));
	}

	#[test]
	fn parked_slots_do_not_keep_the_worker_flushing() {
		let config = Config::default().initial_capacity(8).grace_period(Duration::from_secs(60));
		let (mut worker, inserts, _removes) = worker(&config);
		for k in 0..3 {
			inserts.send(k).unwrap();
		}
		worker.run_pending();
		assert_eq!(worker.reclaimer.pending(), 1);

		let deadline = Instant::now() + Duration::from_secs(5);
		while worker.reclaimer.awaiting_epoch() > 0 && Instant::now() < deadline {
			std::thread::sleep(Duration::from_millis(1));
			worker.run_pending();
		}
		assert_eq!(worker.reclaimer.awaiting_epoch(), 0, "epoch never advanced");
		assert_eq!(worker.reclaimer.pending(), 1);
		assert_eq!(worker.tick(), IDLE_TICK);
	}

	#[test]
	fn dropping_the_worker_unblocks_sync() {
		let (worker, inserts, _removes) = worker(&Config::default());
		let shared = worker.shared().clone();
		inserts.send(1).unwrap();
		shared.progress.accept();
		drop(worker);
		assert!(matches!(shared.progress.wait(), Err(Error::Disconnected)));
	}
}
