//! Delayed reclamation of retired nodes.
//!
//! A node unlinked by the balancer cannot be reused immediately: a reader
//! that loaded a link to it before the unlink may still be walking through
//! it. A retired slot goes back to the free list only once two conditions
//! hold:
//!
//! 1. **Epoch**: every reader pinned when the node was retired has unpinned.
//!    The retirement is handed to `crossbeam_epoch` as a deferred function
//!    that posts a notice on an unbounded channel once this is true.
//! 2. **Grace period**: the deadline stamped on the node at retirement has
//!    passed. Notices that arrive early wait in a min-heap keyed by deadline.
//!
//! ```text
//!  retire ──► defer(notice) ──epoch──► notices ──► accept ─┬─► release
//!                                                          │
//!                                                          └─► backlog ──deadline──► release
//! ```
//!
//! Notices are never dropped, so every retired slot is eventually reused.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use crossbeam_epoch::Guard;
use smallvec::SmallVec;
use tracing::trace;

use crate::arena::Arena;
use crate::node::Handle;

/// Handles retired by a single mutation.
pub(crate) type Retired = SmallVec<[Handle; 8]>;

pub(crate) struct Reclaimer {
	grace: Duration,
	origin: Instant,
	sender: Sender<Handle>,
	notices: Receiver<Handle>,
	backlog: BinaryHeap<Reverse<(u64, Handle)>>,
	awaiting_epoch: usize,
	reclaimed: u64,
}

impl Reclaimer {
	pub(crate) fn new(grace: Duration, backlog_capacity: usize) -> Self {
		let (sender, notices) = unbounded();
		Reclaimer {
			grace,
			origin: Instant::now(),
			sender,
			notices,
			backlog: BinaryHeap::with_capacity(backlog_capacity),
			awaiting_epoch: 0,
			reclaimed: 0,
		}
	}

	fn now(&self) -> u64 {
		u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
	}

	/// The deadline to stamp on a node retired now.
	pub(crate) fn deadline(&self) -> u64 {
		let grace = u64::try_from(self.grace.as_nanos()).unwrap_or(u64::MAX);
		self.now().saturating_add(grace)
	}

	/// Channel of handles whose epoch has passed.
	pub(crate) fn notices(&self) -> &Receiver<Handle> {
		&self.notices
	}

	/// Hands a batch of already stamped nodes to the epoch collector.
	pub(crate) fn defer(&mut self, retired: Retired, guard: &Guard) {
		if retired.is_empty() {
			return;
		}
		self.awaiting_epoch += retired.len();
		let sender = self.sender.clone();
		guard.defer(move || {
			for handle in retired {
				// The receiver lives in the worker; after it is gone the tree
				// and its arena are gone too.
				let _ = sender.send(handle);
			}
		});
	}

	/// Processes a notice: frees the slot if its deadline passed, parks it otherwise.
	pub(crate) fn accept<T>(&mut self, handle: Handle, arena: &mut Arena<T>, guard: &Guard) {
		self.awaiting_epoch = self.awaiting_epoch.saturating_sub(1);
		let expires_at = arena.store().get(handle, guard).expires_at();
		if expires_at <= self.now() {
			self.release(handle, arena, guard);
		} else {
			self.backlog.push(Reverse((expires_at, handle)));
		}
	}

	/// Frees every parked slot whose deadline has passed.
	pub(crate) fn collect_expired<T>(&mut self, arena: &mut Arena<T>, guard: &Guard) -> usize {
		let now = self.now();
		let mut freed = 0;
		while let Some(Reverse((expires_at, handle))) = self.backlog.peek().copied() {
			if expires_at > now {
				break;
			}
			self.backlog.pop();
			self.release(handle, arena, guard);
			freed += 1;
		}
		freed
	}

	fn release<T>(&mut self, handle: Handle, arena: &mut Arena<T>, guard: &Guard) {
		trace!(slot = handle.index(), "reclaimed node");
		arena.release(handle, guard);
		self.reclaimed += 1;
	}

	/// When the earliest parked slot becomes reusable.
	pub(crate) fn next_deadline(&self) -> Option<Instant> {
		self.backlog
			.peek()
			.map(|Reverse((expires_at, _))| self.origin + Duration::from_nanos(*expires_at))
	}

	/// Retired nodes not yet back on the free list.
	pub(crate) fn pending(&self) -> usize {
		self.awaiting_epoch + self.backlog.len()
	}

	/// Retirements still waiting for the epoch to advance.
	pub(crate) fn awaiting_epoch(&self) -> usize {
		self.awaiting_epoch
	}

	pub(crate) fn reclaimed(&self) -> u64 {
		self.reclaimed
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;
	use crate::node::State;
	use crossbeam_epoch as epoch;
	use smallvec::smallvec;

	fn retired_node(arena: &mut Arena<u32>, reclaimer: &Reclaimer, guard: &Guard) -> Handle {
		let handle = arena.allocate(guard).unwrap();
		let node = arena.store().get(handle, guard);
		unsafe { node.fill(1, Handle::NIL, Handle::NIL, 0) };
		node.retire(reclaimer.deadline());
		handle
	}

	#[test]
	fn expired_notice_is_released_immediately() {
		let mut arena = Arena::new(&Config::default().initial_capacity(4));
		let mut reclaimer = Reclaimer::new(Duration::ZERO, 1);
		let guard = epoch::pin();

		let handle = retired_node(&mut arena, &reclaimer, &guard);
		let free = arena.free_len();
		reclaimer.accept(handle, &mut arena, &guard);

		assert_eq!(arena.free_len(), free + 1);
		assert_eq!(arena.store().get(handle, &guard).state(), State::Free);
		assert_eq!(reclaimer.reclaimed(), 1);
		assert_eq!(reclaimer.pending(), 0);
	}

	#[test]
	fn early_notice_waits_for_its_deadline() {
		let mut arena = Arena::new(&Config::default().initial_capacity(4));
		let mut reclaimer = Reclaimer::new(Duration::from_millis(30), 1);
		let guard = epoch::pin();

		let handle = retired_node(&mut arena, &reclaimer, &guard);
		let free = arena.free_len();
		reclaimer.accept(handle, &mut arena, &guard);

		assert_eq!(arena.free_len(), free);
		assert_eq!(reclaimer.pending(), 1);
		assert!(reclaimer.next_deadline().is_some());
		assert_eq!(reclaimer.collect_expired(&mut arena, &guard), 0);

		std::thread::sleep(Duration::from_millis(40));
		assert_eq!(reclaimer.collect_expired(&mut arena, &guard), 1);
		assert_eq!(arena.free_len(), free + 1);
		assert_eq!(reclaimer.pending(), 0);
		assert!(reclaimer.next_deadline().is_none());
	}

	#[test]
	fn backlog_releases_in_deadline_order() {
		let mut arena = Arena::new(&Config::default().initial_capacity(4));
		let mut reclaimer = Reclaimer::new(Duration::from_millis(20), 2);
		let guard = epoch::pin();

		let first = retired_node(&mut arena, &reclaimer, &guard);
		std::thread::sleep(Duration::from_millis(5));
		let second = retired_node(&mut arena, &reclaimer, &guard);

		reclaimer.accept(second, &mut arena, &guard);
		reclaimer.accept(first, &mut arena, &guard);

		let Some(Reverse((_, head))) = reclaimer.backlog.peek().copied() else {
			panic!("backlog is empty");
		};
		assert_eq!(head, first);
	}

	#[test]
	fn deferred_notice_arrives_after_epoch_advances() {
		let mut reclaimer = Reclaimer::new(Duration::ZERO, 1);
		{
			let guard = epoch::pin();
			reclaimer.defer(smallvec![Handle::new(3)], &guard);
			guard.flush();
		}
		assert_eq!(reclaimer.awaiting_epoch(), 1);

		let deadline = Instant::now() + Duration::from_secs(5);
		let mut received = None;
		while Instant::now() < deadline {
			epoch::pin().flush();
			if let Ok(handle) = reclaimer.notices().try_recv() {
				received = Some(handle);
				break;
			}
			std::thread::sleep(Duration::from_millis(1));
		}
		assert_eq!(received, Some(Handle::new(3)));
	}
}
