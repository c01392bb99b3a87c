//! # Error Types for the Concurrent AVL Index
//!
//! Reads never fail: an empty tree or a missing key is reported through
//! `Option`. The errors in this module describe why a *mutation* did not
//! make it into the tree, or why a tree could not be built.
//!
//! ## Error Flow
//!
//! ```text
//! try_insert / try_remove
//!      │
//!      ▼
//! Enqueue on bounded channel ───► Err(QueueFull) / Err(Disconnected)
//!      │
//!      ▼ (Ok: accepted)
//! Worker dequeues request
//!      │
//!      ▼
//! Reserve arena slots ──────────► ArenaExhausted (logged, request dropped)
//!      │
//!      ▼
//! Apply insert / remove
//! ```
//!
//! The fire-and-forget [`Tree::insert`](crate::Tree::insert) and
//! [`Tree::remove`](crate::Tree::remove) log the same errors instead of
//! returning them. Acceptance is at-most-once: an accepted request is applied
//! or rejected exactly once, a refused request is never retried.

use std::fmt;

use thiserror::Error;

/// The request queue a mutation was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
	/// Pending insertions.
	Insert,
	/// Pending removals.
	Remove,
}

impl fmt::Display for Queue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Queue::Insert => f.write_str("insert"),
			Queue::Remove => f.write_str("remove"),
		}
	}
}

/// Errors that can occur while building or mutating a tree.
#[derive(Error, Debug)]
pub enum Error {
	/// The request queue was at capacity and the request was shed.
	///
	/// This is the overload policy of the index: a full queue never blocks
	/// the caller. The request has not been applied and will not be.
	#[error("{queue} queue is full, request dropped")]
	QueueFull {
		/// The queue that refused the request.
		queue: Queue,
	},

	/// The worker that applies mutations is gone.
	///
	/// Happens for a detached tree whose [`Worker`](crate::Worker) was
	/// dropped.
	#[error("tree worker has shut down")]
	Disconnected,

	/// The node arena hit its configured ceiling.
	///
	/// Mutations reserve their worst-case number of slots up front, so a
	/// mutation is rejected as a whole and never left half-applied.
	#[error("node arena exhausted at {capacity} slots")]
	ArenaExhausted {
		/// The ceiling that was reached.
		capacity: usize,
	},

	/// A [`Config`](crate::Config) value is out of range.
	#[error("invalid configuration: {0}")]
	InvalidConfig(&'static str),

	/// The worker thread could not be started.
	#[error("failed to spawn tree worker")]
	Spawn(#[from] std::io::Error),
}

/// A Result type alias using our custom Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn queue_full_names_the_queue() {
		let err = Error::QueueFull {
			queue: Queue::Remove,
		};
		assert_eq!(err.to_string(), "remove queue is full, request dropped");
	}

	#[test]
	fn arena_exhausted_reports_capacity() {
		let err = Error::ArenaExhausted {
			capacity: 64,
		};
		assert_eq!(err.to_string(), "node arena exhausted at 64 slots");
	}
}
