//! Construction parameters for a [`Tree`](crate::Tree).

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Largest number of slots addressable by a node handle.
///
/// `u32::MAX` is reserved for the null handle.
pub const MAX_HANDLES: usize = u32::MAX as usize;

/// Default number of slots in the first arena slab.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Default capacity of each request queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default delay between retiring a node and reusing its slot.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Tree configuration.
///
/// ```
/// use cowavl::Config;
/// use std::time::Duration;
///
/// let config = Config::default()
/// 	.initial_capacity(4096)
/// 	.grace_period(Duration::from_millis(500))
/// 	.max_capacity(1 << 20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Config {
	/// Slots in the first arena slab. Later slabs hold a quarter of this.
	pub initial_capacity: usize,
	/// Pending insert requests before new ones are shed.
	pub insert_queue_capacity: usize,
	/// Pending remove requests before new ones are shed.
	pub remove_queue_capacity: usize,
	/// Minimum time a retired node stays untouched before its slot is reused.
	pub grace_period: Duration,
	/// Ceiling on total arena slots. `None` means the handle space.
	pub max_capacity: Option<usize>,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			initial_capacity: DEFAULT_CAPACITY,
			insert_queue_capacity: DEFAULT_QUEUE_CAPACITY,
			remove_queue_capacity: DEFAULT_QUEUE_CAPACITY,
			grace_period: DEFAULT_GRACE_PERIOD,
			max_capacity: None,
		}
	}
}

impl Config {
	/// Sets the number of slots in the first arena slab.
	pub fn initial_capacity(mut self, capacity: usize) -> Self {
		self.initial_capacity = capacity;
		self
	}

	/// Sets the insert queue capacity.
	pub fn insert_queue_capacity(mut self, capacity: usize) -> Self {
		self.insert_queue_capacity = capacity;
		self
	}

	/// Sets the remove queue capacity.
	pub fn remove_queue_capacity(mut self, capacity: usize) -> Self {
		self.remove_queue_capacity = capacity;
		self
	}

	/// Sets the grace period of retired nodes.
	pub fn grace_period(mut self, grace: Duration) -> Self {
		self.grace_period = grace;
		self
	}

	/// Caps the arena at `capacity` slots.
	pub fn max_capacity(mut self, capacity: usize) -> Self {
		self.max_capacity = Some(capacity);
		self
	}

	/// Number of slots each growth step appends.
	pub fn growth(&self) -> usize {
		(self.initial_capacity / 4).max(1)
	}

	/// Initial size of the reclaim backlog, a quarter of the arena.
	pub fn reclaim_queue_capacity(&self) -> usize {
		(self.initial_capacity / 4).max(1)
	}

	/// The effective arena ceiling.
	pub fn ceiling(&self) -> usize {
		self.max_capacity.unwrap_or(MAX_HANDLES).min(MAX_HANDLES)
	}

	/// Checks every field against its allowed range.
	pub fn validate(&self) -> Result<()> {
		if self.initial_capacity == 0 {
			return Err(Error::InvalidConfig("initial_capacity must be at least 1"));
		}
		if self.initial_capacity > MAX_HANDLES {
			return Err(Error::InvalidConfig("initial_capacity exceeds the handle space"));
		}
		if self.insert_queue_capacity == 0 {
			return Err(Error::InvalidConfig("insert_queue_capacity must be at least 1"));
		}
		if self.remove_queue_capacity == 0 {
			return Err(Error::InvalidConfig("remove_queue_capacity must be at least 1"));
		}
		if let Some(max) = self.max_capacity {
			if max < self.initial_capacity {
				return Err(Error::InvalidConfig("max_capacity is below initial_capacity"));
			}
		}
		Ok(())
	}
}
