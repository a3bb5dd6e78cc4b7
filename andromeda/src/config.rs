use std::time::Duration;

use crate::consts::{
	DEFAULT_MEMORY_LIMIT, DEFAULT_MEMORY_MARGIN_FRACTION, DEFAULT_PAGE_SIZE, DEFAULT_READ_AHEAD_PAGES,
	DEFAULT_TARGET_FLUSH_STALL,
};

/// How the dirty-memory limit of the cache is determined.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DirtyLimitMode {
	/// A fixed byte ceiling.
	Fixed(u64),
	/// Computed from measured flush bandwidth against a target stall time
	/// (Section 4.2, "Adaptive dirty limit").
	Adaptive { target_stall: Duration },
}

impl Default for DirtyLimitMode {
	fn default() -> Self {
		Self::Adaptive { target_stall: DEFAULT_TARGET_FLUSH_STALL }
	}
}

/// Whether the page cache actually talks to the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
	/// No caching: every read/write is a direct passthrough to the backend.
	None,
	/// Cache only, never contact the remote. For tests.
	Memory,
	/// Full paged write-back cache.
	#[default]
	Normal,
}

/// Configuration consumed by the data-plane core (Section 6).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	/// Fixed page granularity. Should be a power of two.
	pub page_size: u64,
	/// Upper bound on resident cache bytes (clean + dirty).
	pub memory_limit: u64,
	/// Divisor of `memory_limit`/`dirty_limit` used to compute the overshoot
	/// a background worker must clear before releasing waiters.
	pub memory_margin_fraction: u64,
	pub dirty_limit_mode: DirtyLimitMode,
	/// Extra pages fetched per page fault.
	pub read_ahead_pages: u64,
	pub cache_mode: CacheMode,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			page_size: DEFAULT_PAGE_SIZE,
			memory_limit: DEFAULT_MEMORY_LIMIT,
			memory_margin_fraction: DEFAULT_MEMORY_MARGIN_FRACTION,
			dirty_limit_mode: DirtyLimitMode::default(),
			read_ahead_pages: DEFAULT_READ_AHEAD_PAGES,
			cache_mode: CacheMode::default(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let config = Config::default();
		assert!(config.page_size.is_power_of_two());
		assert!(config.memory_limit > config.page_size);
	}

}
