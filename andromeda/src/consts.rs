use std::time::Duration;

use crate::units::{KIB, MIB};

/// Fixed page granularity. Must be a power of two so offset -> index/within-page
/// arithmetic can use shifts and masks instead of division.
pub(crate) const DEFAULT_PAGE_SIZE: u64 = 128 * KIB;

/// Upper bound on resident cache bytes (clean + dirty).
pub(crate) const DEFAULT_MEMORY_LIMIT: u64 = 256 * MIB;

/// Divisor of a limit used to compute how far below it a background worker
/// must drive the system before releasing waiters.
pub(crate) const DEFAULT_MEMORY_MARGIN_FRACTION: u64 = 16;

/// Number of extra pages fetched per page fault.
pub(crate) const DEFAULT_READ_AHEAD_PAGES: u64 = 0;

/// Default target flush-stall time for the adaptive dirty limit.
pub(crate) const DEFAULT_TARGET_FLUSH_STALL: Duration = Duration::from_secs(5);

/// Dirty limit is never allowed to exceed this fraction of `memoryLimit`.
pub(crate) const MAX_DIRTY_LIMIT_FRACTION: u64 = 2;

/// Width of the bandwidth moving window.
pub(crate) const BANDWIDTH_WINDOW: Duration = Duration::from_secs(10);
