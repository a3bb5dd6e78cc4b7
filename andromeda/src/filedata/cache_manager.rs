//! The process-wide resource governor (Section 4.2): tracks total resident
//! and dirty bytes across every open file, and runs the two background
//! workers that keep both under their limits.
//!
//! `CacheManager` never touches page bytes. It only knows page *sizes* and
//! *identities* (`PageKey`), and reaches back into the owning
//! [`PageManager`] only through a registry of weak references, so a
//! `PageManager` can be dropped without `CacheManager` ever observing a
//! dangling strong reference (Section 9, "Design notes" on the
//! `Page`/`PageManager`/`CacheManager` reference cycle).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLockWriteGuard};

use super::bandwidth::BandwidthMeasure;
use super::error::CacheError;
use super::ordered_set::OrderedSet;
use super::page_manager::{EvictOutcome, PageManager};
use crate::backend::Backend;
use crate::config::{Config, DirtyLimitMode};
use crate::consts::MAX_DIRTY_LIMIT_FRACTION;

/// Identifies a page across every open file without naming a `PageManager`
/// directly: `mgr_id` is assigned once at registration and is stable for
/// the manager's lifetime, independent of its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PageKey {
	pub mgr_id: u64,
	pub index: u64,
}

#[derive(Debug, Clone, Copy)]
struct PageEntry {
	size: u64,
	dirty: bool,
}

struct State<B: Backend> {
	current_memory: u64,
	current_dirty: u64,
	dirty_limit: u64,
	page_order: OrderedSet<PageKey>,
	dirty_order: OrderedSet<PageKey>,
	entries: HashMap<PageKey, PageEntry>,
	managers: HashMap<u64, Weak<PageManager<B>>>,
	next_mgr_id: u64,
	evict_failure: bool,
	flush_failure: bool,
}

pub struct CacheManager<B: Backend> {
	config: Config,
	state: Mutex<State<B>>,
	evict_cond: Condvar,
	flush_cond: Condvar,
	bandwidth: Mutex<BandwidthMeasure>,
	stop: AtomicBool,
	// Bypass: tests and `CacheMode::Memory` never want to actually block on
	// the background workers.
	workers_enabled: bool,
	memory_limit: AtomicU64,
}

/// Join handles for the two background workers, kept so shutdown can wait
/// for them to actually exit rather than merely signalling a stop flag.
pub struct Workers {
	evict: Option<JoinHandle<()>>,
	flush: Option<JoinHandle<()>>,
}

impl<B: Backend + 'static> CacheManager<B> {
	pub fn new(config: Config) -> (Arc<Self>, Workers) {
		let initial_dirty_limit = match config.dirty_limit_mode {
			DirtyLimitMode::Fixed(limit) => limit,
			DirtyLimitMode::Adaptive { .. } => config.memory_limit / MAX_DIRTY_LIMIT_FRACTION,
		};
		let memory_limit = config.memory_limit;
		let workers_enabled = matches!(config.cache_mode, crate::config::CacheMode::Normal);
		let this = Arc::new(Self {
			config,
			state: Mutex::new(State {
				current_memory: 0,
				current_dirty: 0,
				dirty_limit: initial_dirty_limit,
				page_order: OrderedSet::new(),
				dirty_order: OrderedSet::new(),
				entries: HashMap::new(),
				managers: HashMap::new(),
				next_mgr_id: 0,
				evict_failure: false,
				flush_failure: false,
			}),
			evict_cond: Condvar::new(),
			flush_cond: Condvar::new(),
			bandwidth: Mutex::new(BandwidthMeasure::new()),
			stop: AtomicBool::new(false),
			workers_enabled,
			memory_limit: AtomicU64::new(memory_limit),
		});
		let workers = if workers_enabled {
			let evict = {
				let this = this.clone();
				thread::Builder::new().name("andromeda-evict".into()).spawn(move || this.evict_loop()).expect("spawn evict worker")
			};
			let flush = {
				let this = this.clone();
				thread::Builder::new().name("andromeda-flush".into()).spawn(move || this.flush_loop()).expect("spawn flush worker")
			};
			Workers { evict: Some(evict), flush: Some(flush) }
		} else {
			Workers { evict: None, flush: None }
		};
		(this, workers)
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn stop(&self, workers: Workers) {
		self.stop.store(true, Ordering::SeqCst);
		self.evict_cond.notify_all();
		self.flush_cond.notify_all();
		if let Some(handle) = workers.evict {
			let _ = handle.join();
		}
		if let Some(handle) = workers.flush {
			let _ = handle.join();
		}
	}

	fn memory_limit(&self) -> u64 {
		self.memory_limit.load(Ordering::Relaxed)
	}

	fn margin(&self, limit: u64) -> u64 {
		limit / self.config.memory_margin_fraction.max(1)
	}

	/// Registers a newly-constructed `PageManager`, returning the id it
	/// should use for every subsequent call into this cache.
	pub fn register_manager(&self, mgr: &Arc<PageManager<B>>) -> u64 {
		let mut state = self.state.lock();
		let id = state.next_mgr_id;
		state.next_mgr_id += 1;
		state.managers.insert(id, Arc::downgrade(mgr));
		id
	}

	/// Drops every entry belonging to `mgr_id` from both orderings and the
	/// size ledger. Called when a `PageManager` is being torn down so stale
	/// `PageKey`s never reach a dangling `Weak`.
	///
	/// Section 4.2 describes "bypass slots" (`skipEvictWait`/`skipFlushWait`
	/// in the original) so a manager that is itself draining pages on
	/// teardown can still call `InformPage` without deadlocking against its
	/// own drain. This cache has no such call on the teardown path:
	/// `PageManager::close`/`Drop` only reach `unregister_manager`, which
	/// takes the cache mutex directly and never blocks on the evict/flush
	/// condition, and never informs a new page size. Teardown only runs once
	/// the owning `File`'s last `Arc<PageManager>` is gone, so there is no
	/// thread left that could still be inside `mark_dirty`/`inform_page_size`
	/// for this manager when it fires. Bypass slots would guard a call path
	/// that does not exist here, so none are added.
	pub fn unregister_manager(&self, mgr_id: u64) {
		let mut state = self.state.lock();
		state.managers.remove(&mgr_id);
		let keys: Vec<PageKey> = state.entries.keys().copied().filter(|k| k.mgr_id == mgr_id).collect();
		for key in keys {
			if let Some(entry) = state.entries.remove(&key) {
				state.current_memory = state.current_memory.saturating_sub(entry.size);
				if entry.dirty {
					state.current_dirty = state.current_dirty.saturating_sub(entry.size);
				}
			}
			state.page_order.remove(&key);
			state.dirty_order.remove(&key);
		}
	}

	/// Bumps `key` to the back of the clean-page LRU ordering without
	/// changing its recorded size (a plain read hit).
	pub fn touch(&self, mgr_id: u64, index: u64) {
		let key = PageKey { mgr_id, index };
		let mut state = self.state.lock();
		if state.entries.get(&key).is_some_and(|e| !e.dirty) {
			state.page_order.move_to_back(key);
		}
	}

	/// Informs the cache that a clean page at `mgr_id`/`index` now has
	/// `new_size` bytes resident (a page fault or a write that grew a
	/// resident page without making it dirty — i.e. never, in practice,
	/// since writes always dirty; kept general for truncation's grow path).
	/// Blocks until the resulting total is back under the memory limit, or
	/// returns [`CacheError::MemoryException`] if the evictor gave up.
	///
	/// `mgr_guard` is the caller's own per-file exclusive lock, held across
	/// this call (Section 5, "Lock order": per-file lock, then cache
	/// mutex). If this call would otherwise block on the memory-available
	/// condition, it instead drops `mgr_guard` for the duration of the wait
	/// and reacquires it before returning — the "lock inversion" Section 9
	/// describes — so the evictor (which itself needs the per-file lock to
	/// drop a page) can always make progress.
	pub fn inform_page_size<T>(&self, mgr_id: u64, index: u64, new_size: u64, mgr_guard: &mut RwLockWriteGuard<'_, T>) -> Result<(), CacheError> {
		let key = PageKey { mgr_id, index };
		let mut state = self.state.lock();
		let old_size = state.entries.get(&key).map(|e| e.size).unwrap_or(0);
		state.current_memory = state.current_memory - old_size + new_size;
		state.entries.insert(key, PageEntry { size: new_size, dirty: false });
		state.page_order.move_to_back(key);
		let limit = self.memory_limit();
		let over_memory = state.current_memory > limit;
		drop(state);
		if over_memory {
			self.evict_cond.notify_one();
			return RwLockWriteGuard::unlocked(mgr_guard, || self.wait_for_memory(limit));
		}
		Ok(())
	}

	/// Marks `mgr_id`/`index` dirty with `new_size` bytes, moving it into
	/// the FIFO dirty ordering while it stays resident in the LRU clean
	/// ordering too (Section 3: `pageQueue` holds every resident page,
	/// dirty or not; Section 8: `dirtyQueue ⊆ pageQueue`). Blocks until
	/// both the dirty and the memory limit are back under their bounds, or
	/// returns [`CacheError::FlushFailure`]/[`CacheError::MemoryException`]
	/// if the corresponding worker gave up.
	///
	/// `mgr_guard` is handled the same way as in
	/// [`inform_page_size`](Self::inform_page_size): dropped across any
	/// blocking wait and reacquired before returning, so the flush/evict
	/// workers can take the per-file lock this caller is still holding.
	pub fn mark_dirty<T>(&self, mgr_id: u64, index: u64, new_size: u64, mgr_guard: &mut RwLockWriteGuard<'_, T>) -> Result<(), CacheError> {
		let key = PageKey { mgr_id, index };
		let mut state = self.state.lock();
		let old_entry = state.entries.get(&key).copied();
		let old_size = old_entry.map(|e| e.size).unwrap_or(0);
		let was_dirty = old_entry.is_some_and(|e| e.dirty);
		state.current_memory = state.current_memory - old_size + new_size;
		if !was_dirty {
			state.current_dirty += new_size;
		} else {
			state.current_dirty = state.current_dirty - old_size + new_size;
		}
		state.entries.insert(key, PageEntry { size: new_size, dirty: true });
		state.page_order.move_to_back(key);
		state.dirty_order.move_to_back(key);
		let memory_limit = self.memory_limit();
		let dirty_limit = state.dirty_limit;
		let over_memory = state.current_memory > memory_limit;
		let over_dirty = state.current_dirty > dirty_limit;
		drop(state);
		if over_dirty {
			self.flush_cond.notify_one();
		}
		if over_memory {
			self.evict_cond.notify_one();
		}
		if over_dirty || over_memory {
			return RwLockWriteGuard::unlocked(mgr_guard, || {
				if over_memory {
					self.wait_for_memory(memory_limit)?;
				}
				if over_dirty {
					self.wait_for_dirty(dirty_limit)?;
				}
				Ok(())
			});
		}
		Ok(())
	}

	/// Marks a page clean after a successful flush, leaving its LRU
	/// position in `page_order` untouched (it was never removed from there
	/// while dirty — see [`mark_dirty`](Self::mark_dirty)) and dropping it
	/// from the FIFO dirty ordering. Never blocks.
	pub fn mark_clean(&self, mgr_id: u64, index: u64) {
		let key = PageKey { mgr_id, index };
		let mut state = self.state.lock();
		if let Some(entry) = state.entries.get_mut(&key) {
			entry.dirty = false;
			let size = entry.size;
			state.current_dirty = state.current_dirty.saturating_sub(size);
		}
		state.dirty_order.remove(&key);
		state.page_order.push_back(key);
	}

	/// Removes a page entirely (eviction already done by the caller, or a
	/// truncate dropped it). `was_dirty` must match the page's last known
	/// state so the dirty ledger stays correct.
	pub fn remove_page(&self, mgr_id: u64, index: u64) {
		let key = PageKey { mgr_id, index };
		let mut state = self.state.lock();
		if let Some(entry) = state.entries.remove(&key) {
			state.current_memory = state.current_memory.saturating_sub(entry.size);
			if entry.dirty {
				state.current_dirty = state.current_dirty.saturating_sub(entry.size);
			}
		}
		state.page_order.remove(&key);
		state.dirty_order.remove(&key);
	}

	fn wait_for_memory(&self, limit: u64) -> Result<(), CacheError> {
		if !self.workers_enabled {
			return Ok(());
		}
		let mut state = self.state.lock();
		while state.current_memory > limit && !state.evict_failure {
			self.evict_cond.wait(&mut state);
		}
		if state.current_memory > limit && state.evict_failure {
			return Err(CacheError::MemoryException);
		}
		Ok(())
	}

	fn wait_for_dirty(&self, limit: u64) -> Result<(), CacheError> {
		if !self.workers_enabled {
			return Ok(());
		}
		let mut state = self.state.lock();
		while state.current_dirty > limit && !state.flush_failure {
			self.flush_cond.wait(&mut state);
		}
		if state.current_dirty > limit && state.flush_failure {
			return Err(CacheError::FlushFailure);
		}
		Ok(())
	}

	fn evict_loop(self: Arc<Self>) {
		loop {
			let limit = self.memory_limit();
			let candidates = {
				let mut state = self.state.lock();
				while state.current_memory <= limit && !self.stop.load(Ordering::SeqCst) {
					self.evict_cond.wait(&mut state);
				}
				if self.stop.load(Ordering::SeqCst) {
					return;
				}
				state.page_order.iter().collect::<Vec<_>>()
			};

			let target = limit.saturating_sub(self.margin(limit));
			let mut made_progress = false;
			for key in candidates {
				if self.memory_under(target) {
					break;
				}
				let mgr = {
					let state = self.state.lock();
					state.managers.get(&key.mgr_id).and_then(Weak::upgrade)
				};
				let Some(mgr) = mgr else {
					self.remove_page(key.mgr_id, key.index);
					made_progress = true;
					continue;
				};
				match mgr.try_evict_page(key.index) {
					EvictOutcome::Evicted { size: _ } => {
						self.remove_page(key.mgr_id, key.index);
						made_progress = true;
					}
					EvictOutcome::WouldBlock | EvictOutcome::NotClean | EvictOutcome::Gone => continue,
				}
			}

			let mut state = self.state.lock();
			state.evict_failure = !made_progress && state.current_memory > limit;
			self.evict_cond.notify_all();
		}
	}

	fn memory_under(&self, target: u64) -> bool {
		self.state.lock().current_memory <= target
	}

	fn flush_loop(self: Arc<Self>) {
		loop {
			let dirty_limit = {
				let mut state = self.state.lock();
				while state.current_dirty <= state.dirty_limit && !self.stop.load(Ordering::SeqCst) {
					self.flush_cond.wait(&mut state);
				}
				if self.stop.load(Ordering::SeqCst) {
					return;
				}
				state.dirty_limit
			};
			let target = dirty_limit.saturating_sub(self.margin(dirty_limit));

			let mut made_progress = false;
			loop {
				let head = {
					let state = self.state.lock();
					if state.current_dirty <= target {
						break;
					}
					state.dirty_order.front()
				};
				let Some(key) = head else {
					break;
				};
				let mgr = {
					let state = self.state.lock();
					state.managers.get(&key.mgr_id).and_then(Weak::upgrade)
				};
				let Some(mgr) = mgr else {
					self.remove_page(key.mgr_id, key.index);
					made_progress = true;
					continue;
				};
				match mgr.flush_batch_from(key.index) {
					Ok(outcome) => {
						let now = Instant::now();
						self.bandwidth.lock().record(now, outcome.bytes);
						self.recompute_adaptive_dirty_limit(now);
						made_progress = true;
					}
					Err(_) => {
						let mut state = self.state.lock();
						state.flush_failure = true;
						self.flush_cond.notify_all();
						break;
					}
				}
			}
			if made_progress {
				let mut state = self.state.lock();
				state.flush_failure = false;
				self.flush_cond.notify_all();
			}
		}
	}

	fn recompute_adaptive_dirty_limit(&self, now: Instant) {
		let DirtyLimitMode::Adaptive { target_stall } = self.config.dirty_limit_mode else {
			return;
		};
		let throughput = self.bandwidth.lock().throughput(now);
		let computed = (throughput * target_stall.as_secs_f64()) as u64;
		let floor = self.config.page_size;
		let ceiling = self.config.memory_limit / MAX_DIRTY_LIMIT_FRACTION;
		let mut state = self.state.lock();
		state.dirty_limit = computed.clamp(floor, ceiling.max(floor));
	}
}
