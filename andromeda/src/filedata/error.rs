use thiserror::Error;

use crate::backend;

/// Errors surfaced by [`PageManager`](super::page_manager::PageManager)
/// operations (Section 7).
#[derive(Debug, Error)]
pub enum PageManagerError {
	#[error(transparent)]
	Backend(#[from] backend::Error),

	#[error("read offset {offset} is past the end of the file (size {file_size})")]
	OutOfRange { offset: u64, file_size: u64 },

	#[error("cache reported it could not free enough memory for this operation")]
	MemoryException,

	#[error("cache reported a prior flush failure and dirty pages could not be admitted")]
	FlushFailure,
}

/// Errors raised by [`CacheManager`](super::cache_manager::CacheManager)
/// when a caller blocks on memory or dirty-limit pressure it cannot resolve
/// (Section 4.2, "Failure handling").
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
	#[error("the eviction worker could not reclaim enough memory")]
	MemoryException,

	#[error("the flush worker could not write back enough dirty data")]
	FlushFailure,
}

impl From<CacheError> for PageManagerError {
	fn from(err: CacheError) -> Self {
		match err {
			CacheError::MemoryException => PageManagerError::MemoryException,
			CacheError::FlushFailure => PageManagerError::FlushFailure,
		}
	}
}
