//! The downward interface to the remote object store (Section 6 of the spec).
//!
//! This is the one true external seam of the crate: everything above this
//! trait is pure in-process data-plane logic, and everything below it is a
//! collaborator (an HTTP API client) that this crate does not implement.

use std::fmt;

use thiserror::Error;

pub mod http_runner;

pub use http_runner::{HttpRunner, RetryingRunner};

/// Opaque remote object identifier (a folder or file id as returned by the
/// application API). Cloning is cheap; ids are short strings in practice.
pub type ObjectId = std::sync::Arc<str>;

/// Errors returned by a [`Backend`], partitioned the way Section 7 requires:
/// transient errors are the transport's problem to retry, permanent errors
/// abort the in-flight core operation.
#[derive(Debug, Error)]
pub enum Error {
	#[error("object not found")]
	NotFound,

	#[error("access denied")]
	AccessDenied,

	#[error("remote endpoint returned status {0}")]
	Endpoint(u16),

	#[error("could not reach the remote: {0}")]
	Connection(String),

	#[error("remote returned fewer bytes than requested for a non-tail read")]
	ShortRead,
}

impl Error {
	/// True if the transport should retry this error itself rather than the
	/// core surfacing it to the caller (Section 7).
	pub fn is_transient(&self) -> bool {
		match self {
			Error::Endpoint(status) => *status == 503,
			Error::Connection(_) => true,
			Error::NotFound | Error::AccessDenied | Error::ShortRead => false,
		}
	}
}

/// The remote object store as the core sees it. One implementation talks to
/// the real application API over [`HttpRunner`]; tests substitute
/// [`MockBackend`].
#[cfg_attr(test, mockall::automock)]
pub trait Backend: Send + Sync {
	/// Streaming ranged read. May deliver `length` bytes in any number of
	/// chunks, each handed to `sink` in ascending offset order.
	fn read_file(&self, id: &ObjectId, offset: u64, length: u64, sink: &mut dyn FnMut(u64, &[u8])) -> Result<(), Error>;

	/// Full-write of contiguous bytes starting at `offset`. The object must
	/// already exist.
	fn write_file(&self, id: &ObjectId, offset: u64, buf: &[u8]) -> Result<(), Error>;

	/// Materializes a new, empty object.
	fn create_file(&self, parent_id: &ObjectId, name: &str) -> Result<ObjectId, Error>;

	/// Materializes a new object with initial contents in one call.
	fn upload_file(&self, parent_id: &ObjectId, name: &str, buf: &[u8]) -> Result<ObjectId, Error>;

	/// Truncates an existing object to `new_size`.
	fn truncate_file(&self, id: &ObjectId, new_size: u64) -> Result<(), Error>;
}

impl fmt::Debug for dyn Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("dyn Backend")
	}
}
