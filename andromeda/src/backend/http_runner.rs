//! The transport collaborator (Section 1/6): performs one HTTP request and
//! returns a body or an error. Real construction of requests, auth, and
//! connection pooling are outside this crate's scope; only the retry
//! contract the core relies on is modeled here.

use std::{thread, time::Duration};

use log::warn;

use super::Error;

/// Runs a single request and returns its raw response body.
///
/// Implementations are expected to classify failures the way [`Error`]
/// does; this crate only ever calls `run` through [`RetryingRunner`].
pub trait HttpRunner: Send + Sync {
	fn run(&self, request: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Wraps an [`HttpRunner`] with bounded retry-on-transient-error, so that a
/// flaky `503` or dropped connection never reaches the data plane as a
/// permanent failure (Section 7: "transient errors are recovered by the
/// transport, not here").
pub struct RetryingRunner<R: HttpRunner> {
	inner: R,
	max_retries: usize,
	backoff: Duration,
}

impl<R: HttpRunner> RetryingRunner<R> {
	pub fn new(inner: R, max_retries: usize, backoff: Duration) -> Self {
		Self { inner, max_retries, backoff }
	}

	pub fn run(&self, request: &[u8]) -> Result<Vec<u8>, Error> {
		let mut attempt = 0;
		loop {
			match self.inner.run(request) {
				Ok(body) => return Ok(body),
				Err(err) if err.is_transient() && attempt < self.max_retries => {
					warn!("transient backend error ({attempt} retries used): {err}");
					attempt += 1;
					thread::sleep(self.backoff * attempt as u32);
				}
				Err(err) => return Err(err),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	struct FlakyRunner {
		failures_remaining: AtomicUsize,
	}

	impl HttpRunner for FlakyRunner {
		fn run(&self, _request: &[u8]) -> Result<Vec<u8>, Error> {
			let remaining = self.failures_remaining.load(Ordering::Relaxed);
			if remaining > 0 {
				self.failures_remaining.store(remaining - 1, Ordering::Relaxed);
				return Err(Error::Endpoint(503));
			}
			Ok(b"ok".to_vec())
		}
	}

	#[test]
	fn retries_transient_errors_until_success() {
		let runner = RetryingRunner::new(
			FlakyRunner { failures_remaining: AtomicUsize::new(2) },
			5,
			Duration::from_millis(1),
		);
		assert_eq!(runner.run(b"req").unwrap(), b"ok".to_vec());
	}

	#[test]
	fn gives_up_after_max_retries() {
		let runner = RetryingRunner::new(
			FlakyRunner { failures_remaining: AtomicUsize::new(10) },
			2,
			Duration::from_millis(1),
		);
		assert!(matches!(runner.run(b"req"), Err(Error::Endpoint(503))));
	}

	#[test]
	fn does_not_retry_permanent_errors() {
		struct AlwaysNotFound;
		impl HttpRunner for AlwaysNotFound {
			fn run(&self, _request: &[u8]) -> Result<Vec<u8>, Error> {
				Err(Error::NotFound)
			}
		}
		let runner = RetryingRunner::new(AlwaysNotFound, 5, Duration::from_millis(1));
		assert!(matches!(runner.run(b"req"), Err(Error::NotFound)));
	}
}
