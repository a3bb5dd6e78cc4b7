//! The per-file collaborator that turns page-shaped operations into calls on
//! the remote [`Backend`] (Section 4.3).
//!
//! A `PageBackend` tracks just enough remote state — whether the backend
//! object exists yet, and its last known size — to decide between creating,
//! writing, or no-op'ing on flush and truncate. It does no locking of its
//! own; callers (`PageManager`) already hold the per-file lock exclusively
//! whenever they touch it.

use std::sync::Arc;

use crate::backend::{Backend, Error, ObjectId};

#[derive(Debug)]
pub(crate) struct PageBackend<B: Backend> {
	backend: Arc<B>,
	parent_id: ObjectId,
	name: String,
	object_id: Option<ObjectId>,
	backend_size: u64,
}

impl<B: Backend> PageBackend<B> {
	/// For a file whose backend object already exists.
	pub fn existing(backend: Arc<B>, parent_id: ObjectId, name: String, object_id: ObjectId, backend_size: u64) -> Self {
		Self { backend, parent_id, name, object_id: Some(object_id), backend_size }
	}

	/// For a freshly-created file with no remote object yet (Section 4.3,
	/// "FlushCreate"): the first flush materializes it.
	pub fn pending(backend: Arc<B>, parent_id: ObjectId, name: String) -> Self {
		Self { backend, parent_id, name, object_id: None, backend_size: 0 }
	}

	pub fn object_id(&self) -> Option<&ObjectId> {
		self.object_id.as_ref()
	}

	pub fn backend_size(&self) -> u64 {
		self.backend_size
	}

	pub fn exists_remotely(&self) -> bool {
		self.object_id.is_some()
	}

	/// Streaming ranged read straight from the remote object. A file with no
	/// remote object yet has no remote bytes to fetch; callers only reach
	/// this for pages backed by the remote, never for purely-dirty regions
	/// of a not-yet-created file.
	pub fn fetch_range(&self, offset: u64, length: u64, sink: &mut dyn FnMut(u64, &[u8])) -> Result<(), Error> {
		let Some(id) = &self.object_id else {
			return Ok(());
		};
		if length == 0 {
			return Ok(());
		}
		self.backend.read_file(id, offset, length, sink)
	}

	/// Writes one contiguous dirty run back to the remote. `offset == 0`
	/// against a not-yet-existing object is the create path (`upload_file`
	/// in one call); everything else is an ordinary `write_file` against an
	/// already-materialized object.
	pub fn flush_range(&mut self, offset: u64, buf: &[u8]) -> Result<(), Error> {
		match &self.object_id {
			Some(id) => {
				self.backend.write_file(id, offset, buf)?;
			}
			None if offset == 0 => {
				let id = self.backend.upload_file(&self.parent_id, &self.name, buf)?;
				self.object_id = Some(id);
			}
			None => {
				// A dirty run that doesn't start at 0 but whose object still
				// doesn't exist can only happen if an earlier index-0 flush
				// in the same batch already created it; the caller always
				// flushes runs in ascending offset order within one batch.
				let id = self.backend.create_file(&self.parent_id, &self.name)?;
				self.backend.write_file(&id, offset, buf)?;
				self.object_id = Some(id);
			}
		}
		self.backend_size = self.backend_size.max(offset + buf.len() as u64);
		Ok(())
	}

	/// No-op if the backend object doesn't exist yet: there is nothing
	/// remote to truncate, and the next flush will create it at whatever
	/// size the in-memory pages end up being.
	pub fn truncate(&mut self, new_size: u64) -> Result<(), Error> {
		let Some(id) = &self.object_id else {
			return Ok(());
		};
		self.backend.truncate_file(id, new_size)?;
		self.backend_size = new_size;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::MockBackend;

	fn object_id(s: &str) -> ObjectId {
		ObjectId::from(s)
	}

	#[test]
	fn fetch_range_on_a_pending_file_reads_nothing() {
		let backend = MockBackend::new();
		let page_backend = PageBackend::pending(Arc::new(backend), object_id("parent"), "f".into());
		let mut seen = Vec::new();
		page_backend.fetch_range(0, 100, &mut |off, buf| seen.push((off, buf.to_vec()))).unwrap();
		assert!(seen.is_empty());
	}

	#[test]
	fn flush_range_at_zero_on_a_pending_file_uploads_and_creates_the_object() {
		let mut backend = MockBackend::new();
		backend
			.expect_upload_file()
			.withf(|parent, name, buf| parent.as_ref() == "parent" && name == "f" && buf == b"hello")
			.returning(|_, _, _| Ok(object_id("new-id")));
		let mut page_backend = PageBackend::pending(Arc::new(backend), object_id("parent"), "f".into());
		page_backend.flush_range(0, b"hello").unwrap();
		assert_eq!(page_backend.object_id().unwrap().as_ref(), "new-id");
		assert_eq!(page_backend.backend_size(), 5);
	}

	#[test]
	fn flush_range_against_an_existing_object_writes_in_place() {
		let mut backend = MockBackend::new();
		backend.expect_write_file().withf(|id, offset, buf| id.as_ref() == "id" && *offset == 10 && buf == b"abc").returning(|_, _, _| Ok(()));
		let mut page_backend = PageBackend::existing(Arc::new(backend), object_id("parent"), "f".into(), object_id("id"), 10);
		page_backend.flush_range(10, b"abc").unwrap();
		assert_eq!(page_backend.backend_size(), 13);
	}

	#[test]
	fn truncate_on_a_pending_file_is_a_no_op() {
		let backend = MockBackend::new();
		let mut page_backend = PageBackend::pending(Arc::new(backend), object_id("parent"), "f".into());
		page_backend.truncate(0).unwrap();
		assert!(!page_backend.exists_remotely());
	}

	#[test]
	fn truncate_on_an_existing_object_calls_through_and_updates_size() {
		let mut backend = MockBackend::new();
		backend.expect_truncate_file().withf(|id, size| id.as_ref() == "id" && *size == 4).returning(|_, _| Ok(()));
		let mut page_backend = PageBackend::existing(Arc::new(backend), object_id("parent"), "f".into(), object_id("id"), 10);
		page_backend.truncate(4).unwrap();
		assert_eq!(page_backend.backend_size(), 4);
	}
}
