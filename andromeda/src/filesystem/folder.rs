//! A thin handle over one remote folder. `Folder` does no caching of its
//! own; it is a factory that opens [`File`] handles against the same shared
//! [`CacheManager`], and a pass-through to [`Backend`] for the object
//! mutations a folder listing needs.

use std::sync::Arc;

use crate::backend::{Backend, Error as BackendError, ObjectId};
use crate::filedata::CacheManager;
use crate::filesystem::file::File;

pub struct Folder<B: Backend> {
	id: ObjectId,
	backend: Arc<B>,
	cache: Arc<CacheManager<B>>,
}

impl<B: Backend + 'static> Folder<B> {
	pub fn new(id: ObjectId, backend: Arc<B>, cache: Arc<CacheManager<B>>) -> Self {
		Self { id, backend, cache }
	}

	pub fn id(&self) -> &ObjectId {
		&self.id
	}

	/// Materializes a new, empty child file and returns a handle to it.
	pub fn create_file(&self, name: &str) -> Result<File<B>, BackendError> {
		let object_id = self.backend.create_file(&self.id, name)?;
		Ok(File::open_existing(self.cache.clone(), self.backend.clone(), self.id.clone(), name.to_string(), object_id, 0))
	}

	/// Opens a handle to a child file whose remote object already exists.
	pub fn open_file(&self, name: &str, object_id: ObjectId, remote_size: u64) -> File<B> {
		File::open_existing(self.cache.clone(), self.backend.clone(), self.id.clone(), name.to_string(), object_id, remote_size)
	}

	/// Opens a handle to a not-yet-created child file, e.g. one this process
	/// just decided to create locally but hasn't flushed yet.
	pub fn create_file_pending(&self, name: &str) -> File<B> {
		File::open_pending(self.cache.clone(), self.backend.clone(), self.id.clone(), name.to_string())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::MockBackend;
	use crate::config::{CacheMode, Config};

	#[test]
	fn create_file_calls_the_backend_and_returns_a_writable_handle() {
		let mut backend = MockBackend::new();
		backend.expect_create_file().withf(|parent, name| parent.as_ref() == "root" && name == "a.txt").returning(|_, _| Ok(ObjectId::from("new-id")));
		let (cache, workers) = CacheManager::new(Config { cache_mode: CacheMode::Memory, ..Default::default() });
		let folder = Folder::new(ObjectId::from("root"), Arc::new(backend), cache.clone());
		let file = folder.create_file("a.txt").unwrap();
		assert_eq!(file.size(), 0);
		drop(file);
		cache.stop(workers);
	}
}
