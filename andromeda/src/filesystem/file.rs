//! A thin handle over one open file's page table. `File` owns no cache state
//! itself; every read, write, truncate, and flush is a direct delegation to
//! its [`PageManager`].

use std::sync::Arc;

use crate::backend::{Backend, ObjectId};
use crate::filedata::{CacheManager, PageBackend, PageManager, PageManagerError};

pub struct File<B: Backend> {
	manager: Arc<PageManager<B>>,
}

impl<B: Backend + 'static> File<B> {
	/// Opens a file backed by an existing remote object.
	pub fn open_existing(cache: Arc<CacheManager<B>>, backend: Arc<B>, parent_id: ObjectId, name: String, object_id: ObjectId, remote_size: u64) -> Self {
		let page_backend = PageBackend::existing(backend, parent_id, name, object_id, remote_size);
		let config = cache.config().clone();
		Self { manager: PageManager::new(cache, config, page_backend, remote_size) }
	}

	/// Opens a handle to a file that does not exist on the remote yet; its
	/// first flush materializes it (Section 4.3, "FlushCreate").
	pub fn open_pending(cache: Arc<CacheManager<B>>, backend: Arc<B>, parent_id: ObjectId, name: String) -> Self {
		let page_backend = PageBackend::pending(backend, parent_id, name);
		let config = cache.config().clone();
		Self { manager: PageManager::new(cache, config, page_backend, 0) }
	}

	pub fn size(&self) -> u64 {
		self.manager.file_size()
	}

	pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, PageManagerError> {
		self.manager.read_bytes(offset, buf)
	}

	pub fn write(&self, offset: u64, buf: &[u8]) -> Result<(), PageManagerError> {
		self.manager.write_bytes(offset, buf)
	}

	pub fn truncate(&self, new_size: u64) -> Result<(), PageManagerError> {
		self.manager.truncate(new_size)
	}

	pub fn flush(&self) -> Result<(), PageManagerError> {
		self.manager.flush()
	}
}

impl<B: Backend> Drop for File<B> {
	fn drop(&mut self) {
		self.manager.close();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::backend::MockBackend;
	use crate::config::{CacheMode, Config};

	fn config() -> Config {
		Config { page_size: 16, cache_mode: CacheMode::Memory, ..Default::default() }
	}

	#[test]
	fn a_pending_file_can_be_written_and_read_back_before_ever_flushing() {
		let backend = MockBackend::new();
		let (cache, workers) = CacheManager::new(config());
		let file = File::open_pending(cache.clone(), Arc::new(backend), ObjectId::from("parent"), "new.txt".into());
		file.write(0, b"draft").unwrap();
		let mut out = [0u8; 5];
		file.read(0, &mut out).unwrap();
		assert_eq!(&out, b"draft");
		drop(file);
		cache.stop(workers);
	}
}
