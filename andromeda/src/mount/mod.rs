//! The narrow boundary a kernel-facing FUSE adapter would call into
//! (Non-goals: this crate does not implement that adapter, only the trait
//! it would be written against).

use crate::backend::Backend;
use crate::filedata::PageManagerError;
use crate::filesystem::File;

/// Filesystem operations a FUSE (or similar) frontend drives. Every method
/// maps directly onto a single [`File`] or [`Folder`](crate::filesystem::Folder)
/// call; this trait exists purely to give an adapter crate one stable
/// surface to implement against instead of reaching into `filesystem`
/// directly.
pub trait FilesystemOps<B: Backend> {
	fn read(&self, file: &File<B>, offset: u64, buf: &mut [u8]) -> Result<usize, PageManagerError> {
		file.read(offset, buf)
	}

	fn write(&self, file: &File<B>, offset: u64, buf: &[u8]) -> Result<(), PageManagerError> {
		file.write(offset, buf)
	}

	fn truncate(&self, file: &File<B>, new_size: u64) -> Result<(), PageManagerError> {
		file.truncate(new_size)
	}

	fn flush(&self, file: &File<B>) -> Result<(), PageManagerError> {
		file.flush()
	}

	fn getattr_size(&self, file: &File<B>) -> u64 {
		file.size()
	}
}

/// The default, direct implementation: every call is exactly the
/// corresponding `File` method with no extra bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectFilesystemOps;

impl<B: Backend> FilesystemOps<B> for DirectFilesystemOps {}
