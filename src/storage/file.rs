use crate::pages::PageId;
use crate::storage::{PageSwapper, StorageError};

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Sentinel for "no page written yet".
const NO_PAGE: u64 = u64::MAX;

/// Swaps pages to a regular file, page `n` living at offset `n * page_size`.
///
/// Reads past the end of the file return zeros, so a page exists as soon as
/// it is addressed. With `direct_io` the file is opened with `O_DIRECT`, which
/// requires page buffers aligned to the device block size.
pub struct FileSwapper {
    file: File,
    path: PathBuf,
    page_size: usize,
    last_page_id: AtomicU64,
}

impl FileSwapper {
    /// Opens `path`, creating it when missing.
    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        direct_io: bool,
    ) -> Result<Self, StorageError> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(path.as_ref()).map_err(StorageError::Io)?;

        let len = file.metadata()?.len();
        let pages = len / page_size as u64;
        let last_page_id = if pages == 0 { NO_PAGE } else { pages - 1 };

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
            last_page_id: AtomicU64::new(last_page_id),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn check_buffer(&self, len: usize) -> Result<(), StorageError> {
        if len != self.page_size {
            return Err(StorageError::BufferSize {
                expected: self.page_size,
                actual: len,
            });
        }
        Ok(())
    }
}

impl PageSwapper for FileSwapper {
    fn read(&self, page_id: PageId, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check_buffer(buf.len())?;
        let offset = page_id.offset(self.page_size);

        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        // past the end of the file
        buf[filled..].fill(0);

        Ok(())
    }

    fn write(&self, page_id: PageId, buf: &[u8]) -> Result<(), StorageError> {
        self.check_buffer(buf.len())?;
        let offset = page_id.offset(self.page_size);

        self.file
            .write_all_at(buf, offset)
            .map_err(StorageError::Io)?;

        let _ = self
            .last_page_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                (last == NO_PAGE || last < page_id.get()).then_some(page_id.get())
            });
        Ok(())
    }

    /// Syncs file data and metadata to the disk.
    fn force(&self) -> Result<(), StorageError> {
        // if fsync fails, we can't make sure data is flushed to disk
        // ref: https://wiki.postgresql.org/wiki/Fsync_Errors
        self.file.sync_all().map_err(StorageError::Io)
    }

    fn last_page_id(&self) -> Option<PageId> {
        match self.last_page_id.load(Ordering::Acquire) {
            NO_PAGE => None,
            last => Some(PageId::new(last)),
        }
    }
}
