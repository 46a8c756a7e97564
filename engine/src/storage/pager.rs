//! Page file I/O with a decoded page cache.
//!
//! Pages are read on first access and then stay cached for the life of the
//! pager; there is no eviction. Writes happen only through
//! [`Pager::flush_page`].

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::storage::page::{NO_PAGE, PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageId};

/// Demand-paged access to a file of fixed-size pages.
#[derive(Debug)]
pub struct Pager {
    file: File,
    page_count: u32,
    cache: HashMap<PageId, Page>,
}

impl Pager {
    /// Open or create a page file.
    ///
    /// The file length must be a multiple of the page size. An empty file
    /// is initialised with page 0 as an empty root leaf.
    pub fn open(path: &Path) -> Result<Self, PagerError> {
        let open_error = |source| PagerError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(open_error)?;

        let len = file.metadata().map_err(open_error)?.len();
        if len % PAGE_SIZE_U64 != 0 {
            return Err(PagerError::FileLength { len });
        }
        let page_count =
            u32::try_from(len / PAGE_SIZE_U64).map_err(|_| PagerError::FileLength { len })?;

        let mut pager = Self {
            file,
            page_count,
            cache: HashMap::new(),
        };

        if page_count == 0 {
            pager.cache.insert(0, Page::root_leaf(0));
            pager.page_count = 1;
            pager.flush_page(0)?;
            debug!(path = %path.display(), "initialised root page");
        }

        debug!(path = %path.display(), pages = pager.page_count, "opened page file");
        Ok(pager)
    }

    /// Number of pages in the file, including pages touched but not yet
    /// flushed.
    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Number of decoded pages held in memory.
    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Get a page, reading it from the file on first access.
    ///
    /// An index at or past the end of the file yields a blank page and
    /// extends the page count to cover it.
    pub fn get_page(&mut self, idx: PageId) -> Result<&mut Page, PagerError> {
        if idx == NO_PAGE {
            return Err(PagerError::InvalidPage(idx));
        }
        match self.cache.entry(idx) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let page = if idx < self.page_count {
                    read_page(&mut self.file, idx)?
                } else {
                    self.page_count = idx + 1;
                    Page::blank(idx)
                };
                Ok(entry.insert(page))
            }
        }
    }

    /// Encode a cached page and write it at its offset in the file.
    pub fn flush_page(&mut self, idx: PageId) -> Result<(), PagerError> {
        let page = self.cache.get(&idx).ok_or(PagerError::NotCached(idx))?;
        let bytes = page
            .marshal()
            .map_err(|source| PagerError::Encode { page: idx, source })?;

        let io_error = |source| PagerError::Io { page: idx, source };
        self.file
            .seek(SeekFrom::Start(u64::from(idx) * PAGE_SIZE_U64))
            .map_err(io_error)?;
        self.file.write_all(&bytes).map_err(io_error)?;

        trace!(page = idx, "flushed page");
        Ok(())
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<(), PagerError> {
        self.file.sync_all().map_err(PagerError::Sync)
    }
}

fn read_page(file: &mut File, idx: PageId) -> Result<Page, PagerError> {
    let mut buf = vec![0u8; PAGE_SIZE];
    file.seek(SeekFrom::Start(u64::from(idx) * PAGE_SIZE_U64))
        .map_err(|source| PagerError::Io { page: idx, source })?;
    file.read_exact(&mut buf).map_err(|source| {
        if source.kind() == ErrorKind::UnexpectedEof {
            PagerError::Truncated { page: idx }
        } else {
            PagerError::Io { page: idx, source }
        }
    })?;

    let page = Page::unmarshal(&buf).map_err(|source| PagerError::Corrupt { page: idx, source })?;
    if page.id != idx {
        return Err(PagerError::IdMismatch {
            page: idx,
            found: page.id,
        });
    }

    debug!(page = idx, leaf = page.is_leaf(), "read page from disk");
    Ok(page)
}

/// Errors from the page file.
#[derive(Debug)]
pub enum PagerError {
    /// The file could not be opened.
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// File length is not a whole number of pages.
    FileLength { len: u64 },
    /// Reserved page index.
    InvalidPage(PageId),
    /// I/O error on a page.
    Io {
        page: PageId,
        source: std::io::Error,
    },
    /// The file ended inside a page.
    Truncated { page: PageId },
    /// A page could not be decoded.
    Corrupt { page: PageId, source: PageError },
    /// A page records a different id than its position in the file.
    IdMismatch { page: PageId, found: PageId },
    /// A page could not be encoded.
    Encode { page: PageId, source: PageError },
    /// Flush of a page that was never loaded.
    NotCached(PageId),
    /// Syncing the file failed.
    Sync(std::io::Error),
}

impl std::fmt::Display for PagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open { path, source } => {
                write!(f, "cannot open {}: {source}", path.display())
            }
            Self::FileLength { len } => {
                write!(f, "file length {len} is not a multiple of {PAGE_SIZE}")
            }
            Self::InvalidPage(page) => write!(f, "page index {page} is reserved"),
            Self::Io { page, source } => write!(f, "I/O error on page {page}: {source}"),
            Self::Truncated { page } => write!(f, "file ends inside page {page}"),
            Self::Corrupt { page, source } => write!(f, "corrupt page {page}: {source}"),
            Self::IdMismatch { page, found } => {
                write!(f, "page {page} is labelled as page {found}")
            }
            Self::Encode { page, source } => write!(f, "cannot encode page {page}: {source}"),
            Self::NotCached(page) => write!(f, "page {page} is not cached"),
            Self::Sync(e) => write!(f, "sync failed: {e}"),
        }
    }
}

impl std::error::Error for PagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. } | Self::Io { source, .. } => Some(source),
            Self::Sync(e) => Some(e),
            Self::Corrupt { source, .. } | Self::Encode { source, .. } => Some(source),
            Self::FileLength { .. }
            | Self::InvalidPage(_)
            | Self::Truncated { .. }
            | Self::IdMismatch { .. }
            | Self::NotCached(_) => None,
        }
    }
}
