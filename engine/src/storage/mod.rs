//! Disk storage for the B+-tree.
//!
//! # File Format
//!
//! The index is stored in a single file of 4KB pages. Page `n` lives at
//! offset `n * 4096` and holds tree node `n`:
//!
//! - Page 0: the left-most leaf (the root leaf of a fresh file)
//! - Remaining pages: leaves and internal nodes in allocation order
//!
//! Released pages stay in the file with their deleted flag set.
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use engine::bptree::BPTree;
//!
//! let tree = BPTree::open(Path::new("index.db"), 32, 8)?;
//! tree.set(1, b"row-0001".to_vec())?;
//! assert_eq!(tree.get(1)?, Some(b"row-0001".to_vec()));
//! tree.sync()?;
//! # Ok::<(), engine::bptree::TreeError>(())
//! ```

mod page;
mod paged_store;
mod pager;

pub use page::{
    CHILD_SIZE, Header, KEY_SIZE, NO_PAGE, PAGE_SIZE, PAGE_SIZE_U64, Page, PageError, PageId,
    internal_capacity, leaf_capacity,
};
pub use paged_store::PagedStore;
pub use pager::{Pager, PagerError};
