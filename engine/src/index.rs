//! Clustered index: rows keyed by their integer primary key.
//!
//! This is the boundary the table layer talks to. It adds row semantics on
//! top of the tree: inserting an existing primary key is an error, while
//! updates and deletes report whether the row was there.

use std::path::Path;

use tracing::debug;

use crate::bptree::{BPTree, Key, MemoryStore, NodeStore, Scan, TreeError};
use crate::storage::PagedStore;

/// Rows of one table ordered by primary key.
#[derive(Debug)]
pub struct ClusteredIndex<S> {
    tree: BPTree<S>,
}

impl<V: Clone + PartialEq> ClusteredIndex<MemoryStore<V>> {
    /// Create an empty in-memory index.
    #[must_use]
    pub fn in_memory(width: usize) -> Self {
        Self {
            tree: BPTree::new(width),
        }
    }
}

impl ClusteredIndex<PagedStore> {
    /// Open or create an index stored in the file at `path`.
    pub fn open(path: &Path, width: usize, row_size: usize) -> Result<Self, IndexError> {
        let tree = BPTree::open(path, width, row_size)?;
        Ok(Self { tree })
    }
}

impl<S: NodeStore> ClusteredIndex<S> {
    /// Wrap an existing tree.
    pub const fn new(tree: BPTree<S>) -> Self {
        Self { tree }
    }

    /// The underlying tree.
    pub const fn tree(&self) -> &BPTree<S> {
        &self.tree
    }

    /// Look up a row by primary key.
    pub fn get(&self, key: Key) -> Result<Option<S::Value>, IndexError> {
        Ok(self.tree.get(key)?)
    }

    /// Insert a new row.
    ///
    /// Fails with [`IndexError::DuplicateKey`] if the key is taken.
    pub fn insert(&self, key: Key, row: S::Value) -> Result<(), IndexError> {
        if !self.tree.try_insert(key, row)? {
            debug!(key, "rejected duplicate primary key");
            return Err(IndexError::DuplicateKey(key));
        }
        Ok(())
    }

    /// Insert or replace a row.
    pub fn upsert(&self, key: Key, row: S::Value) -> Result<(), IndexError> {
        self.tree.set(key, row)?;
        Ok(())
    }

    /// Replace an existing row. Returns whether the key existed.
    pub fn update(&self, key: Key, row: S::Value) -> Result<bool, IndexError> {
        Ok(self.tree.update_existing(key, row)?)
    }

    /// Delete a row. Returns whether it existed.
    pub fn delete(&self, key: Key) -> Result<bool, IndexError> {
        Ok(self.tree.remove(key)?)
    }

    /// All rows, highest primary key first.
    pub fn rows(&self) -> Result<Scan<'_, S>, IndexError> {
        Ok(self.tree.get_all_items()?)
    }

    /// Number of rows.
    pub fn len(&self) -> Result<usize, IndexError> {
        Ok(self.tree.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, IndexError> {
        Ok(self.tree.is_empty()?)
    }
}

/// Errors from the clustered index.
#[derive(Debug)]
pub enum IndexError {
    /// A row with this primary key already exists.
    DuplicateKey(Key),
    /// Tree error.
    Tree(TreeError),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateKey(key) => write!(f, "duplicate key {key}"),
            Self::Tree(e) => write!(f, "tree error: {e}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DuplicateKey(_) => None,
            Self::Tree(e) => Some(e),
        }
    }
}

impl From<TreeError> for IndexError {
    fn from(e: TreeError) -> Self {
        Self::Tree(e)
    }
}
