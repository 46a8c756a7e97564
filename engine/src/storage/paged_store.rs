//! Tree nodes stored as pages in a file.
//!
//! Node ids are page indexes. Each page records its parent, so the root can
//! be found again on reopen by climbing from page 0, which always holds the
//! left-most leaf. Pages touched by an operation are written back when the
//! tree commits it.

use std::collections::BTreeSet;
use std::mem;
use std::path::Path;

use tracing::{debug, trace};

use crate::bptree::{BPTree, Key, Node, NodeId, NodeStore, TreeError};
use crate::storage::page::{NO_PAGE, Page, PageError, internal_capacity, leaf_capacity};
use crate::storage::pager::Pager;

/// A [`NodeStore`] over a [`Pager`].
///
/// Values are byte strings of one fixed size per file, because all cells of
/// a leaf page share a single record size.
#[derive(Debug)]
pub struct PagedStore {
    pager: Pager,
    root: NodeId,
    value_size: usize,
    dirty: BTreeSet<NodeId>,
}

impl PagedStore {
    /// Open or create the page file at `path`.
    pub fn open(path: &Path, value_size: usize) -> Result<Self, TreeError> {
        let mut pager = Pager::open(path)?;
        let root = find_root(&mut pager)?;

        if let Some(actual) = stored_value_size(&mut pager)? {
            if actual != value_size {
                return Err(TreeError::ValueSize {
                    expected: value_size,
                    actual,
                });
            }
        }

        debug!(root, pages = pager.page_count(), "opened paged store");
        Ok(Self {
            pager,
            root,
            value_size,
            dirty: BTreeSet::new(),
        })
    }

    /// Size in bytes of every value in this store.
    #[must_use]
    pub const fn value_size(&self) -> usize {
        self.value_size
    }

    /// Number of pages in the file, including released ones.
    #[must_use]
    pub const fn page_count(&self) -> u32 {
        self.pager.page_count()
    }

    /// Largest element count of any live page.
    fn widest_node(&mut self) -> Result<usize, TreeError> {
        let mut widest = 0;
        for id in 0..self.pager.page_count() {
            let page = self.pager.get_page(id)?;
            if !page.is_deleted {
                widest = widest.max(page.node.len());
            }
        }
        Ok(widest)
    }

    fn page_mut(&mut self, id: NodeId) -> Result<&mut Page, TreeError> {
        let page = live_page(&mut self.pager, id)?;
        self.dirty.insert(id);
        Ok(page)
    }
}

impl BPTree<PagedStore> {
    /// Open a tree stored in the file at `path`.
    ///
    /// A missing or empty file starts out as an empty tree. The width is not
    /// stored in the file, so reopening with a width smaller than some stored
    /// node fails with [`TreeError::WidthTooSmall`].
    pub fn open(path: &Path, width: usize, value_size: usize) -> Result<Self, TreeError> {
        let mut store = PagedStore::open(path, value_size)?;
        let widest = store.widest_node()?;
        let tree = Self::with_store(store, width)?;
        let width = tree.width()?;
        if widest > width {
            return Err(TreeError::WidthTooSmall { width, widest });
        }
        Ok(tree)
    }
}

impl NodeStore for PagedStore {
    type Value = Vec<u8>;

    fn root(&self) -> NodeId {
        self.root
    }

    fn set_root(&mut self, id: NodeId) -> Result<(), TreeError> {
        if id != self.root {
            let old = self.root;
            self.page_mut(old)?.is_root = false;
        }
        let page = self.page_mut(id)?;
        page.is_root = true;
        page.parent = None;
        self.root = id;
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> Result<&Node<Vec<u8>>, TreeError> {
        Ok(&live_page(&mut self.pager, id)?.node)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<Vec<u8>>, TreeError> {
        Ok(&mut self.page_mut(id)?.node)
    }

    fn allocate(&mut self, node: Node<Vec<u8>>) -> Result<NodeId, TreeError> {
        let id = self.pager.page_count();
        if id == NO_PAGE {
            return Err(TreeError::IdsExhausted);
        }
        let page = self.pager.get_page(id)?;
        page.node = node;
        self.dirty.insert(id);
        Ok(id)
    }

    fn release(&mut self, id: NodeId) -> Result<Node<Vec<u8>>, TreeError> {
        let page = self.page_mut(id)?;
        page.is_deleted = true;
        page.parent = None;
        Ok(mem::replace(&mut page.node, Node::empty_leaf()))
    }

    fn adopt(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        self.page_mut(child)?.parent = Some(parent);
        Ok(())
    }

    fn max_width(&self) -> Option<usize> {
        Some(leaf_capacity(self.value_size).min(internal_capacity()))
    }

    fn check_entry(&self, key: Key, value: &Vec<u8>) -> Result<(), TreeError> {
        if i32::try_from(key).is_err() {
            return Err(PageError::KeyOutOfRange(key).into());
        }
        if value.len() != self.value_size {
            return Err(TreeError::ValueSize {
                expected: self.value_size,
                actual: value.len(),
            });
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), TreeError> {
        let dirty = mem::take(&mut self.dirty);
        for &id in &dirty {
            self.pager.flush_page(id)?;
        }
        trace!(pages = dirty.len(), "committed pages");
        Ok(())
    }

    fn sync(&mut self) -> Result<(), TreeError> {
        self.commit()?;
        self.pager.sync()?;
        Ok(())
    }
}

/// A page that exists in the file and has not been released.
fn live_page(pager: &mut Pager, id: NodeId) -> Result<&mut Page, TreeError> {
    if id >= pager.page_count() {
        return Err(TreeError::MissingNode(id));
    }
    let page = pager.get_page(id)?;
    if page.is_deleted {
        return Err(TreeError::MissingNode(id));
    }
    Ok(page)
}

/// Climb parent links from page 0 to the root.
fn find_root(pager: &mut Pager) -> Result<NodeId, TreeError> {
    let mut id = 0;
    for _ in 0..pager.page_count() {
        let page = live_page(pager, id)?;
        if page.is_root {
            return Ok(id);
        }
        id = page.parent.ok_or_else(|| TreeError::Invariant {
            node: id,
            reason: "page is neither the root nor has a parent".to_owned(),
        })?;
    }
    Err(TreeError::Invariant {
        node: id,
        reason: "parent links do not reach a root".to_owned(),
    })
}

/// Value size recorded in the file, taken from the first non-empty leaf.
fn stored_value_size(pager: &mut Pager) -> Result<Option<usize>, TreeError> {
    let mut next = Some(0);
    for _ in 0..pager.page_count() {
        let Some(id) = next else {
            break;
        };
        let leaf = live_page(pager, id)?
            .node
            .as_leaf()
            .ok_or(TreeError::UnexpectedNode {
                id,
                expected: "leaf",
            })?;
        if let Some(item) = leaf.items().first() {
            return Ok(Some(item.value.len()));
        }
        next = leaf.next;
    }
    Ok(None)
}
