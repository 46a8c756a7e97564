//! The B+-tree algorithm: lookup, upsert with split propagation, and delete
//! with borrow-or-merge rebalancing.
//!
//! Recursion works on node ids, never on node references, so the same code
//! runs over the in-memory arena and over pages faulted in by the pager.
//! Rebalancing is driven from the parent, which is the only place both
//! siblings and their child records are visible at once.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockWriteGuard};

use serde::Serialize;
use tracing::debug;

use crate::bptree::scan::{Direction, Scan};
use crate::bptree::{
    Child, Entry, InternalNode, Key, LeafNode, MemoryStore, Node, NodeId, NodeStore, SetOutcome,
};
use crate::storage::{PageError, PagerError};

/// Smallest width a tree accepts. Smaller requests are raised to this.
pub const MIN_WIDTH: usize = 3;

/// A B+-tree over a [`NodeStore`].
///
/// Every operation, reads included, holds the tree's lock exclusively for
/// its whole duration. A [`Scan`] keeps holding it until dropped, so the tree
/// must not be called from inside a scan loop.
#[derive(Debug)]
pub struct BPTree<S> {
    inner: RwLock<TreeInner<S>>,
}

#[derive(Debug)]
pub(super) struct TreeInner<S> {
    pub(super) store: S,
    width: usize,
    half_width: usize,
}

/// What an insert below a node reports back to its parent.
struct Insertion {
    outcome: SetOutcome,
    /// New right sibling of the node, if the node split.
    split: Option<Child>,
}

/// Full structural snapshot of a tree.
///
/// Leaves map key to value; internal nodes map each child's `max_key` to the
/// child's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Snapshot<V> {
    Leaf(BTreeMap<Key, V>),
    Internal(BTreeMap<Key, Self>),
}

/// Shape of a tree that passed [`BPTree::check_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    /// Number of levels, 1 for a lone root leaf.
    pub depth: usize,
    pub leaves: usize,
    pub items: usize,
}

impl<V: Clone + PartialEq> BPTree<MemoryStore<V>> {
    /// Create an empty in-memory tree.
    #[must_use]
    pub fn new(width: usize) -> Self {
        Self::from_parts(MemoryStore::new(), width)
    }
}

impl<S: NodeStore> BPTree<S> {
    /// Create a tree over an existing store.
    ///
    /// Fails if the store cannot hold nodes of the requested width.
    pub fn with_store(store: S, width: usize) -> Result<Self, TreeError> {
        let width = width.max(MIN_WIDTH);
        if let Some(max) = store.max_width() {
            if width > max {
                return Err(TreeError::WidthTooLarge { width, max });
            }
        }
        Ok(Self::from_parts(store, width))
    }

    fn from_parts(store: S, width: usize) -> Self {
        let width = width.max(MIN_WIDTH);
        Self {
            inner: RwLock::new(TreeInner {
                store,
                width,
                half_width: width.div_ceil(2),
            }),
        }
    }

    fn lock(&self) -> Result<RwLockWriteGuard<'_, TreeInner<S>>, TreeError> {
        self.inner.write().map_err(|_| TreeError::Poisoned)
    }

    /// Maximum number of elements per node.
    pub fn width(&self) -> Result<usize, TreeError> {
        Ok(self.lock()?.width)
    }

    /// Look up the value stored under `key`.
    pub fn get(&self, key: Key) -> Result<Option<S::Value>, TreeError> {
        self.lock()?.lookup(key)
    }

    /// Insert or overwrite `key`.
    ///
    /// Returns `true` only when an existing key now holds a different value.
    pub fn set(&self, key: Key, value: S::Value) -> Result<bool, TreeError> {
        let outcome = self.lock()?.upsert(key, value)?;
        Ok(outcome == SetOutcome::Updated)
    }

    /// Insert `key` only if it is absent. Returns whether it was inserted.
    pub fn try_insert(&self, key: Key, value: S::Value) -> Result<bool, TreeError> {
        self.lock()?.insert_absent(key, value)
    }

    /// Overwrite `key` only if it is present. Returns whether it was present.
    ///
    /// A missing key is left missing.
    pub fn update_existing(&self, key: Key, value: S::Value) -> Result<bool, TreeError> {
        self.lock()?.replace_present(key, value)
    }

    /// Delete `key`. Returns whether it was present.
    pub fn remove(&self, key: Key) -> Result<bool, TreeError> {
        self.lock()?.delete(key)
    }

    /// All items in descending key order.
    pub fn get_all_items(&self) -> Result<Scan<'_, S>, TreeError> {
        Scan::new(self.lock()?, Direction::Descending)
    }

    /// All items in ascending key order.
    pub fn scan_ascending(&self) -> Result<Scan<'_, S>, TreeError> {
        Scan::new(self.lock()?, Direction::Ascending)
    }

    /// Snapshot of the whole tree structure.
    pub fn get_data(&self) -> Result<Snapshot<S::Value>, TreeError> {
        self.lock()?.root_snapshot()
    }

    /// Number of items, counted along the leaf chain.
    pub fn len(&self) -> Result<usize, TreeError> {
        self.lock()?.count_items()
    }

    pub fn is_empty(&self) -> Result<bool, TreeError> {
        Ok(self.len()? == 0)
    }

    /// Largest key in the tree, `0` when empty.
    pub fn max_key(&self) -> Result<Key, TreeError> {
        self.lock()?.root_max_key()
    }

    /// Walk the whole tree and verify its structural invariants.
    pub fn check_invariants(&self) -> Result<TreeShape, TreeError> {
        self.lock()?.check_invariants()
    }

    /// Make all committed changes durable.
    pub fn sync(&self) -> Result<(), TreeError> {
        self.lock()?.store.sync()
    }
}

impl<S: NodeStore> TreeInner<S> {
    fn leaf(&mut self, id: NodeId) -> Result<&LeafNode<S::Value>, TreeError> {
        self.store
            .node(id)?
            .as_leaf()
            .ok_or(TreeError::UnexpectedNode {
                id,
                expected: "leaf",
            })
    }

    fn leaf_mut(&mut self, id: NodeId) -> Result<&mut LeafNode<S::Value>, TreeError> {
        self.store
            .node_mut(id)?
            .as_leaf_mut()
            .ok_or(TreeError::UnexpectedNode {
                id,
                expected: "leaf",
            })
    }

    fn internal(&mut self, id: NodeId) -> Result<&InternalNode, TreeError> {
        self.store
            .node(id)?
            .as_internal()
            .ok_or(TreeError::UnexpectedNode {
                id,
                expected: "internal",
            })
    }

    fn internal_mut(&mut self, id: NodeId) -> Result<&mut InternalNode, TreeError> {
        self.store
            .node_mut(id)?
            .as_internal_mut()
            .ok_or(TreeError::UnexpectedNode {
                id,
                expected: "internal",
            })
    }

    fn lookup(&mut self, key: Key) -> Result<Option<S::Value>, TreeError> {
        let leaf = self.leaf_for(key)?;
        Ok(self.leaf(leaf)?.get(key).cloned())
    }

    fn contains(&mut self, key: Key) -> Result<bool, TreeError> {
        let leaf = self.leaf_for(key)?;
        Ok(self.leaf(leaf)?.get(key).is_some())
    }

    fn insert_absent(&mut self, key: Key, value: S::Value) -> Result<bool, TreeError> {
        if self.contains(key)? {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    fn replace_present(&mut self, key: Key, value: S::Value) -> Result<bool, TreeError> {
        if !self.contains(key)? {
            return Ok(false);
        }
        self.upsert(key, value)?;
        Ok(true)
    }

    fn delete(&mut self, key: Key) -> Result<bool, TreeError> {
        let root = self.store.root();
        let removed = self.remove_from(root, key)?;
        if removed {
            self.store.commit()?;
        }
        Ok(removed)
    }

    fn count_items(&mut self) -> Result<usize, TreeError> {
        let mut next = Some(self.edge_leaf(Direction::Ascending)?);
        let mut count = 0;
        while let Some(id) = next {
            let leaf = self.leaf(id)?;
            count += leaf.len();
            next = leaf.next;
        }
        Ok(count)
    }

    fn root_snapshot(&mut self) -> Result<Snapshot<S::Value>, TreeError> {
        let root = self.store.root();
        self.snapshot(root)
    }

    fn root_max_key(&mut self) -> Result<Key, TreeError> {
        let root = self.store.root();
        Ok(self.store.node(root)?.max_key())
    }

    /// Id of the leaf that owns `key`, or would own it once inserted.
    pub(super) fn leaf_for(&mut self, key: Key) -> Result<NodeId, TreeError> {
        let mut id = self.store.root();
        loop {
            match self.store.node(id)? {
                Node::Leaf(_) => return Ok(id),
                Node::Internal(internal) => {
                    let idx = internal.route(key).ok_or(TreeError::EmptyInternal(id))?;
                    id = internal.children()[idx].id;
                }
            }
        }
    }

    /// Id of the left-most or right-most leaf.
    pub(super) fn edge_leaf(&mut self, direction: Direction) -> Result<NodeId, TreeError> {
        let mut id = self.store.root();
        loop {
            match self.store.node(id)? {
                Node::Leaf(_) => return Ok(id),
                Node::Internal(internal) => {
                    let child = match direction {
                        Direction::Ascending => internal.children().first(),
                        Direction::Descending => internal.children().last(),
                    };
                    id = child.ok_or(TreeError::EmptyInternal(id))?.id;
                }
            }
        }
    }

    fn upsert(&mut self, key: Key, value: S::Value) -> Result<SetOutcome, TreeError> {
        self.store.check_entry(key, &value)?;

        let root = self.store.root();
        let insertion = self.insert(root, key, value)?;
        if let Some(sibling) = insertion.split {
            self.grow_root(root, sibling)?;
        }
        if insertion.outcome != SetOutcome::Unchanged {
            self.store.commit()?;
        }
        Ok(insertion.outcome)
    }

    fn insert(&mut self, id: NodeId, key: Key, value: S::Value) -> Result<Insertion, TreeError> {
        let route = match self.store.node(id)? {
            Node::Leaf(_) => None,
            Node::Internal(internal) => {
                let idx = internal.route(key).ok_or(TreeError::EmptyInternal(id))?;
                Some((idx, internal.children()[idx].id))
            }
        };

        let Some((child_idx, child_id)) = route else {
            let leaf = self.leaf_mut(id)?;
            let outcome = leaf.set_value(key, value);
            let len = leaf.len();
            let split = if len > self.width {
                Some(self.split_leaf(id)?)
            } else {
                None
            };
            return Ok(Insertion { outcome, split });
        };

        let below = self.insert(child_id, key, value)?;
        if below.outcome == SetOutcome::Unchanged {
            return Ok(below);
        }
        let child_max = self.store.node(child_id)?.max_key();

        let internal = self.internal_mut(id)?;
        internal.set_child_max_key(child_idx, child_max);
        if let Some(sibling) = below.split {
            internal.add_child(sibling);
        }
        let len = internal.len();
        if let Some(sibling) = below.split {
            self.store.adopt(id, sibling.id)?;
        }

        let split = if len > self.width {
            Some(self.split_internal(id)?)
        } else {
            None
        };
        Ok(Insertion {
            outcome: below.outcome,
            split,
        })
    }

    /// Move the upper part of an overfull leaf into a new right neighbour.
    fn split_leaf(&mut self, id: NodeId) -> Result<Child, TreeError> {
        let at = self.width / 2 + 1;
        let leaf = self.leaf_mut(id)?;
        let tail = leaf.split_off(at);
        let next = leaf.next;

        let sibling = LeafNode::from_items(tail, Some(id), next);
        let max_key = sibling.max_key();
        let sibling_id = self.store.allocate(Node::Leaf(sibling))?;

        self.leaf_mut(id)?.next = Some(sibling_id);
        if let Some(next) = next {
            self.leaf_mut(next)?.prev = Some(sibling_id);
        }

        debug!(leaf = id, sibling = sibling_id, "split leaf");
        Ok(Child {
            id: sibling_id,
            max_key,
        })
    }

    /// Move the upper part of an overfull internal node into a new sibling.
    fn split_internal(&mut self, id: NodeId) -> Result<Child, TreeError> {
        let at = self.width / 2 + 1;
        let tail = self.internal_mut(id)?.split_off(at);
        let moved: Vec<NodeId> = tail.iter().map(|child| child.id).collect();

        let sibling = InternalNode::from_children(tail);
        let max_key = sibling.max_key();
        let sibling_id = self.store.allocate(Node::Internal(sibling))?;
        for child in moved {
            self.store.adopt(sibling_id, child)?;
        }

        debug!(node = id, sibling = sibling_id, "split internal node");
        Ok(Child {
            id: sibling_id,
            max_key,
        })
    }

    /// Put a new internal root above the old root and its split sibling.
    fn grow_root(&mut self, old_root: NodeId, sibling: Child) -> Result<(), TreeError> {
        let max_key = self.store.node(old_root)?.max_key();
        let root = InternalNode::from_children(vec![
            Child {
                id: old_root,
                max_key,
            },
            sibling,
        ]);
        let root_id = self.store.allocate(Node::Internal(root))?;
        self.store.adopt(root_id, old_root)?;
        self.store.adopt(root_id, sibling.id)?;
        self.store.set_root(root_id)?;

        debug!(root = root_id, "tree grew a level");
        Ok(())
    }

    /// Remove `key` below `id`, rebalancing children on the way back up.
    ///
    /// The node `id` itself is left for its parent to rebalance.
    fn remove_from(&mut self, id: NodeId, key: Key) -> Result<bool, TreeError> {
        let route = match self.store.node(id)? {
            Node::Leaf(_) => None,
            Node::Internal(internal) => {
                let (idx, _) = internal.find_child(key);
                match internal.children().get(idx) {
                    Some(child) => Some((idx, child.id)),
                    None => return Ok(false),
                }
            }
        };

        let Some((idx, child_id)) = route else {
            return Ok(self.leaf_mut(id)?.delete_item(key).is_some());
        };

        if !self.remove_from(child_id, key)? {
            return Ok(false);
        }

        let child = self.store.node(child_id)?;
        let (child_max, child_len) = (child.max_key(), child.len());
        self.internal_mut(id)?.set_child_max_key(idx, child_max);

        if child_len < self.half_width {
            self.rebalance(id, idx)?;
        }
        Ok(true)
    }

    /// Restore the fill of the under-full child at `idx` of `parent`.
    fn rebalance(&mut self, parent: NodeId, idx: usize) -> Result<(), TreeError> {
        let children = self.internal(parent)?.children().to_vec();
        let current = children[idx].id;
        let left = idx.checked_sub(1).and_then(|i| children.get(i));
        let sibling = left
            .map(|child| (child.id, true))
            .or_else(|| children.get(idx + 1).map(|child| (child.id, false)));
        let Some((sibling, is_left)) = sibling else {
            debug!(node = current, "under-filled node has no sibling");
            return Ok(());
        };

        let sibling_len = self.store.node(sibling)?.len();
        let current_len = self.store.node(current)?.len();

        if sibling_len > self.half_width {
            self.borrow(parent, current, sibling, is_left)
        } else if current_len + sibling_len <= self.width {
            if is_left {
                self.merge(parent, sibling, current)
            } else {
                self.merge(parent, current, sibling)
            }
        } else {
            debug!(
                node = current,
                len = current_len,
                sibling_len,
                "under-filled node cannot borrow or merge"
            );
            Ok(())
        }
    }

    /// Move one boundary element of `sibling` into `current`.
    fn borrow(
        &mut self,
        parent: NodeId,
        current: NodeId,
        sibling: NodeId,
        from_left: bool,
    ) -> Result<(), TreeError> {
        let lender = self.store.node_mut(sibling)?;
        let entry = if from_left {
            lender.pop_last()
        } else {
            lender.pop_first()
        }
        .ok_or_else(|| TreeError::invariant(sibling, "lending sibling is empty"))?;

        if let Entry::Child(child) = &entry {
            self.store.adopt(current, child.id)?;
        }
        self.store
            .node_mut(current)?
            .add_entry(entry)
            .map_err(|_| TreeError::invariant(current, "sibling holds a different node kind"))?;

        self.refresh_records(parent, &[current, sibling])?;
        debug!(node = current, sibling, from_left, "borrowed from sibling");
        Ok(())
    }

    /// Move everything in `from` into its left neighbour `into` and drop
    /// `from` from the parent.
    fn merge(&mut self, parent: NodeId, into: NodeId, from: NodeId) -> Result<(), TreeError> {
        match self.store.release(from)? {
            Node::Leaf(absorbed) => {
                let next = absorbed.next;
                let target = self.leaf_mut(into)?;
                target.add_items(absorbed.into_items());
                target.next = next;
                if let Some(next) = next {
                    self.leaf_mut(next)?.prev = Some(into);
                }
            }
            Node::Internal(absorbed) => {
                let children = absorbed.into_children();
                for child in &children {
                    self.store.adopt(into, child.id)?;
                }
                self.internal_mut(into)?.add_children(children);
            }
        }

        self.internal_mut(parent)?
            .delete_child(from)
            .ok_or_else(|| TreeError::invariant(parent, "merged child is not listed"))?;
        self.refresh_records(parent, &[into])?;

        debug!(node = into, absorbed = from, "merged siblings");
        Ok(())
    }

    /// Copy the current `max_key` of each child into `parent`'s records.
    fn refresh_records(&mut self, parent: NodeId, ids: &[NodeId]) -> Result<(), TreeError> {
        for &id in ids {
            let max_key = self.store.node(id)?.max_key();
            let internal = self.internal_mut(parent)?;
            let idx = internal
                .index_of(id)
                .ok_or_else(|| TreeError::invariant(parent, "child is not listed"))?;
            internal.set_child_max_key(idx, max_key);
        }
        Ok(())
    }

    fn snapshot(&mut self, id: NodeId) -> Result<Snapshot<S::Value>, TreeError> {
        let children = match self.store.node(id)? {
            Node::Leaf(leaf) => {
                let items = leaf
                    .items()
                    .iter()
                    .map(|item| (item.key, item.value.clone()))
                    .collect();
                return Ok(Snapshot::Leaf(items));
            }
            Node::Internal(internal) => internal.children().to_vec(),
        };

        let mut nested = BTreeMap::new();
        for child in children {
            nested.insert(child.max_key, self.snapshot(child.id)?);
        }
        Ok(Snapshot::Internal(nested))
    }

    fn check_invariants(&mut self) -> Result<TreeShape, TreeError> {
        let mut walk = Walk::default();
        let root = self.store.root();
        self.verify(root, 1, &mut walk)?;

        let mut last_key: Option<Key> = None;
        for (pos, &id) in walk.leaves.iter().enumerate() {
            let expected_prev = pos.checked_sub(1).map(|p| walk.leaves[p]);
            let expected_next = walk.leaves.get(pos + 1).copied();
            let leaf = self.leaf(id)?;
            if leaf.prev != expected_prev || leaf.next != expected_next {
                return Err(TreeError::invariant(
                    id,
                    "leaf chain does not match tree order",
                ));
            }
            if let (Some(last), Some(first)) = (last_key, leaf.items().first()) {
                if first.key <= last {
                    return Err(TreeError::invariant(id, "keys out of order across leaves"));
                }
            }
            if let Some(item) = leaf.items().last() {
                last_key = Some(item.key);
            }
        }

        Ok(TreeShape {
            depth: walk.depth.unwrap_or(1),
            leaves: walk.leaves.len(),
            items: walk.items,
        })
    }

    /// Verify the subtree at `id` and return its actual maximum key.
    fn verify(&mut self, id: NodeId, depth: usize, walk: &mut Walk) -> Result<Key, TreeError> {
        let width = self.width;
        let children = match self.store.node(id)? {
            Node::Leaf(leaf) => {
                if leaf.len() > width {
                    return Err(TreeError::invariant(id, "leaf exceeds width"));
                }
                if leaf
                    .items()
                    .windows(2)
                    .any(|pair| pair[0].key >= pair[1].key)
                {
                    return Err(TreeError::invariant(id, "leaf items out of order"));
                }
                let actual = leaf.items().last().map_or(0, |item| item.key);
                if leaf.max_key() != actual {
                    return Err(TreeError::invariant(id, "stale leaf max_key"));
                }
                if *walk.depth.get_or_insert(depth) != depth {
                    return Err(TreeError::invariant(id, "leaves at different depths"));
                }
                walk.leaves.push(id);
                walk.items += leaf.len();
                return Ok(actual);
            }
            Node::Internal(internal) => {
                if internal.is_empty() {
                    return Err(TreeError::EmptyInternal(id));
                }
                if internal.len() > width {
                    return Err(TreeError::invariant(id, "internal node exceeds width"));
                }
                let records = internal.children().to_vec();
                if records
                    .windows(2)
                    .any(|pair| pair[0].max_key >= pair[1].max_key)
                {
                    return Err(TreeError::invariant(id, "children out of order"));
                }
                if records.last().map(|child| child.max_key) != Some(internal.max_key()) {
                    return Err(TreeError::invariant(id, "stale internal max_key"));
                }
                records
            }
        };

        let mut max_key = 0;
        for child in children {
            max_key = self.verify(child.id, depth + 1, walk)?;
            if max_key != child.max_key {
                return Err(TreeError::invariant(id, "stale child record"));
            }
        }
        Ok(max_key)
    }
}

#[derive(Default)]
struct Walk {
    depth: Option<usize>,
    leaves: Vec<NodeId>,
    items: usize,
}

/// B+-tree errors.
#[derive(Debug)]
pub enum TreeError {
    /// Pager I/O error.
    Pager(PagerError),
    /// Page codec error.
    Page(PageError),
    /// Node id that is not allocated or was released.
    MissingNode(NodeId),
    /// Node of the wrong kind where a leaf or internal node was required.
    UnexpectedNode { id: NodeId, expected: &'static str },
    /// Internal node without children.
    EmptyInternal(NodeId),
    /// Width too large for the node store.
    WidthTooLarge { width: usize, max: usize },
    /// Width smaller than a node already in the store.
    WidthTooSmall { width: usize, widest: usize },
    /// Value of the wrong size for the node store.
    ValueSize { expected: usize, actual: usize },
    /// No more node ids can be allocated.
    IdsExhausted,
    /// A thread panicked while holding the tree lock.
    Poisoned,
    /// Structural check failed.
    Invariant { node: NodeId, reason: String },
}

impl TreeError {
    fn invariant(node: NodeId, reason: &str) -> Self {
        Self::Invariant {
            node,
            reason: reason.to_owned(),
        }
    }
}

impl std::fmt::Display for TreeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pager(e) => write!(f, "pager error: {e}"),
            Self::Page(e) => write!(f, "page error: {e}"),
            Self::MissingNode(id) => write!(f, "node {id} does not exist"),
            Self::UnexpectedNode { id, expected } => {
                write!(f, "node {id} is not a {expected} node")
            }
            Self::EmptyInternal(id) => write!(f, "internal node {id} has no children"),
            Self::WidthTooLarge { width, max } => {
                write!(f, "width {width} exceeds the store's maximum of {max}")
            }
            Self::WidthTooSmall { width, widest } => {
                write!(f, "width {width} is below a stored node of {widest}")
            }
            Self::ValueSize { expected, actual } => {
                write!(f, "value is {actual} bytes, expected {expected}")
            }
            Self::IdsExhausted => write!(f, "node ids exhausted"),
            Self::Poisoned => write!(f, "tree lock poisoned"),
            Self::Invariant { node, reason } => {
                write!(f, "invariant violated at node {node}: {reason}")
            }
        }
    }
}

impl std::error::Error for TreeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Pager(e) => Some(e),
            Self::Page(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PagerError> for TreeError {
    fn from(e: PagerError) -> Self {
        Self::Pager(e)
    }
}

impl From<PageError> for TreeError {
    fn from(e: PageError) -> Self {
        Self::Page(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PagedStore;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::thread;

    const fn assert_send_sync<T: Send + Sync>() {}
    const _: () = assert_send_sync::<BPTree<MemoryStore<u32>>>();
    const _: () = assert_send_sync::<BPTree<PagedStore>>();

    fn keys_descending<S: NodeStore>(tree: &BPTree<S>) -> Vec<Key> {
        tree.get_all_items()
            .expect("scan")
            .map(|item| item.expect("item").0)
            .collect()
    }

    #[test]
    fn test_width_is_clamped() {
        let tree: BPTree<MemoryStore<u8>> = BPTree::new(1);
        assert_eq!(tree.width().expect("width"), MIN_WIDTH);
    }

    #[test]
    fn test_remove_after_splits() {
        let tree = BPTree::new(4);
        for key in [10, 23, 33, 35, 15, 16, 17, 19] {
            tree.set(key, 1).expect("set");
        }
        assert!(tree.remove(23).expect("remove"));

        assert_eq!(tree.get(10).expect("get"), Some(1));
        assert_eq!(tree.get(15).expect("get"), Some(1));
        assert_eq!(tree.get(20).expect("get"), None);
        assert_eq!(tree.get(23).expect("get"), None);
        assert_eq!(tree.max_key().expect("max key"), 35);
        tree.check_invariants().expect("invariants");
    }

    #[test]
    fn test_single_byte_string_value() {
        let tree = BPTree::new(30);
        tree.set(1, b"test".to_vec()).expect("set");
        assert_eq!(tree.get(1).expect("get"), Some(b"test".to_vec()));
    }

    #[test]
    fn test_minimum_width_insert_and_remove() {
        let tree = BPTree::new(3);
        for key in 1..1000 {
            tree.set(key, "test").expect("set");
        }

        assert_eq!(tree.get(0).expect("get"), None);
        for key in 1..1000 {
            assert_eq!(tree.get(key).expect("get"), Some("test"), "key {key}");
        }
        assert_eq!(tree.get(1000).expect("get"), None);

        let mut removed = Vec::new();
        for key in [1, 2, 999, 1000, 1001] {
            tree.remove(key).expect("remove");
            removed.push(key);
            assert_eq!(tree.get(key).expect("get"), None);
            for other in 1..1000 {
                if !removed.contains(&other) {
                    assert!(tree.get(other).expect("get").is_some(), "key {other}");
                }
            }
        }

        let shape = tree.check_invariants().expect("invariants");
        assert_eq!(shape.items, 996);
    }

    #[test]
    fn test_leaf_chain_links_every_leaf() {
        let tree = BPTree::new(4);
        for key in 1..1000 {
            tree.set(key, 1u8).expect("set");
        }

        let mut inner = tree.lock().expect("lock");
        let first = inner.leaf_for(1).expect("first leaf");
        let mut id = first;
        while let Some(next) = inner.leaf(id).expect("leaf").next {
            id = next;
        }
        let last_key = inner.leaf(id).expect("leaf").items().last().map(|i| i.key);
        assert_eq!(last_key, Some(999));

        let mut id = inner.leaf_for(999).expect("last leaf");
        while let Some(prev) = inner.leaf(id).expect("leaf").prev {
            id = prev;
        }
        assert_eq!(id, first);
        let first_key = inner.leaf(id).expect("leaf").items().first().map(|i| i.key);
        assert_eq!(first_key, Some(1));
    }

    #[test]
    fn test_duplicate_set_is_not_an_update() {
        let tree = BPTree::new(4);
        assert!(!tree.set(7, "a").expect("set"));
        assert!(!tree.set(7, "a").expect("set"));
        assert_eq!(tree.get(7).expect("get"), Some("a"));

        assert!(tree.set(7, "b").expect("set"));
        assert_eq!(tree.get(7).expect("get"), Some("b"));
        assert_eq!(tree.len().expect("len"), 1);
    }

    #[test]
    fn test_try_insert_keeps_existing_value() {
        let tree = BPTree::new(3);
        for key in 1..=10 {
            assert!(tree.try_insert(key, "first").expect("insert"));
        }
        assert!(!tree.try_insert(4, "second").expect("insert"));
        assert_eq!(tree.get(4).expect("get"), Some("first"));
        assert_eq!(tree.len().expect("len"), 10);
    }

    #[test]
    fn test_update_existing_leaves_missing_key_missing() {
        let tree = BPTree::new(3);
        for key in 1..=6 {
            tree.set(key, key).expect("set");
        }
        assert!(tree.update_existing(3, 30).expect("update"));
        assert!(tree.update_existing(6, 6).expect("update"));
        assert_eq!(tree.get(3).expect("get"), Some(30));

        tree.remove(4).expect("remove");
        assert!(!tree.update_existing(4, 40).expect("update"));
        assert!(!tree.update_existing(100, 1).expect("update"));
        assert_eq!(tree.get(4).expect("get"), None);
        assert_eq!(tree.get(100).expect("get"), None);
        assert_eq!(tree.len().expect("len"), 5);
        tree.check_invariants().expect("invariants");
    }

    #[test]
    fn test_concurrent_writers_on_disjoint_ranges() {
        let tree: Arc<BPTree<MemoryStore<u32>>> = Arc::new(BPTree::new(4));
        let writers: Vec<_> = (0..4)
            .map(|writer: Key| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    let base = writer * 1000;
                    for key in base..base + 200 {
                        let value = u32::try_from(key).expect("key fits");
                        tree.set(key, value).expect("set");
                        if key % 2 == 1 {
                            assert!(tree.remove(key).expect("remove"));
                        }
                        let kept = tree.get(key - key % 2).expect("get");
                        assert_eq!(kept, Some(value - value % 2));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer panicked");
        }

        let shape = tree.check_invariants().expect("invariants");
        assert_eq!(shape.items, 400);
        assert_eq!(tree.len().expect("len"), 400);
        for writer in 0..4 {
            let base = writer * 1000;
            let expected = u32::try_from(base + 198).expect("key fits");
            assert_eq!(tree.get(base + 198).expect("get"), Some(expected));
            assert_eq!(tree.get(base + 199).expect("get"), None);
        }
    }

    #[test]
    fn test_remove_missing_key_is_noop() {
        let tree = BPTree::new(3);
        for key in 1..=20 {
            tree.set(key, ()).expect("set");
        }
        let before = tree.get_data().expect("snapshot");
        assert!(!tree.remove(0).expect("remove"));
        assert!(!tree.remove(21).expect("remove"));
        assert!(!tree.remove(100).expect("remove"));
        assert_eq!(tree.get_data().expect("snapshot"), before);
    }

    #[test]
    fn test_scans_in_both_directions() {
        let tree = BPTree::new(3);
        for key in [5, 3, 9, 1, 7, 2, 8, 4, 6] {
            tree.set(key, key * 10).expect("set");
        }

        assert_eq!(keys_descending(&tree), vec![9, 8, 7, 6, 5, 4, 3, 2, 1]);
        let ascending: Vec<(Key, Key)> = tree
            .scan_ascending()
            .expect("scan")
            .collect::<Result<_, _>>()
            .expect("items");
        assert_eq!(ascending.first(), Some(&(1, 10)));
        assert_eq!(ascending.last(), Some(&(9, 90)));
        assert_eq!(ascending.len(), 9);
    }

    #[test]
    fn test_empty_tree() {
        let tree: BPTree<MemoryStore<u8>> = BPTree::new(4);
        assert_eq!(tree.get(1).expect("get"), None);
        assert!(tree.is_empty().expect("is empty"));
        assert_eq!(tree.max_key().expect("max key"), 0);
        assert!(keys_descending(&tree).is_empty());
        assert_eq!(
            tree.get_data().expect("snapshot"),
            Snapshot::Leaf(BTreeMap::new())
        );
    }

    #[test]
    fn test_snapshot_follows_structure() {
        let tree = BPTree::new(3);
        for key in 1..=4 {
            tree.set(key, key).expect("set");
        }

        let expected = Snapshot::Internal(BTreeMap::from([
            (2, Snapshot::Leaf(BTreeMap::from([(1, 1), (2, 2)]))),
            (4, Snapshot::Leaf(BTreeMap::from([(3, 3), (4, 4)]))),
        ]));
        assert_eq!(tree.get_data().expect("snapshot"), expected);

        let json = serde_json::to_string(&expected).expect("json");
        assert_eq!(json, r#"{"2":{"1":1,"2":2},"4":{"3":3,"4":4}}"#);
    }

    #[test]
    fn test_internal_max_key_tracks_new_maximum() {
        let tree = BPTree::new(3);
        for key in 1..=50 {
            tree.set(key, ()).expect("set");
        }
        tree.set(1000, ()).expect("set");

        let Snapshot::Internal(children) = tree.get_data().expect("snapshot") else {
            panic!("expected an internal root");
        };
        assert_eq!(children.keys().last(), Some(&1000));
        assert_eq!(tree.max_key().expect("max key"), 1000);
        tree.check_invariants().expect("invariants");
    }

    #[test]
    fn test_borrow_from_left_sibling() {
        let tree = BPTree::new(4);
        // Leaves [1, 2, 3] [4, 5, 6]
        for key in 1..=6 {
            tree.set(key, ()).expect("set");
        }
        tree.remove(5).expect("remove");
        tree.remove(6).expect("remove");

        let Snapshot::Internal(children) = tree.get_data().expect("snapshot") else {
            panic!("expected an internal root");
        };
        let sizes: Vec<usize> = children
            .values()
            .map(|child| match child {
                Snapshot::Leaf(items) => items.len(),
                Snapshot::Internal(_) => 0,
            })
            .collect();
        assert_eq!(sizes, vec![2, 2]);
        assert_eq!(keys_descending(&tree), vec![4, 3, 2, 1]);
        tree.check_invariants().expect("invariants");
    }

    #[test]
    fn test_merge_leaves_single_child_root() {
        let tree = BPTree::new(3);
        for key in 1..=4 {
            tree.set(key, ()).expect("set");
        }
        // [1, 2] [3, 4] -> [1, 2] [3] merges into the left leaf.
        tree.remove(4).expect("remove");

        // The root is not collapsed: an internal root with one child remains.
        let shape = tree.check_invariants().expect("invariants");
        assert_eq!(shape.depth, 2);
        assert_eq!(shape.leaves, 1);
        assert_eq!(shape.items, 3);
        assert_eq!(keys_descending(&tree), vec![3, 2, 1]);
    }

    #[test]
    fn test_only_child_stays_under_filled() {
        let tree = BPTree::new(3);
        for key in 1..=4 {
            tree.set(key, ()).expect("set");
        }
        tree.remove(4).expect("remove");
        tree.remove(1).expect("remove");
        tree.remove(2).expect("remove");

        // No sibling exists to borrow from or merge with.
        let shape = tree.check_invariants().expect("invariants");
        assert_eq!(shape.depth, 2);
        assert_eq!(shape.items, 1);
        assert_eq!(tree.get(3).expect("get"), Some(()));

        tree.remove(3).expect("remove");
        assert!(tree.is_empty().expect("is empty"));
        for key in 1..=10 {
            tree.set(key, ()).expect("set");
        }
        assert_eq!(tree.check_invariants().expect("invariants").items, 10);
    }

    #[test]
    fn test_random_operations_match_btreemap() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for width in [3, 4, 5, 8] {
            let tree = BPTree::new(width);
            let mut shadow = BTreeMap::new();

            for step in 0..3000 {
                let key = rng.random_range(-50..450);
                if rng.random_bool(0.6) {
                    let value: u16 = rng.random_range(0..4);
                    let updated = tree.set(key, value).expect("set");
                    let previous = shadow.insert(key, value);
                    assert_eq!(updated, previous.is_some_and(|old| old != value));
                } else {
                    let removed = tree.remove(key).expect("remove");
                    assert_eq!(removed, shadow.remove(&key).is_some());
                }
                if step % 50 == 0 {
                    let shape = tree.check_invariants().expect("invariants");
                    assert_eq!(shape.items, shadow.len());
                }
            }

            let expected: Vec<(Key, u16)> = shadow.iter().rev().map(|(k, v)| (*k, *v)).collect();
            let actual: Vec<(Key, u16)> = tree
                .get_all_items()
                .expect("scan")
                .collect::<Result<_, _>>()
                .expect("items");
            assert_eq!(actual, expected, "width {width}");
        }
    }

    #[test]
    fn test_drain_in_random_order() {
        let mut rng = StdRng::seed_from_u64(42);
        let tree = BPTree::new(4);
        let mut keys: Vec<Key> = (0..600).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            tree.set(key, ()).expect("set");
        }

        keys.shuffle(&mut rng);
        for (removed, &key) in keys.iter().enumerate() {
            assert!(tree.remove(key).expect("remove"));
            if removed % 25 == 0 {
                tree.check_invariants().expect("invariants");
            }
        }
        assert!(tree.is_empty().expect("is empty"));
        tree.check_invariants().expect("invariants");
    }
}
