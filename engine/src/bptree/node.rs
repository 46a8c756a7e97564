//! B+-tree node types and the sorted-sequence primitives they maintain.
//!
//! Nodes know nothing about the tree's width or rebalancing policy. They keep
//! their elements sorted and their cached `max_key` equal to the key of the
//! last element (or the zero sentinel when empty).

use crate::bptree::{Key, NodeId};

/// Cached `max_key` of a node with no elements.
const EMPTY_MAX_KEY: Key = 0;

/// A key-value record stored in a leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<V> {
    pub key: Key,
    pub value: V,
}

/// An internal node's reference to a subordinate node.
///
/// `max_key` mirrors the child's own `max_key` and is what descent compares
/// against, so the parent never has to visit a child to route a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Child {
    pub id: NodeId,
    pub max_key: Key,
}

/// An element moved between sibling nodes during rebalancing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<V> {
    Item(Item<V>),
    Child(Child),
}

/// Result of writing a value into a leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was not present.
    Inserted,
    /// The key was present with a different value.
    Updated,
    /// The key was present with an equal value; nothing changed.
    Unchanged,
}

/// A leaf node: sorted, key-unique items plus links to its neighbours.
///
/// `prev`/`next` are non-owning references into the same store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafNode<V> {
    max_key: Key,
    items: Vec<Item<V>>,
    pub prev: Option<NodeId>,
    pub next: Option<NodeId>,
}

impl<V> LeafNode<V> {
    /// Create an empty, unlinked leaf.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_key: EMPTY_MAX_KEY,
            items: Vec::new(),
            prev: None,
            next: None,
        }
    }

    /// Build a leaf from items that are already sorted by key.
    #[must_use]
    pub fn from_items(items: Vec<Item<V>>, prev: Option<NodeId>, next: Option<NodeId>) -> Self {
        let mut leaf = Self {
            max_key: EMPTY_MAX_KEY,
            items,
            prev,
            next,
        };
        leaf.refresh_max_key();
        leaf
    }

    #[must_use]
    pub const fn max_key(&self) -> Key {
        self.max_key
    }

    #[must_use]
    pub fn items(&self) -> &[Item<V>] {
        &self.items
    }

    /// Consume the leaf, returning its items in key order.
    #[must_use]
    pub fn into_items(self) -> Vec<Item<V>> {
        self.items
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Binary search for `key`.
    ///
    /// Returns the index of the key if present, otherwise the index where it
    /// would be inserted, together with whether it was found.
    #[must_use]
    pub fn find_item(&self, key: Key) -> (usize, bool) {
        match self.items.binary_search_by_key(&key, |item| item.key) {
            Ok(idx) => (idx, true),
            Err(idx) => (idx, false),
        }
    }

    /// Look up the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: Key) -> Option<&V> {
        match self.find_item(key) {
            (idx, true) => Some(&self.items[idx].value),
            (_, false) => None,
        }
    }

    /// Remove and return the first item.
    pub fn pop_first_item(&mut self) -> Option<Item<V>> {
        if self.items.is_empty() {
            return None;
        }
        let item = self.items.remove(0);
        self.refresh_max_key();
        Some(item)
    }

    /// Remove and return the last item.
    pub fn pop_last_item(&mut self) -> Option<Item<V>> {
        let item = self.items.pop()?;
        self.refresh_max_key();
        Some(item)
    }

    /// Remove the item stored under `key`, returning its value.
    pub fn delete_item(&mut self, key: Key) -> Option<V> {
        let (idx, found) = self.find_item(key);
        if !found {
            return None;
        }
        let item = self.items.remove(idx);
        self.refresh_max_key();
        Some(item.value)
    }

    /// Insert an item whose key is not yet present, keeping key order.
    ///
    /// An item with an existing key replaces the stored one.
    pub fn add_item(&mut self, item: Item<V>) {
        match self.items.last() {
            None => {
                self.max_key = item.key;
                self.items.push(item);
                return;
            }
            Some(last) if item.key > last.key => {
                self.max_key = item.key;
                self.items.push(item);
                return;
            }
            Some(_) => {}
        }
        if item.key < self.items[0].key {
            self.items.insert(0, item);
            return;
        }
        match self.find_item(item.key) {
            (idx, true) => self.items[idx] = item,
            (idx, false) => self.items.insert(idx, item),
        }
    }

    /// Add every item from `items`.
    pub fn add_items(&mut self, items: impl IntoIterator<Item = Item<V>>) {
        for item in items {
            self.add_item(item);
        }
    }

    /// Move the items from `at` onwards out of this leaf.
    pub fn split_off(&mut self, at: usize) -> Vec<Item<V>> {
        let tail = self.items.split_off(at);
        self.refresh_max_key();
        tail
    }

    fn refresh_max_key(&mut self) {
        self.max_key = self.items.last().map_or(EMPTY_MAX_KEY, |item| item.key);
    }
}

impl<V: PartialEq> LeafNode<V> {
    /// Insert or overwrite the value stored under `key`.
    ///
    /// Writing a value equal to the stored one leaves the leaf untouched.
    pub fn set_value(&mut self, key: Key, value: V) -> SetOutcome {
        let (idx, found) = self.find_item(key);
        if found {
            let slot = &mut self.items[idx].value;
            if *slot == value {
                return SetOutcome::Unchanged;
            }
            *slot = value;
            return SetOutcome::Updated;
        }
        if idx == self.items.len() {
            self.max_key = key;
        }
        self.items.insert(idx, Item { key, value });
        SetOutcome::Inserted
    }
}

impl<V> Default for LeafNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// An internal node: child references sorted by their `max_key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalNode {
    max_key: Key,
    children: Vec<Child>,
}

impl InternalNode {
    /// Create an internal node with no children.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_key: EMPTY_MAX_KEY,
            children: Vec::new(),
        }
    }

    /// Build an internal node from children already sorted by `max_key`.
    #[must_use]
    pub fn from_children(children: Vec<Child>) -> Self {
        let mut node = Self {
            max_key: EMPTY_MAX_KEY,
            children,
        };
        node.refresh_max_key();
        node
    }

    #[must_use]
    pub const fn max_key(&self) -> Key {
        self.max_key
    }

    #[must_use]
    pub fn children(&self) -> &[Child] {
        &self.children
    }

    /// Consume the node, returning its children in order.
    #[must_use]
    pub fn into_children(self) -> Vec<Child> {
        self.children
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Find the first child whose `max_key` is at least `key`.
    ///
    /// Returns `(children.len(), false)` when every child's maximum is smaller.
    #[must_use]
    pub fn find_child(&self, key: Key) -> (usize, bool) {
        let idx = self.children.partition_point(|child| child.max_key < key);
        let found = self
            .children
            .get(idx)
            .is_some_and(|child| child.max_key == key);
        (idx, found)
    }

    /// Index of the child to descend into for `key`.
    ///
    /// Keys above every child's maximum are routed to the last child. Returns
    /// `None` only for a childless node.
    #[must_use]
    pub fn route(&self, key: Key) -> Option<usize> {
        if self.children.is_empty() {
            return None;
        }
        let (idx, _) = self.find_child(key);
        Some(idx.min(self.children.len() - 1))
    }

    /// Position of the child with the given id.
    #[must_use]
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.children.iter().position(|child| child.id == id)
    }

    /// Update the cached maximum of the child at `idx`.
    pub fn set_child_max_key(&mut self, idx: usize, max_key: Key) {
        if let Some(child) = self.children.get_mut(idx) {
            child.max_key = max_key;
        }
        self.refresh_max_key();
    }

    /// Insert a child, keeping `max_key` order.
    pub fn add_child(&mut self, child: Child) {
        match self.children.last() {
            None => {
                self.max_key = child.max_key;
                self.children.push(child);
                return;
            }
            Some(last) if child.max_key > last.max_key => {
                self.max_key = child.max_key;
                self.children.push(child);
                return;
            }
            Some(_) => {}
        }
        if child.max_key < self.children[0].max_key {
            self.children.insert(0, child);
            return;
        }
        let (idx, _) = self.find_child(child.max_key);
        self.children.insert(idx, child);
    }

    /// Add every child from `children`.
    pub fn add_children(&mut self, children: impl IntoIterator<Item = Child>) {
        for child in children {
            self.add_child(child);
        }
    }

    /// Remove the child with the given id.
    pub fn delete_child(&mut self, id: NodeId) -> Option<Child> {
        let idx = self.index_of(id)?;
        let child = self.children.remove(idx);
        self.refresh_max_key();
        Some(child)
    }

    /// Remove and return the first child.
    pub fn pop_first_child(&mut self) -> Option<Child> {
        if self.children.is_empty() {
            return None;
        }
        let child = self.children.remove(0);
        self.refresh_max_key();
        Some(child)
    }

    /// Remove and return the last child.
    pub fn pop_last_child(&mut self) -> Option<Child> {
        let child = self.children.pop()?;
        self.refresh_max_key();
        Some(child)
    }

    /// Move the children from `at` onwards out of this node.
    pub fn split_off(&mut self, at: usize) -> Vec<Child> {
        let tail = self.children.split_off(at);
        self.refresh_max_key();
        tail
    }

    /// Recompute `max_key` from the last child.
    pub fn refresh_max_key(&mut self) {
        self.max_key = self
            .children
            .last()
            .map_or(EMPTY_MAX_KEY, |child| child.max_key);
    }
}

/// A B+-tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<V> {
    Leaf(LeafNode<V>),
    Internal(InternalNode),
}

impl<V> Node<V> {
    /// Create an empty leaf node.
    #[must_use]
    pub const fn empty_leaf() -> Self {
        Self::Leaf(LeafNode::new())
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }

    #[must_use]
    pub const fn max_key(&self) -> Key {
        match self {
            Self::Leaf(leaf) => leaf.max_key(),
            Self::Internal(internal) => internal.max_key(),
        }
    }

    /// Number of items (leaf) or children (internal).
    #[must_use]
    pub const fn len(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.len(),
            Self::Internal(internal) => internal.len(),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn as_leaf(&self) -> Option<&LeafNode<V>> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Internal(_) => None,
        }
    }

    pub const fn as_leaf_mut(&mut self) -> Option<&mut LeafNode<V>> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Internal(_) => None,
        }
    }

    #[must_use]
    pub const fn as_internal(&self) -> Option<&InternalNode> {
        match self {
            Self::Leaf(_) => None,
            Self::Internal(internal) => Some(internal),
        }
    }

    pub const fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match self {
            Self::Leaf(_) => None,
            Self::Internal(internal) => Some(internal),
        }
    }

    /// Remove the first element, whichever kind this node holds.
    pub fn pop_first(&mut self) -> Option<Entry<V>> {
        match self {
            Self::Leaf(leaf) => leaf.pop_first_item().map(Entry::Item),
            Self::Internal(internal) => internal.pop_first_child().map(Entry::Child),
        }
    }

    /// Remove the last element, whichever kind this node holds.
    pub fn pop_last(&mut self) -> Option<Entry<V>> {
        match self {
            Self::Leaf(leaf) => leaf.pop_last_item().map(Entry::Item),
            Self::Internal(internal) => internal.pop_last_child().map(Entry::Child),
        }
    }

    /// Insert an element in order.
    ///
    /// Returns the entry back if its kind does not match this node.
    pub fn add_entry(&mut self, entry: Entry<V>) -> Result<(), Entry<V>> {
        match (self, entry) {
            (Self::Leaf(leaf), Entry::Item(item)) => {
                leaf.add_item(item);
                Ok(())
            }
            (Self::Internal(internal), Entry::Child(child)) => {
                internal.add_child(child);
                Ok(())
            }
            (_, entry) => Err(entry),
        }
    }
}
