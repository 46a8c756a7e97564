//! Node storage behind the tree.
//!
//! The tree only ever addresses nodes by [`NodeId`]. A store owns the nodes
//! and decides where they live; the tree never holds a node reference across
//! two store calls.

use crate::bptree::tree::TreeError;
use crate::bptree::{Key, Node, NodeId};

/// Owner of the tree's nodes.
///
/// `node` takes `&mut self` so that stores backed by a page cache can fault
/// pages in on first access.
pub trait NodeStore {
    /// Value type held in leaf items.
    type Value: Clone + PartialEq;

    /// Id of the current root node.
    fn root(&self) -> NodeId;

    /// Make `id` the root node.
    fn set_root(&mut self, id: NodeId) -> Result<(), TreeError>;

    /// Borrow a live node.
    fn node(&mut self, id: NodeId) -> Result<&Node<Self::Value>, TreeError>;

    /// Mutably borrow a live node. The store treats the node as modified.
    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<Self::Value>, TreeError>;

    /// Store a new node and return its id.
    fn allocate(&mut self, node: Node<Self::Value>) -> Result<NodeId, TreeError>;

    /// Retire a node, returning its contents. The id is never handed out again.
    fn release(&mut self, id: NodeId) -> Result<Node<Self::Value>, TreeError>;

    /// Record that `child` now hangs under `parent`.
    fn adopt(&mut self, _parent: NodeId, _child: NodeId) -> Result<(), TreeError> {
        Ok(())
    }

    /// Largest node width the store can hold, if bounded.
    fn max_width(&self) -> Option<usize> {
        None
    }

    /// Reject entries the store cannot represent.
    fn check_entry(&self, _key: Key, _value: &Self::Value) -> Result<(), TreeError> {
        Ok(())
    }

    /// Called once after every mutating operation.
    fn commit(&mut self) -> Result<(), TreeError> {
        Ok(())
    }

    /// Make committed changes durable.
    fn sync(&mut self) -> Result<(), TreeError> {
        Ok(())
    }
}

/// In-memory node arena.
///
/// Released slots stay empty, so ids grow monotonically for the life of the
/// store. The initial root is an empty leaf with id 0.
#[derive(Debug)]
pub struct MemoryStore<V> {
    nodes: Vec<Option<Node<V>>>,
    root: NodeId,
}

impl<V> MemoryStore<V> {
    /// Create a store holding a single empty root leaf.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::empty_leaf())],
            root: 0,
        }
    }

    /// Number of live nodes.
    #[must_use]
    pub fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.is_some()).count()
    }

    const fn slot(id: NodeId) -> usize {
        id as usize
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + PartialEq> NodeStore for MemoryStore<V> {
    type Value = V;

    fn root(&self) -> NodeId {
        self.root
    }

    fn set_root(&mut self, id: NodeId) -> Result<(), TreeError> {
        self.node(id)?;
        self.root = id;
        Ok(())
    }

    fn node(&mut self, id: NodeId) -> Result<&Node<V>, TreeError> {
        self.nodes
            .get(Self::slot(id))
            .and_then(Option::as_ref)
            .ok_or(TreeError::MissingNode(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<V>, TreeError> {
        self.nodes
            .get_mut(Self::slot(id))
            .and_then(Option::as_mut)
            .ok_or(TreeError::MissingNode(id))
    }

    fn allocate(&mut self, node: Node<V>) -> Result<NodeId, TreeError> {
        let id = NodeId::try_from(self.nodes.len()).map_err(|_| TreeError::IdsExhausted)?;
        self.nodes.push(Some(node));
        Ok(id)
    }

    fn release(&mut self, id: NodeId) -> Result<Node<V>, TreeError> {
        self.nodes
            .get_mut(Self::slot(id))
            .and_then(Option::take)
            .ok_or(TreeError::MissingNode(id))
    }
}
