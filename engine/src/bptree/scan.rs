//! Ordered scans along the leaf chain.

use std::sync::RwLockWriteGuard;

use crate::bptree::tree::{TreeError, TreeInner};
use crate::bptree::{Key, NodeId, NodeStore};

/// Scan order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Smallest key first, following `next` links.
    Ascending,
    /// Largest key first, following `prev` links.
    Descending,
}

/// Cursor over every item of a tree.
///
/// Holds the tree lock until dropped. Yields items lazily, one leaf at a
/// time, and stops after the first error.
pub struct Scan<'a, S: NodeStore> {
    inner: RwLockWriteGuard<'a, TreeInner<S>>,
    direction: Direction,
    /// Current leaf and the number of its items already yielded.
    cursor: Option<(NodeId, usize)>,
}

impl<'a, S: NodeStore> Scan<'a, S> {
    pub(super) fn new(
        mut inner: RwLockWriteGuard<'a, TreeInner<S>>,
        direction: Direction,
    ) -> Result<Self, TreeError> {
        let start = inner.edge_leaf(direction)?;
        Ok(Self {
            inner,
            direction,
            cursor: Some((start, 0)),
        })
    }

    #[must_use]
    pub const fn direction(&self) -> Direction {
        self.direction
    }
}

impl<S: NodeStore> Iterator for Scan<'_, S> {
    type Item = Result<(Key, S::Value), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (id, seen) = self.cursor?;
            let node = match self.inner.store.node(id) {
                Ok(node) => node,
                Err(e) => {
                    self.cursor = None;
                    return Some(Err(e));
                }
            };
            let Some(leaf) = node.as_leaf() else {
                self.cursor = None;
                return Some(Err(TreeError::UnexpectedNode {
                    id,
                    expected: "leaf",
                }));
            };

            let items = leaf.items();
            if seen < items.len() {
                let idx = match self.direction {
                    Direction::Ascending => seen,
                    Direction::Descending => items.len() - 1 - seen,
                };
                let item = &items[idx];
                let pair = (item.key, item.value.clone());
                self.cursor = Some((id, seen + 1));
                return Some(Ok(pair));
            }

            let neighbour = match self.direction {
                Direction::Ascending => leaf.next,
                Direction::Descending => leaf.prev,
            };
            self.cursor = neighbour.map(|next| (next, 0));
        }
    }
}
