//! B+-tree used as the clustered index.
//!
//! The same algorithm drives two node stores:
//! - [`MemoryStore`]: an id-indexed arena, the in-memory index
//! - [`PagedStore`](crate::storage::PagedStore): 4KB pages behind a
//!   [`Pager`](crate::storage::Pager), the on-disk index
//!
//! # Structure
//!
//! - Internal nodes: ordered `(child id, child max key)` records
//! - Leaf nodes: ordered `(key, value)` items, doubly linked for scans
//!
//! Every node caches the largest key of its subtree (`max_key`). Descent picks
//! the first child whose `max_key` is at least the search key.
//!
//! # Usage
//!
//! ```
//! use engine::bptree::BPTree;
//!
//! let tree = BPTree::new(4);
//! tree.set(10, "ten").expect("set");
//! tree.set(20, "twenty").expect("set");
//!
//! assert_eq!(tree.get(10).expect("get"), Some("ten"));
//! assert_eq!(tree.get(15).expect("get"), None);
//!
//! let keys: Vec<i64> = tree
//!     .get_all_items()
//!     .expect("scan")
//!     .map(|item| item.map(|(key, _)| key))
//!     .collect::<Result<_, _>>()
//!     .expect("items");
//! assert_eq!(keys, vec![20, 10]);
//! ```

mod node;
mod scan;
mod store;
mod tree;

pub use node::{Child, Entry, InternalNode, Item, LeafNode, Node, SetOutcome};
pub use scan::{Direction, Scan};
pub use store::{MemoryStore, NodeStore};
pub use tree::{BPTree, MIN_WIDTH, Snapshot, TreeError, TreeShape};

/// Index key. Rows are keyed by their integer primary key.
pub type Key = i64;

/// Identifier of a node. For the disk tree this is the page index.
pub type NodeId = u32;
