//! On-disk page format.
//!
//! Every page holds exactly one tree node and is padded to 4KB.
//!
//! # Layout
//!
//! Header (19 bytes):
//! - `is_non_leaf`, `is_deleted`, `is_root`: 1 byte each (0 or 1)
//! - `id`, `parent`, `child_count`, `child_size`: u32 little-endian each
//!
//! Non-leaf body: `child_count` child records of 8 bytes
//! (`id` u32, `max_key` i32).
//!
//! Leaf body: `prev` u32, `next` u32, then `child_count` cells of
//! `child_size` bytes (`key` i32, then the value bytes).
//!
//! Absent page references (`parent`, `prev`, `next`) are written as
//! [`NO_PAGE`].

use crate::bptree::{Child, InternalNode, Item, Key, LeafNode, Node, NodeId};

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier: the page's index in the file, and the id of the node
/// it holds.
pub type PageId = NodeId;

/// Page id written where there is no page.
pub const NO_PAGE: PageId = u32::MAX;

/// Size of a non-leaf child record.
pub const CHILD_SIZE: usize = 8;

/// Size of the key prefix of a leaf cell.
pub const KEY_SIZE: usize = 4;

/// Size of the leaf `prev`/`next` links.
const LINKS_SIZE: usize = 8;

/// Largest number of children a non-leaf page can hold.
#[must_use]
pub const fn internal_capacity() -> usize {
    (PAGE_SIZE - Header::SIZE) / CHILD_SIZE
}

/// Largest number of cells a leaf page can hold for a given value size.
#[must_use]
pub const fn leaf_capacity(value_size: usize) -> usize {
    (PAGE_SIZE - Header::SIZE - LINKS_SIZE) / (KEY_SIZE + value_size)
}

/// Fixed-size header at the start of every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub is_non_leaf: bool,
    pub is_deleted: bool,
    pub is_root: bool,
    pub id: PageId,
    pub parent: PageId,
    pub child_count: u32,
    pub child_size: u32,
}

impl Header {
    /// Size of the header in bytes.
    pub const SIZE: usize = 19;

    /// Serialize the header to bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = u8::from(self.is_non_leaf);
        buf[1] = u8::from(self.is_deleted);
        buf[2] = u8::from(self.is_root);
        buf[3..7].copy_from_slice(&self.id.to_le_bytes());
        buf[7..11].copy_from_slice(&self.parent.to_le_bytes());
        buf[11..15].copy_from_slice(&self.child_count.to_le_bytes());
        buf[15..19].copy_from_slice(&self.child_size.to_le_bytes());
        buf
    }

    /// Deserialize a header from the start of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, PageError> {
        let mut reader = Reader::new(buf);
        Ok(Self {
            is_non_leaf: reader.flag()?,
            is_deleted: reader.flag()?,
            is_root: reader.flag()?,
            id: reader.u32()?,
            parent: reader.u32()?,
            child_count: reader.u32()?,
            child_size: reader.u32()?,
        })
    }
}

/// A decoded page: one node plus its page-level metadata.
///
/// `child_count` and `child_size` are derived from the node when the page is
/// written, so they are not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub id: PageId,
    pub parent: Option<PageId>,
    pub is_root: bool,
    pub is_deleted: bool,
    pub node: Node<Vec<u8>>,
}

impl Page {
    /// An empty, unlinked leaf page that is not the root.
    #[must_use]
    pub const fn blank(id: PageId) -> Self {
        Self {
            id,
            parent: None,
            is_root: false,
            is_deleted: false,
            node: Node::empty_leaf(),
        }
    }

    /// An empty leaf page marked as the root.
    #[must_use]
    pub const fn root_leaf(id: PageId) -> Self {
        let mut page = Self::blank(id);
        page.is_root = true;
        page
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        self.node.is_leaf()
    }

    /// The header this page is written with.
    pub fn header(&self) -> Result<Header, PageError> {
        let (child_count, child_size) = match &self.node {
            Node::Leaf(leaf) => (leaf.len(), cell_size(leaf)?),
            Node::Internal(internal) => (internal.len(), CHILD_SIZE),
        };
        Ok(Header {
            is_non_leaf: !self.node.is_leaf(),
            is_deleted: self.is_deleted,
            is_root: self.is_root,
            id: self.id,
            parent: self.parent.unwrap_or(NO_PAGE),
            child_count: to_u32(child_count)?,
            child_size: to_u32(child_size)?,
        })
    }

    /// Encode the page into exactly [`PAGE_SIZE`] bytes.
    pub fn marshal(&self) -> Result<Vec<u8>, PageError> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        buf.extend_from_slice(&self.header()?.to_bytes());

        match &self.node {
            Node::Leaf(leaf) => {
                buf.extend_from_slice(&leaf.prev.unwrap_or(NO_PAGE).to_le_bytes());
                buf.extend_from_slice(&leaf.next.unwrap_or(NO_PAGE).to_le_bytes());
                for item in leaf.items() {
                    buf.extend_from_slice(&encode_key(item.key)?);
                    buf.extend_from_slice(&item.value);
                }
            }
            Node::Internal(internal) => {
                for child in internal.children() {
                    buf.extend_from_slice(&child.id.to_le_bytes());
                    buf.extend_from_slice(&encode_key(child.max_key)?);
                }
            }
        }

        if buf.len() > PAGE_SIZE {
            return Err(PageError::Overflow { size: buf.len() });
        }
        buf.resize(PAGE_SIZE, 0);
        Ok(buf)
    }

    /// Decode a page written by [`Page::marshal`].
    pub fn unmarshal(buf: &[u8]) -> Result<Self, PageError> {
        let header = Header::from_bytes(buf)?;
        let mut reader = Reader::new(buf);
        reader.skip(Header::SIZE)?;

        let count = header.child_count as usize;
        let size = header.child_size as usize;

        let node = if header.is_non_leaf {
            if size != CHILD_SIZE {
                return Err(PageError::InvalidChildSize {
                    is_non_leaf: true,
                    size: header.child_size,
                });
            }
            let mut children = Vec::with_capacity(count.min(internal_capacity()));
            for _ in 0..count {
                let id = reader.u32()?;
                let max_key = Key::from(reader.i32()?);
                children.push(Child { id, max_key });
            }
            Node::Internal(InternalNode::from_children(children))
        } else {
            if size < KEY_SIZE {
                return Err(PageError::InvalidChildSize {
                    is_non_leaf: false,
                    size: header.child_size,
                });
            }
            let prev = page_ref(reader.u32()?);
            let next = page_ref(reader.u32()?);
            let mut items = Vec::with_capacity(count.min(leaf_capacity(0)));
            for _ in 0..count {
                let key = Key::from(reader.i32()?);
                let value = reader.bytes(size - KEY_SIZE)?.to_vec();
                items.push(Item { key, value });
            }
            Node::Leaf(LeafNode::from_items(items, prev, next))
        };

        Ok(Self {
            id: header.id,
            parent: page_ref(header.parent),
            is_root: header.is_root,
            is_deleted: header.is_deleted,
            node,
        })
    }
}

/// Cell size shared by every item of the leaf.
fn cell_size(leaf: &LeafNode<Vec<u8>>) -> Result<usize, PageError> {
    let mut values = leaf.items().iter().map(|item| item.value.len());
    let Some(expected) = values.next() else {
        return Ok(KEY_SIZE);
    };
    if let Some(actual) = values.find(|&len| len != expected) {
        return Err(PageError::UnevenCells { expected, actual });
    }
    Ok(KEY_SIZE + expected)
}

fn encode_key(key: Key) -> Result<[u8; KEY_SIZE], PageError> {
    i32::try_from(key)
        .map(i32::to_le_bytes)
        .map_err(|_| PageError::KeyOutOfRange(key))
}

fn to_u32(n: usize) -> Result<u32, PageError> {
    u32::try_from(n).map_err(|_| PageError::Overflow { size: n })
}

const fn page_ref(raw: PageId) -> Option<PageId> {
    if raw == NO_PAGE { None } else { Some(raw) }
}

/// Bounds-checked little-endian reader over a page buffer.
struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], PageError> {
        let end = self
            .offset
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(PageError::Truncated {
                offset: self.offset,
                len,
            })?;
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Ok(bytes)
    }

    fn skip(&mut self, len: usize) -> Result<(), PageError> {
        self.bytes(len).map(|_| ())
    }

    fn flag(&mut self) -> Result<bool, PageError> {
        let offset = self.offset;
        match self.bytes(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(PageError::InvalidFlag { offset, value }),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PageError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, PageError> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Result<i32, PageError> {
        self.array().map(i32::from_le_bytes)
    }
}

/// Errors from encoding or decoding a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageError {
    /// A record runs past the end of the buffer.
    Truncated { offset: usize, len: usize },
    /// A header flag byte other than 0 or 1.
    InvalidFlag { offset: usize, value: u8 },
    /// Record size that cannot hold a record of the page's kind.
    InvalidChildSize { is_non_leaf: bool, size: u32 },
    /// Key that does not fit in the 4-byte on-disk key.
    KeyOutOfRange(Key),
    /// Leaf values of different lengths.
    UnevenCells { expected: usize, actual: usize },
    /// Encoded node larger than a page.
    Overflow { size: usize },
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { offset, len } => {
                write!(f, "truncated page: {len} bytes needed at offset {offset}")
            }
            Self::InvalidFlag { offset, value } => {
                write!(f, "invalid flag 0x{value:02x} at offset {offset}")
            }
            Self::InvalidChildSize { is_non_leaf, size } => {
                let kind = if *is_non_leaf { "non-leaf" } else { "leaf" };
                write!(f, "invalid {kind} record size: {size}")
            }
            Self::KeyOutOfRange(key) => write!(f, "key {key} does not fit in 32 bits"),
            Self::UnevenCells { expected, actual } => {
                write!(
                    f,
                    "leaf values differ in size: {expected} and {actual} bytes"
                )
            }
            Self::Overflow { size } => {
                write!(f, "encoded page is {size} bytes, limit is {PAGE_SIZE}")
            }
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page(id: PageId, keys: impl IntoIterator<Item = Key>, value_size: usize) -> Page {
        let items = keys
            .into_iter()
            .map(|key| Item {
                key,
                value: vec![key.unsigned_abs().to_le_bytes()[0]; value_size],
            })
            .collect();
        Page {
            node: Node::Leaf(LeafNode::from_items(items, Some(3), None)),
            parent: Some(9),
            ..Page::blank(id)
        }
    }

    fn internal_page(id: PageId, count: usize) -> Page {
        let children = (0..count)
            .map(|i| Child {
                id: u32::try_from(i).expect("id") + 100,
                max_key: i64::try_from(i).expect("key") * 10 - 2000,
            })
            .collect();
        Page {
            node: Node::Internal(InternalNode::from_children(children)),
            is_root: true,
            ..Page::blank(id)
        }
    }

    fn roundtrip(page: &Page) -> Page {
        let bytes = page.marshal().expect("marshal");
        assert_eq!(bytes.len(), PAGE_SIZE);
        Page::unmarshal(&bytes).expect("unmarshal")
    }

    #[test]
    fn test_header_layout() {
        let header = Header {
            is_non_leaf: true,
            is_deleted: false,
            is_root: true,
            id: 0x0102_0304,
            parent: NO_PAGE,
            child_count: 2,
            child_size: 8,
        };

        let bytes = header.to_bytes();
        assert_eq!(&bytes[..3], &[1, 0, 1]);
        assert_eq!(&bytes[3..7], &[4, 3, 2, 1]);
        assert_eq!(&bytes[7..11], &[0xFF; 4]);
        assert_eq!(Header::from_bytes(&bytes).expect("parse"), header);
    }

    #[test]
    fn test_empty_leaf_roundtrip() {
        let page = Page::root_leaf(0);
        assert_eq!(roundtrip(&page), page);

        let header = page.header().expect("header");
        assert_eq!(header.child_count, 0);
        assert_eq!(header.child_size as usize, KEY_SIZE);
        assert!(!header.is_non_leaf);
    }

    #[test]
    fn test_full_leaf_roundtrip() {
        let value_size = 12;
        let capacity = leaf_capacity(value_size);
        let keys = (0..capacity).map(|i| Key::try_from(i).expect("key") * 3 - 100);
        let page = leaf_page(5, keys, value_size);
        assert_eq!(page.node.len(), capacity);
        assert_eq!(roundtrip(&page), page);
    }

    #[test]
    fn test_empty_internal_roundtrip() {
        let page = internal_page(2, 0);
        assert_eq!(roundtrip(&page), page);
    }

    #[test]
    fn test_full_internal_roundtrip() {
        let page = internal_page(7, internal_capacity());
        assert_eq!(internal_capacity(), 509);
        let restored = roundtrip(&page);
        assert_eq!(restored, page);
        assert_eq!(restored.node.max_key(), page.node.max_key());
    }

    #[test]
    fn test_deleted_flag_roundtrip() {
        let page = Page {
            is_deleted: true,
            ..leaf_page(4, [1, 2, 3], 1)
        };
        assert_eq!(roundtrip(&page), page);
    }

    #[test]
    fn test_too_many_records_overflow() {
        let page = leaf_page(1, 0..=Key::try_from(leaf_capacity(8)).expect("key"), 8);
        assert!(matches!(page.marshal(), Err(PageError::Overflow { .. })));

        let page = internal_page(1, internal_capacity() + 1);
        assert!(matches!(page.marshal(), Err(PageError::Overflow { .. })));
    }

    #[test]
    fn test_key_out_of_range() {
        let page = leaf_page(1, [i64::from(i32::MAX) + 1], 4);
        assert_eq!(
            page.marshal(),
            Err(PageError::KeyOutOfRange(i64::from(i32::MAX) + 1))
        );
    }

    #[test]
    fn test_uneven_cells() {
        let items = vec![
            Item {
                key: 1,
                value: vec![0; 4],
            },
            Item {
                key: 2,
                value: vec![0; 5],
            },
        ];
        let page = Page {
            node: Node::Leaf(LeafNode::from_items(items, None, None)),
            ..Page::blank(0)
        };
        assert_eq!(
            page.marshal(),
            Err(PageError::UnevenCells {
                expected: 4,
                actual: 5
            })
        );
    }

    #[test]
    fn test_invalid_flag() {
        let mut bytes = Page::blank(0).marshal().expect("marshal");
        bytes[1] = 7;
        assert_eq!(
            Page::unmarshal(&bytes),
            Err(PageError::InvalidFlag {
                offset: 1,
                value: 7
            })
        );
    }

    #[test]
    fn test_truncated_buffer() {
        let bytes = leaf_page(0, [1, 2, 3], 16).marshal().expect("marshal");
        let result = Page::unmarshal(&bytes[..Header::SIZE + 20]);
        assert!(matches!(result, Err(PageError::Truncated { .. })));

        assert!(matches!(
            Header::from_bytes(&bytes[..10]),
            Err(PageError::Truncated { .. })
        ));
    }

    #[test]
    fn test_child_count_past_page_end() {
        let mut bytes = internal_page(0, 3).marshal().expect("marshal");
        bytes[11..15].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            Page::unmarshal(&bytes),
            Err(PageError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_child_size() {
        let mut bytes = internal_page(0, 1).marshal().expect("marshal");
        bytes[15..19].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(
            Page::unmarshal(&bytes),
            Err(PageError::InvalidChildSize {
                is_non_leaf: true,
                size: 4
            })
        );
    }
}
