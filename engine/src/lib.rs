#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]
// Storage core of a small relational engine:
//
//  - bptree: the B+-tree algorithm over a pluggable node store
//  - storage: 4KB page format, page file, and the paged node store
//  - index: clustered (primary key) index used by the table layer
//  - config: environment configuration for the demo binary

pub mod bptree;
pub mod config;
pub mod index;
pub mod storage;
