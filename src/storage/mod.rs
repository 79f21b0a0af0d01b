//! Storage layer: page cache, journaled pager, and the b-tree on top.

pub mod btree;
pub mod pager;
pub mod pcache;
