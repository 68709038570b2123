// src/segments/mod.rs

pub mod indexer;
pub mod resolver;

pub use indexer::{MediaProbe, SegmentIndexer};
pub use resolver::resolve;
