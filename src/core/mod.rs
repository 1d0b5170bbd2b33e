//! Core module: shared building blocks
//!
//! - [`MemoizingCache`]: compute-once map used for parsed signatures and binders

mod cache;

pub use cache::MemoizingCache;
