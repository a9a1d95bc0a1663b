//! Read side: a single-chunk cache and the consistency-controlled stream that
//! refills it.
//!
//! Submodules:
//! - `cache`: the one chunk a stream holds between refills
//! - `stream`: `ConsistentReadStream`, refill and token checks
pub mod cache;
pub mod stream;

pub use cache::{Chunk, ChunkCache};
pub use stream::{ConsistentReadStream, ReadCloseHandle};
