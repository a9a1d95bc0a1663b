//! Write side: block planning, the append/flush engine and the streaming writer.
//!
//! Submodules:
//! - `planner`: splits a known-length payload into blocks (no I/O)
//! - `engine`: appends blocks under a `Schedule` and flushes once
//! - `stream`: `CommitStream`, incremental writes committed on close
pub mod engine;
pub mod planner;
pub mod stream;

pub use engine::{CommitReceipt, Schedule, TransferEngine, TransferProgress, TransferSession};
pub use planner::{Block, BlockPlanner};
pub use stream::CommitStream;
