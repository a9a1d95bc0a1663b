//! pathstream: sequential stream semantics over a remote path store that only
//! speaks range-read, append and flush.
//!
//! Read side: [`read::ConsistentReadStream`] pulls one chunk at a time through a
//! [`read::ChunkCache`] and pins reads to a [`ConsistencyToken`] when asked to.
//!
//! Write side: [`write::BlockPlanner`] splits payloads into blocks,
//! [`write::TransferEngine`] appends them (serially or with bounded
//! concurrency) and issues one terminal flush, and [`write::CommitStream`]
//! turns incremental writes into block-sized appends.
//!
//! [`PathClient`] is the async entry point; [`blocking::Client`] wraps the same
//! core for callers that block.

pub mod blocking;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod read;
pub mod service;
pub mod token;
pub mod write;

pub use client::PathClient;
pub use config::{ByteRange, ClientConfig, ReadOptions, WriteMode, WriteOptions};
pub use error::{Operation, Result, ServiceError, StreamError};
pub use metrics::{MetricsSnapshot, RequestMetrics};
pub use read::ConsistentReadStream;
pub use service::{
    PathHandle, PathKind, PathProperties, RemotePathService, ResolvedPath, SharedService,
};
pub use token::{ConsistencyMode, ConsistencyToken};
pub use write::{
    Block, BlockPlanner, CommitReceipt, CommitStream, Schedule, TransferEngine, TransferProgress,
};
