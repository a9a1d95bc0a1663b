//! Client configuration and per-stream options.
//!
//! [`ClientConfig`] holds the defaults a client applies to every stream and can
//! be loaded from YAML. [`ReadOptions`] and [`WriteOptions`] override them for
//! one stream; the client resolves both into [`ReadSettings`] /
//! [`TransferSettings`] after validating them locally, before any I/O.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StreamError};
use crate::service::{FlushConditions, FlushOptions};
use crate::token::{ConsistencyMode, ConsistencyToken};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;

/// Bytes fetched per refill of a read stream.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * MIB;
/// Block size used when a payload has to be split and none was requested.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * MIB;
/// Payloads up to this size go out as a single append.
pub const DEFAULT_SINGLE_SHOT_THRESHOLD: u64 = 100 * MIB;
/// Largest body one append call may carry.
pub const MAX_APPEND_SIZE: u64 = 100 * MIB;
/// Appends kept in flight by a non-blocking transfer.
pub const DEFAULT_PARALLELISM: usize = 8;

/// Client-wide defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub chunk_size: u64,
    /// Explicit block size; `None` lets small payloads go out in one append.
    pub block_size: Option<u64>,
    pub parallelism: usize,
    pub single_shot_threshold: u64,
    pub max_append_size: u64,
    pub consistency: ConsistencyMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: None,
            parallelism: DEFAULT_PARALLELISM,
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            max_append_size: MAX_APPEND_SIZE,
            consistency: ConsistencyMode::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: ClientConfig =
            serde_yaml::from_str(raw).map_err(|e| StreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(StreamError::Config("chunk_size must be at least 1".into()));
        }
        if self.block_size == Some(0) {
            return Err(StreamError::Config("block_size must be at least 1".into()));
        }
        if self.parallelism == 0 {
            return Err(StreamError::Config("parallelism must be at least 1".into()));
        }
        if self.max_append_size == 0 {
            return Err(StreamError::Config(
                "max_append_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolves per-stream read options against the client defaults.
    pub fn read_settings(&self, options: &ReadOptions) -> Result<ReadSettings> {
        let chunk_size = options.chunk_size.unwrap_or(self.chunk_size);
        if chunk_size == 0 {
            return Err(StreamError::InvalidArgument(
                "chunk size must be at least 1".into(),
            ));
        }
        let range = options.range.unwrap_or_default();
        range.validate()?;
        Ok(ReadSettings {
            mode: options.consistency.unwrap_or(self.consistency),
            token: options.token.clone(),
            chunk_size,
            range,
        })
    }

    /// Resolves per-stream write options against the client defaults.
    pub fn transfer_settings(&self, options: &WriteOptions) -> Result<TransferSettings> {
        let requested_block_size = options.block_size.or(self.block_size);
        if requested_block_size == Some(0) {
            return Err(StreamError::InvalidArgument(
                "block size must be at least 1".into(),
            ));
        }
        let parallelism = options.parallelism.unwrap_or(self.parallelism);
        if parallelism == 0 {
            return Err(StreamError::InvalidArgument(
                "parallelism must be at least 1".into(),
            ));
        }
        let conditions = options.prevent_overwrite.then(|| FlushConditions {
            if_none_match_any: true,
            ..Default::default()
        });
        Ok(TransferSettings {
            requested_block_size,
            single_shot_threshold: options
                .single_shot_threshold
                .unwrap_or(self.single_shot_threshold),
            max_append_size: self.max_append_size,
            parallelism,
            mode: options.mode,
            flush: FlushOptions {
                close: options.close,
                retain_uncommitted_data: options.retain_uncommitted_data,
                conditions,
            },
        })
    }
}

/// Sub-range of a path a read stream is limited to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    /// `None` reads to the end of the path.
    pub count: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    pub fn validate(&self) -> Result<()> {
        match self.count {
            Some(0) => Err(StreamError::InvalidRange {
                offset: self.offset,
                count: self.count,
                reason: "count must be at least 1",
            }),
            Some(count) if self.offset.checked_add(count).is_none() => {
                Err(StreamError::InvalidRange {
                    offset: self.offset,
                    count: self.count,
                    reason: "range end overflows",
                })
            }
            _ => Ok(()),
        }
    }

    /// Exclusive end, if bounded.
    pub fn end(&self) -> Option<u64> {
        self.count.map(|count| self.offset.saturating_add(count))
    }
}

/// Options for one read stream. Unset fields fall back to [`ClientConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub consistency: Option<ConsistencyMode>,
    pub token: Option<ConsistencyToken>,
    pub chunk_size: Option<u64>,
    pub range: Option<ByteRange>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consistency(mut self, mode: ConsistencyMode) -> Self {
        self.consistency = Some(mode);
        self
    }

    /// Pins the stream to `token` instead of the version seen on first read.
    pub fn token(mut self, token: impl Into<ConsistencyToken>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size = Some(bytes);
        self
    }

    pub fn range(mut self, offset: u64, count: Option<u64>) -> Self {
        self.range = Some(ByteRange::new(offset, count));
        self
    }
}

/// Where a write stream starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Content replaces the path from offset 0.
    #[default]
    Overwrite,
    /// Content is added after the path's committed length.
    Append,
}

/// Options for one write stream or upload.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub block_size: Option<u64>,
    pub parallelism: Option<usize>,
    pub single_shot_threshold: Option<u64>,
    /// Fail the commit if the path already exists.
    pub prevent_overwrite: bool,
    pub retain_uncommitted_data: bool,
    /// Close the path for further appends on commit.
    pub close: bool,
    pub mode: WriteMode,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_size(mut self, bytes: u64) -> Self {
        self.block_size = Some(bytes);
        self
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = Some(n);
        self
    }

    pub fn single_shot_threshold(mut self, bytes: u64) -> Self {
        self.single_shot_threshold = Some(bytes);
        self
    }

    pub fn prevent_overwrite(mut self, yes: bool) -> Self {
        self.prevent_overwrite = yes;
        self
    }

    pub fn retain_uncommitted_data(mut self, yes: bool) -> Self {
        self.retain_uncommitted_data = yes;
        self
    }

    pub fn close(mut self, yes: bool) -> Self {
        self.close = yes;
        self
    }

    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Validated settings for one read stream.
#[derive(Debug, Clone)]
pub struct ReadSettings {
    pub mode: ConsistencyMode,
    pub token: Option<ConsistencyToken>,
    pub chunk_size: u64,
    pub range: ByteRange,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            mode: ConsistencyMode::default(),
            token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            range: ByteRange::default(),
        }
    }
}

/// Validated settings for one transfer.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub requested_block_size: Option<u64>,
    pub single_shot_threshold: u64,
    pub max_append_size: u64,
    pub parallelism: usize,
    pub mode: WriteMode,
    pub flush: FlushOptions,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            requested_block_size: None,
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            max_append_size: MAX_APPEND_SIZE,
            parallelism: DEFAULT_PARALLELISM,
            mode: WriteMode::default(),
            flush: FlushOptions::default(),
        }
    }
}

impl TransferSettings {
    /// Size of the blocks a streaming write fills before handing them off.
    pub fn streaming_block_size(&self) -> u64 {
        self.requested_block_size
            .unwrap_or(DEFAULT_BLOCK_SIZE)
            .min(self.max_append_size)
    }
}
