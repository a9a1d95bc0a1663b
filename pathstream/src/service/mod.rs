//! Remote path service abstraction (range-read / append / flush).
//!
//! Submodules:
//! - `memory`: in-process service used for development and tests
//! - `localfs`: directory-backed service, committed files plus staged appends
//!
//! Streams share one [`SharedService`]; none of them owns or closes it.

pub mod localfs;
pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{Operation, ServiceError, StreamError};
use crate::token::ConsistencyToken;

/// Normalized identifier of a remote path: no leading, trailing or repeated `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathHandle(Arc<str>);

impl PathHandle {
    pub fn new(path: impl AsRef<str>) -> Self {
        let parts: Vec<&str> = path
            .as_ref()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();
        Self(Arc::from(parts.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Rejects `.` and `..` segments.
    pub fn validate(&self) -> Result<(), StreamError> {
        match self.0.split('/').find(|seg| *seg == "." || *seg == "..") {
            Some(seg) => Err(StreamError::InvalidArgument(format!(
                "path {self} contains a '{seg}' segment"
            ))),
            None => Ok(()),
        }
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &PathHandle) -> bool {
        if self.is_root() {
            return !other.is_root();
        }
        other
            .as_str()
            .strip_prefix(self.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl fmt::Display for PathHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

impl From<&str> for PathHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathProperties {
    pub kind: PathKind,
    /// Committed length in bytes (0 for directories).
    pub length: u64,
    pub token: Option<ConsistencyToken>,
    /// Set when the last commit closed the path for further appends.
    pub closed: bool,
}

/// Bytes returned by one range read plus the state they were read under.
#[derive(Debug, Clone)]
pub struct RangeReadResponse {
    pub data: Bytes,
    pub token: Option<ConsistencyToken>,
    /// Committed length of the path at the time of the read.
    pub total_length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    pub offset: u64,
    pub length: u64,
}

/// Conditions checked by the service when a flush commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushConditions {
    pub if_match: Option<ConsistencyToken>,
    /// Fail if the path already has committed content.
    pub if_none_match_any: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushOptions {
    pub close: bool,
    /// Keep appended data beyond the flush position staged instead of dropping it.
    pub retain_uncommitted_data: bool,
    pub conditions: Option<FlushConditions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub length: u64,
    pub token: ConsistencyToken,
}

#[async_trait]
pub trait RemotePathService: Send + Sync {
    /// Reads up to `length` bytes at `offset`. Reads at or past the end return
    /// empty data. Fails with `PreconditionFailed` if `if_match` is given and
    /// does not match the current token.
    async fn range_read(
        &self,
        path: &PathHandle,
        offset: u64,
        length: u64,
        if_match: Option<&ConsistencyToken>,
    ) -> Result<RangeReadResponse, ServiceError>;

    /// Stages `data` at `offset`; nothing becomes visible until a flush.
    async fn append(
        &self,
        path: &PathHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<AppendAck, ServiceError>;

    /// Commits the path at `position`: bytes `[0, position)` are the committed
    /// content afterwards.
    async fn flush(
        &self,
        path: &PathHandle,
        position: u64,
        options: &FlushOptions,
    ) -> Result<CommitInfo, ServiceError>;

    async fn get_properties(&self, path: &PathHandle) -> Result<PathProperties, ServiceError>;
}

pub type SharedService = Arc<dyn RemotePathService>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    pub path: PathHandle,
    pub properties: PathProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryHandle {
    pub path: PathHandle,
}

/// A path resolved once, at the boundary, into what it actually is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPath {
    Directory(DirectoryHandle),
    File(FileHandle),
}

impl ResolvedPath {
    pub async fn resolve(
        service: &dyn RemotePathService,
        path: &PathHandle,
    ) -> Result<Self, StreamError> {
        let properties = service
            .get_properties(path)
            .await
            .map_err(|e| StreamError::from_service(Operation::GetProperties, path.as_str(), e))?;
        Ok(match properties.kind {
            PathKind::Directory => ResolvedPath::Directory(DirectoryHandle { path: path.clone() }),
            PathKind::File => ResolvedPath::File(FileHandle {
                path: path.clone(),
                properties,
            }),
        })
    }

    pub fn path(&self) -> &PathHandle {
        match self {
            ResolvedPath::Directory(dir) => &dir.path,
            ResolvedPath::File(file) => &file.path,
        }
    }

    pub fn into_file(self) -> Result<FileHandle, StreamError> {
        match self {
            ResolvedPath::File(file) => Ok(file),
            ResolvedPath::Directory(dir) => Err(StreamError::NotAFile(dir.path.to_string())),
        }
    }
}

/// Builds the content a flush at `position` commits: committed bytes first,
/// then every staged piece in arrival order on top. Bytes past the committed
/// length must all be staged; the first uncovered offset is returned otherwise.
pub(crate) fn assemble_commit(
    committed: &[u8],
    staged: &[(u64, Bytes)],
    position: u64,
) -> Result<Vec<u8>, u64> {
    let pos = usize::try_from(position).map_err(|_| position)?;
    let mut out = vec![0u8; pos];
    let keep = committed.len().min(pos);
    out[..keep].copy_from_slice(&committed[..keep]);

    let mut covered = Vec::new();
    for (offset, data) in staged {
        let start = usize::try_from(*offset).unwrap_or(usize::MAX).min(pos);
        let end = start.saturating_add(data.len()).min(pos);
        if start >= end {
            continue;
        }
        out[start..end].copy_from_slice(&data[..end - start]);
        if end > keep {
            covered.push((start.max(keep), end));
        }
    }

    covered.sort_unstable();
    let mut cursor = keep;
    for (start, end) in covered {
        if start > cursor {
            return Err(cursor as u64);
        }
        cursor = cursor.max(end);
    }
    if cursor < pos {
        return Err(cursor as u64);
    }
    Ok(out)
}

/// Staged pieces that survive a flush at `position` with retention on.
pub(crate) fn retained_after(staged: &[(u64, Bytes)], position: u64) -> Vec<(u64, Bytes)> {
    staged
        .iter()
        .filter(|(offset, data)| offset + data.len() as u64 > position)
        .map(|(offset, data)| {
            if *offset >= position {
                (*offset, data.clone())
            } else {
                let skip = (position - offset) as usize;
                (position, data.slice(skip..))
            }
        })
        .collect()
}
