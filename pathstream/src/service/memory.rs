//! In-process path service: committed bytes plus staged appends per path.
//!
//! Behaves like the remote store as far as the streams can observe it:
//! appends are invisible until a flush, every commit mints a new token,
//! conditional reads and commits are enforced. Useful for local development
//! and as the default test backend.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    AppendAck, CommitInfo, FlushOptions, PathHandle, PathKind, PathProperties, RangeReadResponse,
    RemotePathService, assemble_commit, retained_after,
};
use crate::error::ServiceError;
use crate::token::ConsistencyToken;

#[derive(Default)]
struct PathEntry {
    committed: Bytes,
    /// `None` until the first commit; such a path does not exist yet.
    version: Option<u64>,
    staged: Vec<(u64, Bytes)>,
    closed: bool,
}

impl PathEntry {
    fn token(&self) -> Option<ConsistencyToken> {
        self.version.map(token_for)
    }
}

#[derive(Default)]
struct State {
    files: HashMap<PathHandle, PathEntry>,
    dirs: HashSet<PathHandle>,
}

impl State {
    fn is_directory(&self, path: &PathHandle) -> bool {
        path.is_root()
            || self.dirs.contains(path)
            || self.dirs.iter().any(|d| path.is_ancestor_of(d))
            || self
                .files
                .iter()
                .any(|(f, e)| e.version.is_some() && path.is_ancestor_of(f))
    }
}

fn token_for(version: u64) -> ConsistencyToken {
    ConsistencyToken::new(format!("\"0x{version:016X}\""))
}

#[derive(Default)]
pub struct InMemoryPathService {
    state: Mutex<State>,
    next_version: AtomicU64,
}

impl InMemoryPathService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mint_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replaces the committed content of `path` directly, as another writer
    /// would. Staged appends are left alone.
    pub fn overwrite(&self, path: impl AsRef<str>, data: impl Into<Bytes>) -> ConsistencyToken {
        let path = PathHandle::new(path);
        let version = self.mint_version();
        let mut state = self.state();
        let entry = state.files.entry(path).or_default();
        entry.committed = data.into();
        entry.version = Some(version);
        token_for(version)
    }

    pub fn create_directory(&self, path: impl AsRef<str>) {
        self.state().dirs.insert(PathHandle::new(path));
    }

    /// Committed content, if the path exists.
    pub fn committed(&self, path: impl AsRef<str>) -> Option<Bytes> {
        let state = self.state();
        state
            .files
            .get(&PathHandle::new(path))
            .filter(|e| e.version.is_some())
            .map(|e| e.committed.clone())
    }

    /// Total bytes currently staged (appended but not committed) for `path`.
    pub fn staged_len(&self, path: impl AsRef<str>) -> u64 {
        let state = self.state();
        state
            .files
            .get(&PathHandle::new(path))
            .map(|e| e.staged.iter().map(|(_, d)| d.len() as u64).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemotePathService for InMemoryPathService {
    async fn range_read(
        &self,
        path: &PathHandle,
        offset: u64,
        length: u64,
        if_match: Option<&ConsistencyToken>,
    ) -> Result<RangeReadResponse, ServiceError> {
        let state = self.state();
        let Some(entry) = state.files.get(path).filter(|e| e.version.is_some()) else {
            if state.is_directory(path) {
                return Err(ServiceError::Conflict {
                    path: path.to_string(),
                    reason: "path is a directory".into(),
                });
            }
            return Err(ServiceError::NotFound(path.to_string()));
        };
        let token = entry.token();
        if let Some(expected) = if_match {
            if token.as_ref() != Some(expected) {
                return Err(ServiceError::PreconditionFailed(format!(
                    "{path}: if-match {expected} does not hold"
                )));
            }
        }
        let total = entry.committed.len() as u64;
        let start = offset.min(total) as usize;
        let end = offset.saturating_add(length).min(total) as usize;
        Ok(RangeReadResponse {
            data: entry.committed.slice(start..end),
            token,
            total_length: total,
        })
    }

    async fn append(
        &self,
        path: &PathHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<AppendAck, ServiceError> {
        let length = data.len() as u64;
        if offset.checked_add(length).is_none() {
            return Err(ServiceError::InvalidOffset {
                path: path.to_string(),
                offset,
                reason: "append end overflows".into(),
            });
        }
        let mut state = self.state();
        if state.is_directory(path) {
            return Err(ServiceError::Conflict {
                path: path.to_string(),
                reason: "path is a directory".into(),
            });
        }
        let entry = state.files.entry(path.clone()).or_default();
        if entry.closed {
            return Err(ServiceError::Conflict {
                path: path.to_string(),
                reason: "path was closed by its last commit".into(),
            });
        }
        entry.staged.push((offset, data));
        Ok(AppendAck { offset, length })
    }

    async fn flush(
        &self,
        path: &PathHandle,
        position: u64,
        options: &FlushOptions,
    ) -> Result<CommitInfo, ServiceError> {
        let version = self.mint_version();
        let mut state = self.state();
        if state.is_directory(path) {
            return Err(ServiceError::Conflict {
                path: path.to_string(),
                reason: "path is a directory".into(),
            });
        }
        let entry = state.files.entry(path.clone()).or_default();
        if let Some(conditions) = &options.conditions {
            if conditions.if_none_match_any && entry.version.is_some() {
                return Err(ServiceError::PreconditionFailed(format!(
                    "{path} already exists"
                )));
            }
            if let Some(expected) = &conditions.if_match {
                if entry.token().as_ref() != Some(expected) {
                    return Err(ServiceError::PreconditionFailed(format!(
                        "{path}: if-match {expected} does not hold"
                    )));
                }
            }
        }
        let content = assemble_commit(&entry.committed, &entry.staged, position).map_err(
            |missing| ServiceError::InvalidOffset {
                path: path.to_string(),
                offset: missing,
                reason: format!("no data appended at {missing} for flush position {position}"),
            },
        )?;
        entry.staged = if options.retain_uncommitted_data {
            retained_after(&entry.staged, position)
        } else {
            Vec::new()
        };
        entry.committed = Bytes::from(content);
        entry.version = Some(version);
        entry.closed = options.close;
        Ok(CommitInfo {
            length: position,
            token: token_for(version),
        })
    }

    async fn get_properties(&self, path: &PathHandle) -> Result<PathProperties, ServiceError> {
        let state = self.state();
        if let Some(entry) = state.files.get(path).filter(|e| e.version.is_some()) {
            return Ok(PathProperties {
                kind: PathKind::File,
                length: entry.committed.len() as u64,
                token: entry.token(),
                closed: entry.closed,
            });
        }
        if state.is_directory(path) {
            return Ok(PathProperties {
                kind: PathKind::Directory,
                length: 0,
                token: None,
                closed: false,
            });
        }
        Err(ServiceError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::FlushConditions;

    #[tokio::test]
    async fn test_appends_invisible_until_flush() {
        let svc = InMemoryPathService::new();
        let path = PathHandle::new("a/b.txt");
        svc.append(&path, 0, Bytes::from_static(b"hello")).await.unwrap();
        assert!(matches!(
            svc.get_properties(&path).await,
            Err(ServiceError::NotFound(_))
        ));
        let info = svc.flush(&path, 5, &FlushOptions::default()).await.unwrap();
        assert_eq!(info.length, 5);
        let props = svc.get_properties(&path).await.unwrap();
        assert_eq!(props.kind, PathKind::File);
        assert_eq!(props.token, Some(info.token));
        assert_eq!(svc.committed("a/b.txt").unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_parent_is_directory() {
        let svc = InMemoryPathService::new();
        svc.overwrite("a/b.txt", "x");
        let props = svc.get_properties(&PathHandle::new("a")).await.unwrap();
        assert_eq!(props.kind, PathKind::Directory);
        svc.create_directory("empty");
        let props = svc.get_properties(&PathHandle::new("empty")).await.unwrap();
        assert_eq!(props.kind, PathKind::Directory);
    }

    #[tokio::test]
    async fn test_conditional_read() {
        let svc = InMemoryPathService::new();
        let token = svc.overwrite("f", "abc");
        let path = PathHandle::new("f");
        let resp = svc.range_read(&path, 1, 10, Some(&token)).await.unwrap();
        assert_eq!(&resp.data[..], b"bc");
        assert_eq!(resp.total_length, 3);
        svc.overwrite("f", "abd");
        let err = svc.range_read(&path, 0, 1, Some(&token)).await.unwrap_err();
        assert!(matches!(err, ServiceError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_flush_gap_is_rejected() {
        let svc = InMemoryPathService::new();
        let path = PathHandle::new("f");
        svc.append(&path, 2, Bytes::from_static(b"cd")).await.unwrap();
        let err = svc
            .flush(&path, 4, &FlushOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOffset { offset: 0, .. }));
    }

    #[tokio::test]
    async fn test_if_none_match_keeps_staged() {
        let svc = InMemoryPathService::new();
        svc.overwrite("f", "old");
        let path = PathHandle::new("f");
        svc.append(&path, 0, Bytes::from_static(b"new!")).await.unwrap();
        let options = FlushOptions {
            conditions: Some(FlushConditions {
                if_none_match_any: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = svc.flush(&path, 4, &options).await.unwrap_err();
        assert!(matches!(err, ServiceError::PreconditionFailed(_)));
        assert_eq!(svc.committed("f").unwrap(), Bytes::from_static(b"old"));
        assert_eq!(svc.staged_len("f"), 4);
    }

    #[tokio::test]
    async fn test_retain_and_close() {
        let svc = InMemoryPathService::new();
        let path = PathHandle::new("f");
        svc.append(&path, 0, Bytes::from_static(b"abcdef")).await.unwrap();
        let options = FlushOptions {
            close: true,
            retain_uncommitted_data: true,
            conditions: None,
        };
        svc.flush(&path, 4, &options).await.unwrap();
        assert_eq!(svc.committed("f").unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(svc.staged_len("f"), 2);
        assert!(svc.get_properties(&path).await.unwrap().closed);
        let err = svc
            .append(&path, 6, Bytes::from_static(b"g"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict { .. }));
    }
}
