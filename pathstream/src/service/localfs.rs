//! Local directory backend: committed content lives at `<root>/<path>`,
//! staged appends and per-path tokens under `<root>/.pathstream/`.
//!
//! A flush assembles committed bytes plus staged pieces into a temp file and
//! renames it over the target, so readers never see a half-written commit.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::fs;
use tracing::{debug, trace};

use super::{
    AppendAck, CommitInfo, FlushOptions, PathHandle, PathKind, PathProperties, RangeReadResponse,
    RemotePathService, assemble_commit, retained_after,
};
use crate::error::ServiceError;
use crate::token::ConsistencyToken;

const INTERNAL_DIR: &str = ".pathstream";

pub struct LocalFsPathService {
    root: PathBuf,
    lock: Mutex<()>,
    seq: AtomicU64,
}

struct PathMeta {
    token: ConsistencyToken,
    closed: bool,
}

impl LocalFsPathService {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            lock: Mutex::new(()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Paths must stay under the root and out of the internal directory.
    fn check_path(path: &PathHandle) -> Result<(), ServiceError> {
        let invalid = |reason: &str| ServiceError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let mut segments = path.as_str().split('/');
        if segments.clone().any(|seg| seg == "." || seg == "..") {
            return Err(invalid("'.' and '..' segments are not allowed"));
        }
        if segments.next() == Some(INTERNAL_DIR) {
            return Err(invalid("reserved for the service's own files"));
        }
        Ok(())
    }

    fn data_path(&self, path: &PathHandle) -> PathBuf {
        self.root.join(path.as_str())
    }

    fn key_for(path: &PathHandle) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_str().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn staging_dir(&self, path: &PathHandle) -> PathBuf {
        self.root
            .join(INTERNAL_DIR)
            .join("staging")
            .join(Self::key_for(path))
    }

    fn meta_path(&self, path: &PathHandle) -> PathBuf {
        self.root
            .join(INTERNAL_DIR)
            .join("meta")
            .join(Self::key_for(path))
    }

    fn not_found_or_io(path: &PathHandle, err: std::io::Error) -> ServiceError {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServiceError::NotFound(path.to_string())
        } else {
            ServiceError::from(err)
        }
    }

    fn directory_conflict(path: &PathHandle) -> ServiceError {
        ServiceError::Conflict {
            path: path.to_string(),
            reason: "path is a directory".into(),
        }
    }

    fn mint_token(&self, content: &[u8]) -> ConsistencyToken {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(content);
        hasher.update(seq.to_le_bytes());
        hasher.update(nanos.to_le_bytes());
        let digest = hex::encode(hasher.finalize());
        ConsistencyToken::new(format!("\"{}\"", &digest[..16]))
    }

    /// Length and mtime of the data file, as recorded next to its token.
    fn stamp(metadata: &std::fs::Metadata) -> Result<String, ServiceError> {
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Ok(format!("{}:{modified}", metadata.len()))
    }

    /// Token recorded by the last flush. A file changed behind the service's
    /// back gets one derived from its length and mtime instead.
    async fn read_meta(
        &self,
        path: &PathHandle,
        metadata: &std::fs::Metadata,
    ) -> Result<PathMeta, ServiceError> {
        let stamp = Self::stamp(metadata)?;
        match fs::read_to_string(self.meta_path(path)).await {
            Ok(raw) => {
                let mut lines = raw.lines();
                let token = lines.next().unwrap_or_default();
                let closed = lines.next() == Some("closed");
                if lines.next() == Some(stamp.as_str()) {
                    return Ok(PathMeta {
                        token: ConsistencyToken::new(token),
                        closed,
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut hasher = Sha256::new();
        hasher.update(stamp.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Ok(PathMeta {
            token: ConsistencyToken::new(format!("\"{}\"", &digest[..16])),
            closed: false,
        })
    }

    async fn write_meta(&self, path: &PathHandle, meta: &PathMeta) -> Result<(), ServiceError> {
        let stamp = Self::stamp(&fs::metadata(self.data_path(path)).await?)?;
        let meta_path = self.meta_path(path);
        if let Some(dir) = meta_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let closed = if meta.closed { "closed" } else { "open" };
        fs::write(meta_path, format!("{}\n{closed}\n{stamp}\n", meta.token)).await?;
        Ok(())
    }

    /// Staged pieces in arrival order. File names are `<seq>-<offset>`.
    async fn load_staged(&self, path: &PathHandle) -> Result<Vec<(u64, Bytes)>, ServiceError> {
        let dir = self.staging_dir(path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut pieces = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some((seq, offset)) = name
                .to_str()
                .and_then(|n| n.split_once('-'))
                .and_then(|(s, o)| Some((s.parse::<u64>().ok()?, o.parse::<u64>().ok()?)))
            else {
                continue;
            };
            let data = fs::read(entry.path()).await?;
            pieces.push((seq, offset, Bytes::from(data)));
        }
        pieces.sort_by_key(|(seq, _, _)| *seq);
        Ok(pieces.into_iter().map(|(_, o, d)| (o, d)).collect())
    }

    async fn stage_piece(
        &self,
        path: &PathHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ServiceError> {
        let dir = self.staging_dir(path);
        fs::create_dir_all(&dir).await?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut f = fs::File::create(dir.join(format!("{seq:020}-{offset}"))).await?;
        f.write_all(data).await?;
        f.flush().await?;
        Ok(())
    }

    async fn is_dir(&self, path: &PathHandle) -> bool {
        fs::metadata(self.data_path(path))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemotePathService for LocalFsPathService {
    async fn range_read(
        &self,
        path: &PathHandle,
        offset: u64,
        length: u64,
        if_match: Option<&ConsistencyToken>,
    ) -> Result<RangeReadResponse, ServiceError> {
        Self::check_path(path)?;
        let _guard = self.lock.lock().await;
        let data_path = self.data_path(path);
        let metadata = fs::metadata(&data_path)
            .await
            .map_err(|e| Self::not_found_or_io(path, e))?;
        if metadata.is_dir() {
            return Err(Self::directory_conflict(path));
        }
        let meta = self.read_meta(path, &metadata).await?;
        if let Some(expected) = if_match {
            if &meta.token != expected {
                return Err(ServiceError::PreconditionFailed(format!(
                    "{path}: if-match {expected} does not hold"
                )));
            }
        }
        let total = metadata.len();
        let start = offset.min(total);
        let take = length.min(total - start);
        let mut buf = vec![0u8; take as usize];
        if take > 0 {
            let mut file = fs::File::open(&data_path).await?;
            file.seek(SeekFrom::Start(start)).await?;
            file.read_exact(&mut buf).await?;
        }
        trace!(%path, offset, take, "local range read");
        Ok(RangeReadResponse {
            data: Bytes::from(buf),
            token: Some(meta.token),
            total_length: total,
        })
    }

    async fn append(
        &self,
        path: &PathHandle,
        offset: u64,
        data: Bytes,
    ) -> Result<AppendAck, ServiceError> {
        Self::check_path(path)?;
        let _guard = self.lock.lock().await;
        if self.is_dir(path).await {
            return Err(Self::directory_conflict(path));
        }
        if let Ok(metadata) = fs::metadata(self.data_path(path)).await {
            if self.read_meta(path, &metadata).await?.closed {
                return Err(ServiceError::Conflict {
                    path: path.to_string(),
                    reason: "path was closed by its last commit".into(),
                });
            }
        }
        self.stage_piece(path, offset, &data).await?;
        Ok(AppendAck {
            offset,
            length: data.len() as u64,
        })
    }

    async fn flush(
        &self,
        path: &PathHandle,
        position: u64,
        options: &FlushOptions,
    ) -> Result<CommitInfo, ServiceError> {
        Self::check_path(path)?;
        let _guard = self.lock.lock().await;
        let data_path = self.data_path(path);
        let existing = match fs::metadata(&data_path).await {
            Ok(m) if m.is_dir() => return Err(Self::directory_conflict(path)),
            Ok(m) => Some(self.read_meta(path, &m).await?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(conditions) = &options.conditions {
            if conditions.if_none_match_any && existing.is_some() {
                return Err(ServiceError::PreconditionFailed(format!(
                    "{path} already exists"
                )));
            }
            if let Some(expected) = &conditions.if_match {
                if existing.as_ref().map(|m| &m.token) != Some(expected) {
                    return Err(ServiceError::PreconditionFailed(format!(
                        "{path}: if-match {expected} does not hold"
                    )));
                }
            }
        }

        let committed = if existing.is_some() {
            fs::read(&data_path).await?
        } else {
            Vec::new()
        };
        let staged = self.load_staged(path).await?;
        let content = assemble_commit(&committed, &staged, position).map_err(|missing| {
            ServiceError::InvalidOffset {
                path: path.to_string(),
                offset: missing,
                reason: format!("no data appended at {missing} for flush position {position}"),
            }
        })?;

        if let Some(dir) = data_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let tmp = self
            .root
            .join(INTERNAL_DIR)
            .join(format!("commit-{}", Self::key_for(path)));
        if let Some(dir) = tmp.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&tmp, &content).await?;
        fs::rename(&tmp, &data_path).await?;

        let staging = self.staging_dir(path);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if options.retain_uncommitted_data {
            for (offset, data) in retained_after(&staged, position) {
                self.stage_piece(path, offset, &data).await?;
            }
        }

        let token = self.mint_token(&content);
        self.write_meta(
            path,
            &PathMeta {
                token: token.clone(),
                closed: options.close,
            },
        )
        .await?;
        debug!(%path, position, %token, "local commit");
        Ok(CommitInfo {
            length: position,
            token,
        })
    }

    async fn get_properties(&self, path: &PathHandle) -> Result<PathProperties, ServiceError> {
        Self::check_path(path)?;
        let _guard = self.lock.lock().await;
        let metadata = fs::metadata(self.data_path(path))
            .await
            .map_err(|e| Self::not_found_or_io(path, e))?;
        if metadata.is_dir() {
            return Ok(PathProperties {
                kind: PathKind::Directory,
                length: 0,
                token: None,
                closed: false,
            });
        }
        let meta = self.read_meta(path, &metadata).await?;
        Ok(PathProperties {
            kind: PathKind::File,
            length: metadata.len(),
            token: Some(meta.token),
            closed: meta.closed,
        })
    }
}
