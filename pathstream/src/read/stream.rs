//! ConsistentReadStream: sequential reads over chunked range reads.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::cache::{Chunk, ChunkCache};
use crate::config::ReadSettings;
use crate::error::{Operation, Result, ServiceError, StreamError};
use crate::metrics::RequestMetrics;
use crate::service::{FileHandle, PathHandle, SharedService};
use crate::token::{ConsistencyMode, ConsistencyToken};

#[derive(Debug)]
enum State {
    Open,
    Closed,
    /// An I/O or consistency error ended the stream; it is reported again on
    /// every later call.
    Failed(StreamError),
}

/// Closes a read stream from outside the task that is reading it.
#[derive(Debug, Clone)]
pub struct ReadCloseHandle(CancellationToken);

impl ReadCloseHandle {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }
}

pub struct ConsistentReadStream {
    service: SharedService,
    path: PathHandle,
    mode: ConsistencyMode,
    /// Captured once (from the caller or the first refill) and never replaced.
    pinned: Option<ConsistencyToken>,
    chunk_size: u64,
    position: u64,
    range_end: Option<u64>,
    /// Exclusive end as known from the range and the last successful refill.
    end: Option<u64>,
    cache: ChunkCache,
    state: State,
    cancel: CancellationToken,
    metrics: Option<Arc<RequestMetrics>>,
}

impl ConsistentReadStream {
    /// Opens a stream over `file`.
    ///
    /// With [`ConsistencyMode::Etag`] and an explicit token, the token is
    /// checked against the properties `file` was resolved with and a mismatch
    /// fails the open.
    /// Without one, the token is captured by the first range read.
    pub async fn open(
        service: SharedService,
        file: FileHandle,
        settings: ReadSettings,
        metrics: Option<Arc<RequestMetrics>>,
    ) -> Result<Self> {
        if settings.chunk_size == 0 {
            return Err(StreamError::InvalidArgument(
                "chunk size must be at least 1".into(),
            ));
        }
        settings.range.validate()?;
        let FileHandle { path, properties } = file;

        let pinned = match (settings.mode, settings.token) {
            (ConsistencyMode::Etag, Some(token)) => {
                if properties.token.as_ref() != Some(&token) {
                    return Err(StreamError::ConsistencyViolation {
                        path: path.to_string(),
                        expected: token,
                        actual: properties.token,
                    });
                }
                Some(token)
            }
            _ => None,
        };

        debug!(%path, mode = %settings.mode, chunk_size = settings.chunk_size, "open read stream");
        Ok(Self {
            service,
            path,
            mode: settings.mode,
            pinned,
            chunk_size: settings.chunk_size,
            position: settings.range.offset,
            range_end: settings.range.end(),
            end: settings.range.end(),
            cache: ChunkCache::new(),
            state: State::Open,
            cancel: CancellationToken::new(),
            metrics,
        })
    }

    pub fn path(&self) -> &PathHandle {
        &self.path
    }

    /// Offset of the next byte `read` returns.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Unread bytes in the cached chunk, not in the whole path.
    pub fn available(&self) -> u64 {
        self.cache.available() as u64
    }

    pub fn pinned_token(&self) -> Option<&ConsistencyToken> {
        self.pinned.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.state, State::Open) || self.cancel.is_cancelled()
    }

    pub fn close_handle(&self) -> ReadCloseHandle {
        ReadCloseHandle(self.cancel.clone())
    }

    /// Releases the cache. Idempotent; no refill starts afterwards.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.cache.clear();
        if matches!(self.state, State::Open) {
            debug!(path = %self.path, position = self.position, "close read stream");
            self.state = State::Closed;
        }
    }

    fn check_open(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() && matches!(self.state, State::Open) {
            self.cache.clear();
            self.state = State::Closed;
        }
        match &self.state {
            State::Open => Ok(()),
            State::Closed => Err(StreamError::Closed),
            State::Failed(err) => Err(err.clone()),
        }
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        warn!(path = %self.path, position = self.position, error = %err, "read stream failed");
        self.cache.clear();
        if !matches!(err, StreamError::Closed) {
            self.state = State::Failed(err.clone());
        } else {
            self.state = State::Closed;
        }
        err
    }

    /// Copies up to `buf.len()` bytes. `Ok(0)` with a non-empty `buf` is EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.cache.is_empty() && !self.refill_or_fail().await? {
            return Ok(0);
        }
        let n = self.cache.copy_to(buf);
        self.position += n as u64;
        Ok(n)
    }

    /// Returns the unread part of the current chunk, refilling if needed.
    /// `None` is EOF.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.check_open()?;
        if self.cache.is_empty() && !self.refill_or_fail().await? {
            return Ok(None);
        }
        let data = self.cache.take_remaining();
        self.position += data.len() as u64;
        Ok(Some(data))
    }

    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Moves forward by up to `n` bytes without reading them. Skipping never
    /// goes past the known end; the count actually skipped is returned.
    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.check_open()?;
        let mut skipped = self.cache.skip(n);
        self.position += skipped;
        let rest = n - skipped;
        if rest > 0 {
            self.cache.clear();
            let mut target = self.position.saturating_add(rest);
            if let Some(end) = self.end {
                target = target.min(end.max(self.position));
            }
            skipped += target - self.position;
            self.position = target;
        }
        Ok(skipped)
    }

    /// The stream as a sequence of chunks.
    pub fn into_chunks(self) -> impl Stream<Item = Result<Bytes>> + Send {
        futures::stream::try_unfold(self, |mut stream| async move {
            let chunk = stream.next_chunk().await?;
            Ok::<_, StreamError>(chunk.map(|chunk| (chunk, stream)))
        })
    }

    async fn refill_or_fail(&mut self) -> Result<bool> {
        match self.refill().await {
            Ok(filled) => Ok(filled),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Fetches the next chunk. `Ok(false)` means EOF.
    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path, position = self.position))]
    async fn refill(&mut self) -> Result<bool> {
        let want = match self.end {
            Some(end) if self.position >= end => return Ok(false),
            Some(end) => self.chunk_size.min(end - self.position),
            None => self.chunk_size,
        };
        let if_match = match self.mode {
            ConsistencyMode::Etag => self.pinned.clone(),
            ConsistencyMode::None => None,
        };
        if let Some(m) = &self.metrics {
            m.record_range_read();
        }

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(StreamError::Closed),
            r = self.service.range_read(&self.path, self.position, want, if_match.as_ref()) => r,
        };
        if self.cancel.is_cancelled() {
            trace!("stream closed while refilling; result dropped");
            return Err(StreamError::Closed);
        }

        let response = match (response, if_match) {
            (Ok(r), _) => r,
            (Err(ServiceError::PreconditionFailed(_)), Some(expected)) => {
                return Err(StreamError::ConsistencyViolation {
                    path: self.path.to_string(),
                    expected,
                    actual: None,
                });
            }
            (Err(e), _) => {
                return Err(StreamError::from_service(
                    Operation::RangeRead,
                    self.path.as_str(),
                    e,
                ));
            }
        };

        if self.mode == ConsistencyMode::Etag {
            match &self.pinned {
                Some(pinned) if response.token.as_ref() != Some(pinned) => {
                    return Err(StreamError::ConsistencyViolation {
                        path: self.path.to_string(),
                        expected: pinned.clone(),
                        actual: response.token,
                    });
                }
                Some(_) => {}
                None => {
                    debug!(token = ?response.token, "pinned read stream");
                    self.pinned = response.token.clone();
                }
            }
        }

        self.end = Some(match self.range_end {
            Some(range_end) => range_end.min(response.total_length),
            None => response.total_length,
        });

        let mut data = response.data;
        if data.len() as u64 > want {
            data.truncate(want as usize);
        }
        if data.is_empty() {
            return Ok(false);
        }
        if let Some(m) = &self.metrics {
            m.record_bytes_read(data.len() as u64);
        }
        trace!(len = data.len(), "refilled");
        self.cache.fill(Chunk {
            start: self.position,
            data,
            token: response.token,
        });
        Ok(true)
    }
}

impl Drop for ConsistentReadStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
