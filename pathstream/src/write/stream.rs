//! CommitStream: buffered writes streamed out block by block.

use bytes::BytesMut;
use tracing::{debug, warn};

use super::engine::{CommitReceipt, TransferEngine, TransferProgress, TransferSession};
use crate::config::TransferSettings;
use crate::error::{Result, StreamError};
use crate::service::{FlushOptions, PathHandle};

/// Write side of a path. Every full block is handed to the engine as soon as
/// it fills; nothing is visible remotely until [`CommitStream::close`].
///
/// Dropping the stream without closing it aborts the transfer.
pub struct CommitStream {
    path: PathHandle,
    session: Option<TransferSession>,
    buffer: BytesMut,
    block_size: usize,
    flush: FlushOptions,
    /// Set once by close, abort or a failed write; returned by every later close.
    outcome: Option<Result<CommitReceipt>>,
}

impl CommitStream {
    pub fn open(
        engine: &TransferEngine,
        path: PathHandle,
        settings: &TransferSettings,
        start_offset: u64,
    ) -> Result<Self> {
        let block_size = usize::try_from(settings.streaming_block_size())
            .map_err(|_| StreamError::InvalidArgument("block size does not fit in memory".into()))?;
        if block_size == 0 {
            return Err(StreamError::InvalidArgument(
                "block size must be at least 1".into(),
            ));
        }
        debug!(%path, block_size, start_offset, schedule = ?engine.schedule(), "open commit stream");
        Ok(Self {
            session: Some(engine.begin(path.clone(), start_offset)),
            path,
            buffer: BytesMut::with_capacity(block_size),
            block_size,
            flush: settings.flush.clone(),
            outcome: None,
        })
    }

    pub fn path(&self) -> &PathHandle {
        &self.path
    }

    /// Absolute offset the next written byte lands at.
    pub fn position(&self) -> u64 {
        self.session
            .as_ref()
            .map_or(0, |s| s.position() + self.buffer.len() as u64)
    }

    pub fn progress(&self) -> TransferProgress {
        self.session
            .as_ref()
            .map(TransferSession::progress)
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    fn check_open(&self) -> Result<()> {
        match &self.outcome {
            None => Ok(()),
            Some(Err(err)) if !matches!(err, StreamError::Closed) => Err(err.clone()),
            Some(_) => Err(StreamError::Closed),
        }
    }

    /// Buffers `buf`, submitting each block that fills up, and returns how
    /// many bytes were taken. That is `buf.len()` unless a block fails after
    /// earlier bytes of `buf` already went out in submitted blocks: then the
    /// count of those bytes is returned and the next call reports the failure.
    pub async fn write(&mut self, mut buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        let written = buf.len();
        let mut accepted = 0;
        let mut buffered = 0;
        while !buf.is_empty() {
            let room = self.block_size - self.buffer.len();
            let n = room.min(buf.len());
            self.buffer.extend_from_slice(&buf[..n]);
            buf = &buf[n..];
            buffered += n;
            if self.buffer.len() == self.block_size {
                if let Err(err) = self.submit_buffered().await {
                    return if accepted > 0 { Ok(accepted) } else { Err(err) };
                }
                accepted += buffered;
                buffered = 0;
            }
        }
        Ok(written)
    }

    pub async fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    async fn submit_buffered(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(StreamError::Closed);
        };
        let block = self.buffer.split().freeze();
        if let Err(err) = session.submit(block).await {
            warn!(path = %self.path, error = %err, "write failed");
            self.session = None;
            self.outcome = Some(Err(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Submits the last partial block and commits. Later calls return the
    /// first call's outcome and do no I/O.
    pub async fn close(&mut self) -> Result<CommitReceipt> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = self.commit().await;
        if let Err(err) = &outcome {
            warn!(path = %self.path, error = %err, "commit failed");
        }
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn commit(&mut self) -> Result<CommitReceipt> {
        let Some(mut session) = self.session.take() else {
            return Err(StreamError::Closed);
        };
        if !self.buffer.is_empty() {
            let tail = self.buffer.split().freeze();
            session.submit(tail).await?;
        }
        session.commit(&self.flush).await
    }

    /// Abandons the transfer. Nothing is flushed; staged data is left to the
    /// service.
    pub fn abort(&mut self) {
        if let Some(session) = self.session.take() {
            session.abort();
        }
        self.buffer.clear();
        if self.outcome.is_none() {
            self.outcome = Some(Err(StreamError::Closed));
        }
    }
}

impl Drop for CommitStream {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            debug!(path = %self.path, "commit stream dropped before close");
            session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::metrics::RequestMetrics;
    use crate::error::ServiceError;
    use crate::service::memory::InMemoryPathService;
    use crate::service::{
        AppendAck, CommitInfo, FlushConditions, PathProperties, RangeReadResponse,
        RemotePathService,
    };
    use crate::token::ConsistencyToken;
    use crate::write::engine::Schedule;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    /// Rejects the append at one offset.
    struct FailingAppend {
        inner: InMemoryPathService,
        fail_at: u64,
    }

    #[async_trait]
    impl RemotePathService for FailingAppend {
        async fn range_read(
            &self,
            path: &PathHandle,
            offset: u64,
            length: u64,
            if_match: Option<&ConsistencyToken>,
        ) -> std::result::Result<RangeReadResponse, ServiceError> {
            self.inner.range_read(path, offset, length, if_match).await
        }

        async fn append(
            &self,
            path: &PathHandle,
            offset: u64,
            data: Bytes,
        ) -> std::result::Result<AppendAck, ServiceError> {
            if offset == self.fail_at {
                return Err(ServiceError::Transport("connection reset".into()));
            }
            self.inner.append(path, offset, data).await
        }

        async fn flush(
            &self,
            path: &PathHandle,
            position: u64,
            options: &FlushOptions,
        ) -> std::result::Result<CommitInfo, ServiceError> {
            self.inner.flush(path, position, options).await
        }

        async fn get_properties(
            &self,
            path: &PathHandle,
        ) -> std::result::Result<PathProperties, ServiceError> {
            self.inner.get_properties(path).await
        }
    }

    fn settings(block_size: u64) -> TransferSettings {
        TransferSettings {
            requested_block_size: Some(block_size),
            ..Default::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    fn engine(svc: &Arc<InMemoryPathService>, metrics: &Arc<RequestMetrics>) -> TransferEngine {
        TransferEngine::new(svc.clone(), Schedule::Serial).with_metrics(metrics.clone())
    }

    #[tokio::test]
    async fn test_blocks_stream_out_before_close() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let mut stream =
            CommitStream::open(&engine(&svc, &metrics), "f".into(), &settings(3 * MIB), 0)
                .unwrap();
        let data = pattern((7 * MIB) as usize);
        for piece in data.chunks(MIB as usize / 2 + 7) {
            stream.write(piece).await.unwrap();
        }
        assert_eq!(metrics.appends(), 2);
        assert_eq!(svc.committed("f"), None);
        assert_eq!(stream.position(), 7 * MIB);

        let receipt = stream.close().await.unwrap();
        assert_eq!(metrics.appends(), 3);
        assert_eq!(metrics.flushes(), 1);
        assert_eq!(receipt.blocks, 3);
        assert_eq!(svc.committed("f").unwrap(), data);
    }

    #[tokio::test]
    async fn test_triple_close_commits_once() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let mut stream =
            CommitStream::open(&engine(&svc, &metrics), "f".into(), &settings(4), 0).unwrap();
        stream.write(b"hello world").await.unwrap();

        let first = stream.close().await.unwrap();
        let props = svc.get_properties(&"f".into()).await.unwrap();
        let second = stream.close().await.unwrap();
        let third = stream.close().await.unwrap();

        assert_eq!(metrics.flushes(), 1);
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(svc.get_properties(&"f".into()).await.unwrap(), props);
        assert!(matches!(stream.write(b"x").await, Err(StreamError::Closed)));
    }

    #[tokio::test]
    async fn test_prevent_overwrite_on_existing_path() {
        let svc = Arc::new(InMemoryPathService::new());
        svc.overwrite("f", "original");
        let metrics = RequestMetrics::new();
        let settings = TransferSettings {
            flush: FlushOptions {
                conditions: Some(FlushConditions {
                    if_none_match_any: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut stream =
            CommitStream::open(&engine(&svc, &metrics), "f".into(), &settings, 0).unwrap();
        stream.write(b"replacement").await.unwrap();
        let err = stream.close().await.unwrap_err();

        assert!(matches!(err, StreamError::PreconditionFailed { .. }));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(svc.committed("f").unwrap(), "original");
        assert_eq!(svc.staged_len("f"), 11);
        assert!(matches!(
            stream.close().await,
            Err(StreamError::PreconditionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_abort_and_drop_never_flush() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let engine = engine(&svc, &metrics);

        let mut aborted = CommitStream::open(&engine, "a".into(), &settings(2), 0).unwrap();
        aborted.write(b"abcde").await.unwrap();
        aborted.abort();
        assert!(matches!(aborted.close().await, Err(StreamError::Closed)));

        {
            let mut dropped = CommitStream::open(&engine, "b".into(), &settings(2), 0).unwrap();
            dropped.write(b"abcde").await.unwrap();
        }

        assert_eq!(metrics.flushes(), 0);
        assert_eq!(svc.committed("a"), None);
        assert_eq!(svc.committed("b"), None);
    }

    #[tokio::test]
    async fn test_empty_stream_commits_empty_path() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let mut stream =
            CommitStream::open(&engine(&svc, &metrics), "empty".into(), &settings(8), 0).unwrap();
        let receipt = stream.close().await.unwrap();
        assert_eq!(receipt.length, 0);
        assert_eq!(metrics.appends(), 0);
        assert_eq!(svc.committed("empty").unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_append_from_existing_length() {
        let svc = Arc::new(InMemoryPathService::new());
        svc.overwrite("log", "line1\n");
        let metrics = RequestMetrics::new();
        let mut stream =
            CommitStream::open(&engine(&svc, &metrics), "log".into(), &settings(4), 6).unwrap();
        stream.write(b"line2\n").await.unwrap();
        let receipt = stream.close().await.unwrap();
        assert_eq!(receipt.length, 12);
        assert_eq!(receipt.bytes_transferred, 6);
        assert_eq!(svc.committed("log").unwrap(), "line1\nline2\n");
    }

    #[tokio::test]
    async fn test_append_to_closed_path_fails_stream() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let engine = engine(&svc, &metrics);
        let mut first = CommitStream::open(
            &engine,
            "f".into(),
            &TransferSettings {
                flush: FlushOptions {
                    close: true,
                    ..Default::default()
                },
                requested_block_size: Some(4),
                ..Default::default()
            },
            0,
        )
        .unwrap();
        first.write(b"done").await.unwrap();
        first.close().await.unwrap();

        let mut second = CommitStream::open(&engine, "f".into(), &settings(2), 4).unwrap();
        let err = second.write(b"more").await.unwrap_err();
        assert!(matches!(err, StreamError::TransportFailure { .. }));
        assert!(matches!(
            second.write(b"x").await,
            Err(StreamError::TransportFailure { .. })
        ));
        assert!(second.close().await.is_err());
        assert_eq!(metrics.flushes(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_blocks_reach_service_before_close() {
        let svc = Arc::new(InMemoryPathService::new());
        let metrics = RequestMetrics::new();
        let engine = TransferEngine::new(svc.clone(), Schedule::bounded(8).unwrap())
            .with_metrics(metrics.clone());
        let mut stream = CommitStream::open(&engine, "f".into(), &settings(4), 0).unwrap();
        stream.write(&[7u8; 20]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(stream.progress().blocks_submitted, 5);
        assert_eq!(svc.staged_len("f"), 20);
        assert_eq!(svc.committed("f"), None);

        let receipt = stream.close().await.unwrap();
        assert_eq!(receipt.blocks, 5);
        assert_eq!(metrics.flushes(), 1);
        assert_eq!(svc.committed("f").unwrap(), vec![7u8; 20]);
    }

    #[tokio::test]
    async fn test_failed_block_reports_bytes_already_sent() {
        let svc = Arc::new(FailingAppend {
            inner: InMemoryPathService::new(),
            fail_at: 4,
        });
        let engine = TransferEngine::new(svc.clone(), Schedule::Serial);
        let mut stream = CommitStream::open(&engine, "f".into(), &settings(2), 0).unwrap();

        assert_eq!(stream.write(b"abcdef").await.unwrap(), 4);
        assert!(matches!(
            stream.write(b"ef").await,
            Err(StreamError::TransportFailure { .. })
        ));
        assert!(stream.close().await.is_err());
        assert_eq!(svc.inner.committed("f"), None);
    }

    #[tokio::test]
    async fn test_failed_first_block_is_an_error() {
        let svc = Arc::new(FailingAppend {
            inner: InMemoryPathService::new(),
            fail_at: 0,
        });
        let engine = TransferEngine::new(svc.clone(), Schedule::Serial);
        let mut stream = CommitStream::open(&engine, "f".into(), &settings(2), 0).unwrap();
        let err = stream.write_all(b"abcd").await.unwrap_err();
        assert!(matches!(err, StreamError::TransportFailure { .. }));
    }
}
