//! Blocking façade over [`PathClient`].
//!
//! Every call drives the async core to completion on a private
//! current-thread runtime, with appends issued one at a time. Do not call
//! these from inside an async context; use [`PathClient`] there.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::{Builder, Runtime};

use crate::client::PathClient;
use crate::config::{ClientConfig, ReadOptions, WriteOptions};
use crate::error::{Result, StreamError};
use crate::metrics::RequestMetrics;
use crate::read::ConsistentReadStream;
use crate::service::{PathHandle, PathProperties, SharedService};
use crate::token::ConsistencyToken;
use crate::write::{CommitReceipt, CommitStream, Schedule, TransferProgress};

pub struct Client {
    runtime: Arc<Runtime>,
    inner: PathClient,
}

impl Client {
    pub fn new(service: SharedService, config: ClientConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StreamError::Runtime(e.to_string()))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            inner: PathClient::new(service, config)?.with_schedule(Schedule::Serial),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<RequestMetrics>) -> Self {
        self.inner = self.inner.with_metrics(metrics);
        self
    }

    /// The async client sharing this client's service and metrics.
    pub fn inner(&self) -> &PathClient {
        &self.inner
    }

    pub fn properties(&self, path: impl Into<PathHandle>) -> Result<PathProperties> {
        self.runtime.block_on(self.inner.properties(path))
    }

    pub fn open_read(
        &self,
        path: impl Into<PathHandle>,
        options: &ReadOptions,
    ) -> Result<BlockingReadStream> {
        let inner = self.runtime.block_on(self.inner.open_read(path, options))?;
        Ok(BlockingReadStream {
            runtime: self.runtime.clone(),
            inner,
        })
    }

    pub fn open_write(
        &self,
        path: impl Into<PathHandle>,
        options: &WriteOptions,
    ) -> Result<BlockingCommitStream> {
        let inner = self.runtime.block_on(self.inner.open_write(path, options))?;
        Ok(BlockingCommitStream {
            runtime: self.runtime.clone(),
            inner,
        })
    }

    pub fn upload(
        &self,
        path: impl Into<PathHandle>,
        data: impl Into<Bytes>,
        options: &WriteOptions,
    ) -> Result<CommitReceipt> {
        self.runtime
            .block_on(self.inner.upload(path, data.into(), options))
    }

    pub fn read_all(&self, path: impl Into<PathHandle>, options: &ReadOptions) -> Result<Bytes> {
        self.runtime.block_on(self.inner.read_all(path, options))
    }
}

pub struct BlockingReadStream {
    runtime: Arc<Runtime>,
    inner: ConsistentReadStream,
}

impl BlockingReadStream {
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    pub fn available(&self) -> u64 {
        self.inner.available()
    }

    pub fn skip(&mut self, n: u64) -> Result<u64> {
        self.inner.skip(n)
    }

    pub fn pinned_token(&self) -> Option<&ConsistencyToken> {
        self.inner.pinned_token()
    }

    pub fn close(&mut self) {
        self.inner.close();
    }

    /// Like [`io::Read::read`], keeping the stream's own error type.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.runtime.block_on(self.inner.read(buf))
    }
}

impl io::Read for BlockingReadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::from)
    }
}

pub struct BlockingCommitStream {
    runtime: Arc<Runtime>,
    inner: CommitStream,
}

impl BlockingCommitStream {
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    pub fn progress(&self) -> TransferProgress {
        self.inner.progress()
    }

    pub fn close(&mut self) -> Result<CommitReceipt> {
        self.runtime.block_on(self.inner.close())
    }

    pub fn abort(&mut self) {
        self.inner.abort();
    }
}

impl io::Write for BlockingCommitStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.runtime
            .block_on(self.inner.write(buf))
            .map_err(io::Error::from)
    }

    /// Data is committed by `close`, not here.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
