//! TransferEngine: appends blocks and issues the single terminal flush.
//!
//! One engine serves both calling conventions. [`Schedule::Serial`] awaits
//! every append before the next one starts; [`Schedule::Concurrent`] runs up
//! to N appends as separate tasks. Either way `commit` joins every outstanding
//! append before it flushes, and a failed append ends the session without a
//! flush. Uncommitted data left behind is the service's to collect.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace};

use super::planner::Block;
use crate::error::{Operation, Result, StreamError};
use crate::metrics::RequestMetrics;
use crate::service::{AppendAck, FlushOptions, PathHandle, SharedService};
use crate::token::ConsistencyToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Serial,
    Concurrent(NonZeroUsize),
}

impl Schedule {
    pub fn bounded(max_in_flight: usize) -> Result<Self> {
        NonZeroUsize::new(max_in_flight)
            .map(Schedule::Concurrent)
            .ok_or_else(|| StreamError::InvalidArgument("parallelism must be at least 1".into()))
    }

    pub fn max_in_flight(&self) -> usize {
        match self {
            Schedule::Serial => 1,
            Schedule::Concurrent(n) => n.get(),
        }
    }
}

/// Per-session accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub blocks_submitted: u64,
    pub blocks_completed: u64,
    pub bytes_submitted: u64,
    pub bytes_acknowledged: u64,
}

/// Outcome of a committed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub path: PathHandle,
    /// Committed length of the path.
    pub length: u64,
    /// Bytes this transfer appended.
    pub bytes_transferred: u64,
    pub blocks: u64,
    pub token: ConsistencyToken,
}

#[derive(Clone)]
pub struct TransferEngine {
    service: SharedService,
    schedule: Schedule,
    metrics: Option<Arc<RequestMetrics>>,
}

impl TransferEngine {
    pub fn new(service: SharedService, schedule: Schedule) -> Self {
        Self {
            service,
            schedule,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RequestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Starts a session whose first block lands at `start_offset`.
    pub fn begin(&self, path: PathHandle, start_offset: u64) -> TransferSession {
        TransferSession {
            engine: self.clone(),
            path,
            start_offset,
            next_offset: start_offset,
            permits: match self.schedule {
                Schedule::Serial => None,
                Schedule::Concurrent(n) => Some(Arc::new(Semaphore::new(n.get()))),
            },
            in_flight: JoinSet::new(),
            progress: TransferProgress::default(),
            failure: None,
        }
    }

    /// Appends every block of `data` and commits at `start_offset + data.len()`.
    /// `blocks` must cover `data` exactly, in order.
    #[tracing::instrument(level = "debug", skip(self, blocks, data, flush), fields(len = data.len(), block_count = blocks.len()))]
    pub async fn execute(
        &self,
        path: &PathHandle,
        start_offset: u64,
        blocks: &[Block],
        data: Bytes,
        flush: &FlushOptions,
    ) -> Result<CommitReceipt> {
        let mut expected = 0;
        for block in blocks {
            if block.offset != expected || block.length == 0 || block.end() > data.len() as u64 {
                return Err(StreamError::InvalidArgument(format!(
                    "block {block:?} does not continue the plan at {expected}"
                )));
            }
            expected = block.end();
        }
        if expected != data.len() as u64 {
            return Err(StreamError::InvalidArgument(format!(
                "blocks cover {expected} of {} bytes",
                data.len()
            )));
        }

        let mut session = self.begin(path.clone(), start_offset);
        for block in blocks {
            session.submit(data.slice(block.as_range())).await?;
        }
        session.commit(flush).await
    }
}

async fn append_block(
    service: SharedService,
    path: PathHandle,
    offset: u64,
    data: Bytes,
    metrics: Option<Arc<RequestMetrics>>,
) -> Result<AppendAck> {
    if let Some(m) = &metrics {
        m.record_append();
    }
    trace!(%path, offset, len = data.len(), "append");
    let ack = service
        .append(&path, offset, data)
        .await
        .map_err(|e| StreamError::from_service(Operation::Append, path.as_str(), e))?;
    if let Some(m) = &metrics {
        m.record_bytes_appended(ack.length);
    }
    Ok(ack)
}

fn joined(result: std::result::Result<Result<AppendAck>, JoinError>) -> Result<AppendAck> {
    result.map_err(|e| StreamError::Runtime(format!("append task failed: {e}")))?
}

/// One upload in progress. Dropping it without `commit` aborts the transfer,
/// including appends still running.
pub struct TransferSession {
    engine: TransferEngine,
    path: PathHandle,
    start_offset: u64,
    next_offset: u64,
    /// `None` under a serial schedule.
    permits: Option<Arc<Semaphore>>,
    in_flight: JoinSet<Result<AppendAck>>,
    progress: TransferProgress,
    failure: Option<StreamError>,
}

impl TransferSession {
    pub fn path(&self) -> &PathHandle {
        &self.path
    }

    pub fn progress(&self) -> TransferProgress {
        self.progress
    }

    /// Absolute offset the next block is appended at.
    pub fn position(&self) -> u64 {
        self.next_offset
    }

    /// Appends spawned and not joined yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Appends `data` as the next block. Under a serial schedule this returns
    /// once the service acknowledged it. Under a concurrent one the append is
    /// running as its own task when this returns; it waits only for a free
    /// slot.
    pub async fn submit(&mut self, data: Bytes) -> Result<()> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        self.reap()?;
        if data.is_empty() {
            return Ok(());
        }

        let permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| StreamError::Runtime(e.to_string()))?,
            ),
            None => None,
        };
        // Appends that failed while we waited for a slot end the transfer here.
        self.reap()?;

        let offset = self.next_offset;
        let len = data.len() as u64;
        self.next_offset += len;
        self.progress.blocks_submitted += 1;
        self.progress.bytes_submitted += len;

        let append = append_block(
            self.engine.service.clone(),
            self.path.clone(),
            offset,
            data,
            self.engine.metrics.clone(),
        );
        match permit {
            None => {
                let result = append.await;
                self.acknowledge(result)
            }
            Some(permit) => {
                self.in_flight.spawn(async move {
                    let _permit = permit;
                    append.await
                });
                Ok(())
            }
        }
    }

    /// Collects appends that already finished, without waiting.
    fn reap(&mut self) -> Result<()> {
        while let Some(result) = self.in_flight.try_join_next() {
            self.acknowledge(joined(result))?;
        }
        Ok(())
    }

    fn acknowledge(&mut self, result: Result<AppendAck>) -> Result<()> {
        match result {
            Ok(ack) => {
                self.progress.blocks_completed += 1;
                self.progress.bytes_acknowledged += ack.length;
                Ok(())
            }
            Err(err) => {
                debug!(path = %self.path, in_flight = self.in_flight.len(), error = %err, "append failed; aborting transfer");
                self.in_flight.abort_all();
                self.failure = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Waits for every outstanding append, then flushes exactly once.
    #[tracing::instrument(level = "debug", skip(self, flush), fields(path = %self.path, position = self.next_offset))]
    pub async fn commit(mut self, flush: &FlushOptions) -> Result<CommitReceipt> {
        if let Some(err) = self.failure.take() {
            return Err(err);
        }
        while let Some(result) = self.in_flight.join_next().await {
            self.acknowledge(joined(result))?;
        }
        let expected = self.next_offset - self.start_offset;
        if self.progress.bytes_acknowledged != expected {
            return Err(StreamError::IncompleteTransfer {
                path: self.path.to_string(),
                expected,
                acknowledged: self.progress.bytes_acknowledged,
            });
        }

        if let Some(m) = &self.engine.metrics {
            m.record_flush();
        }
        let info = self
            .engine
            .service
            .flush(&self.path, self.next_offset, flush)
            .await
            .map_err(|e| StreamError::from_service(Operation::Flush, self.path.as_str(), e))?;
        debug!(length = info.length, token = %info.token, blocks = self.progress.blocks_completed, "committed");
        Ok(CommitReceipt {
            path: self.path.clone(),
            length: info.length,
            bytes_transferred: expected,
            blocks: self.progress.blocks_completed,
            token: info.token,
        })
    }

    /// Cancels running appends; nothing is flushed or cleaned up.
    pub fn abort(mut self) {
        self.in_flight.abort_all();
        debug!(path = %self.path, progress = ?self.progress, "transfer aborted");
    }
}
