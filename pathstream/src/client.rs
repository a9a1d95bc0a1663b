//! PathClient: opens read and write streams over a shared path service.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::config::{ClientConfig, ReadOptions, TransferSettings, WriteMode, WriteOptions};
use crate::error::{Operation, Result, ServiceError, StreamError};
use crate::metrics::RequestMetrics;
use crate::read::ConsistentReadStream;
use crate::service::{PathHandle, PathKind, PathProperties, ResolvedPath, SharedService};
use crate::write::{BlockPlanner, CommitReceipt, CommitStream, Schedule, TransferEngine};

/// Async entry point. Cheap to clone; clones share the service and metrics.
#[derive(Clone)]
pub struct PathClient {
    service: SharedService,
    config: ClientConfig,
    /// Overrides the bounded schedule derived from `parallelism`.
    schedule: Option<Schedule>,
    metrics: Option<Arc<RequestMetrics>>,
}

impl PathClient {
    pub fn new(service: SharedService, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            service,
            config,
            schedule: None,
            metrics: None,
        })
    }

    /// Counts requests of every stream opened from now on.
    pub fn with_metrics(mut self, metrics: Arc<RequestMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn service(&self) -> &SharedService {
        &self.service
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<RequestMetrics>> {
        self.metrics.as_ref()
    }

    pub async fn resolve(&self, path: impl Into<PathHandle>) -> Result<ResolvedPath> {
        let path = path.into();
        path.validate()?;
        self.count_properties_request();
        ResolvedPath::resolve(self.service.as_ref(), &path).await
    }

    pub async fn properties(&self, path: impl Into<PathHandle>) -> Result<PathProperties> {
        let path = path.into();
        path.validate()?;
        self.count_properties_request();
        self.service
            .get_properties(&path)
            .await
            .map_err(|e| StreamError::from_service(Operation::GetProperties, path.as_str(), e))
    }

    /// Opens a read stream. Options are validated before the path is
    /// resolved; directories are rejected with `NotAFile`.
    pub async fn open_read(
        &self,
        path: impl Into<PathHandle>,
        options: &ReadOptions,
    ) -> Result<ConsistentReadStream> {
        let settings = self.config.read_settings(options)?;
        let file = self.resolve(path).await?.into_file()?;
        ConsistentReadStream::open(self.service.clone(), file, settings, self.metrics.clone()).await
    }

    pub async fn read_all(&self, path: impl Into<PathHandle>, options: &ReadOptions) -> Result<Bytes> {
        let mut stream = self.open_read(path, options).await?;
        let data = stream.read_to_end().await;
        stream.close();
        data
    }

    pub async fn open_write(
        &self,
        path: impl Into<PathHandle>,
        options: &WriteOptions,
    ) -> Result<CommitStream> {
        let path = path.into();
        path.validate()?;
        let settings = self.config.transfer_settings(options)?;
        let engine = self.engine(&settings)?;
        let start = self.start_offset(&path, settings.mode).await?;
        CommitStream::open(&engine, path, &settings, start)
    }

    /// Uploads a whole buffer: one append if it is small enough, otherwise
    /// planned blocks, then a single flush.
    #[tracing::instrument(level = "debug", skip(self, path, data, options), fields(len = data.len()))]
    pub async fn upload(
        &self,
        path: impl Into<PathHandle>,
        data: Bytes,
        options: &WriteOptions,
    ) -> Result<CommitReceipt> {
        let path = path.into();
        path.validate()?;
        let settings = self.config.transfer_settings(options)?;
        let planner = BlockPlanner::new(
            settings.requested_block_size,
            settings.single_shot_threshold,
            settings.max_append_size,
        )?;
        let blocks = planner.plan(data.len() as u64);
        let engine = self.engine(&settings)?;
        let start = self.start_offset(&path, settings.mode).await?;
        debug!(%path, blocks = blocks.len(), start, "upload");
        engine
            .execute(&path, start, &blocks, data, &settings.flush)
            .await
    }

    fn engine(&self, settings: &TransferSettings) -> Result<TransferEngine> {
        let schedule = match self.schedule {
            Some(schedule) => schedule,
            None => Schedule::bounded(settings.parallelism)?,
        };
        let engine = TransferEngine::new(self.service.clone(), schedule);
        Ok(match &self.metrics {
            Some(metrics) => engine.with_metrics(metrics.clone()),
            None => engine,
        })
    }

    /// Where the first block lands: 0 when overwriting, the committed length
    /// when appending. A missing path appends from 0.
    async fn start_offset(&self, path: &PathHandle, mode: WriteMode) -> Result<u64> {
        if mode == WriteMode::Overwrite {
            return Ok(0);
        }
        self.count_properties_request();
        match self.service.get_properties(path).await {
            Ok(props) if props.kind == PathKind::Directory => {
                Err(StreamError::NotAFile(path.to_string()))
            }
            Ok(props) => Ok(props.length),
            Err(ServiceError::NotFound(_)) => Ok(0),
            Err(e) => Err(StreamError::from_service(
                Operation::GetProperties,
                path.as_str(),
                e,
            )),
        }
    }

    fn count_properties_request(&self) {
        if let Some(m) = &self.metrics {
            m.record_properties_request();
        }
    }
}
