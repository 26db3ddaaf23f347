//! Metadata pipeline: descriptive info, thumbnails and frame previews
//!
//! Every persisted step is followed by a `MetadataRefresh` so observers can reload the item
//! while later steps are still running. Thumbnail and frame failures are logged and do not
//! fail the job.
//!
//! The metadata success is written before the previews, so a run ends with
//! [`JobOutcome::Persisted`] and the worker writes nothing further for it.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use super::{JobContext, JobOutcome, Pipeline};
use crate::acquisition::{DownloadPolicy, RemoteSource};
use crate::config::MediaConfig;
use crate::error::Result;
use crate::media::{MediaTool, ProbeInfo};
use crate::storage::JobOutput;
use crate::types::{FailureKind, Frame, JobError, JobKind, MediaItem, MediaType, MetadataResult};

/// Latest offset used for the local thumbnail
const MAX_THUMBNAIL_OFFSET_SECS: f64 = 5.0;

/// Frame previews stop after this offset (24h)
const MAX_PREVIEW_SECS: f64 = 86_400.0;

/// Metadata pipeline over pluggable tools
pub struct MetadataPipeline {
    tool: Arc<dyn MediaTool>,
    source: Arc<dyn RemoteSource>,
    policy: DownloadPolicy,
    http: reqwest::Client,
    config: MediaConfig,
}

impl MetadataPipeline {
    pub fn new(
        tool: Arc<dyn MediaTool>,
        source: Arc<dyn RemoteSource>,
        policy: DownloadPolicy,
        http: reqwest::Client,
        config: MediaConfig,
    ) -> Self {
        Self {
            tool,
            source,
            policy,
            http,
            config,
        }
    }

    async fn local(&self, item: &MediaItem, ctx: &JobContext<'_>) -> Result<JobOutcome> {
        let path = Path::new(&item.uri);
        let probe = match self.tool.probe(path).await {
            Ok(probe) => probe,
            Err(e) => return Ok(JobError::new(FailureKind::Other, e.to_string()).into()),
        };

        let metadata = MetadataResult {
            title: item.title.clone(),
            duration: probe.duration,
            aspect_ratio: probe.aspect_ratio(),
            ..Default::default()
        };
        if !ctx.store.complete(&item.id, &JobOutput::Metadata(metadata))? {
            tracing::info!("{} changed while its metadata was fetched", item.id);
            return Ok(JobOutcome::Persisted);
        }
        ctx.reporter.metadata_refresh();

        if probe.has_video() {
            match self.local_thumbnail(path, &probe).await {
                Ok((full, low_res)) => self.store_thumbnails(item, ctx, &full, &low_res)?,
                Err(e) => tracing::warn!("{} thumbnail failed: {}", item.id, e),
            }

            if item.media_type == MediaType::Video {
                if let Some(duration) = probe.duration {
                    self.extract_frames(item, ctx, path, duration).await?;
                }
            }
        }

        Ok(JobOutcome::Persisted)
    }

    async fn local_thumbnail(&self, path: &Path, probe: &ProbeInfo) -> Result<(Vec<u8>, Vec<u8>)> {
        let at = probe
            .duration
            .map(|d| (d / 10.0).min(MAX_THUMBNAIL_OFFSET_SECS))
            .unwrap_or(0.0);
        let full = self.tool.extract_frame(path, at, None).await?;
        let low_res = self.tool.downscale(&full, self.config.thumbnail_width).await?;
        Ok((full, low_res))
    }

    fn store_thumbnails(
        &self,
        item: &MediaItem,
        ctx: &JobContext<'_>,
        full: &[u8],
        low_res: &[u8],
    ) -> Result<()> {
        if ctx.store.store_thumbnails(&item.id, full, low_res)? {
            ctx.reporter.metadata_refresh();
        }
        Ok(())
    }

    /// Preview frames every `seconds_per_frame`, written in batches
    async fn extract_frames(
        &self,
        item: &MediaItem,
        ctx: &JobContext<'_>,
        path: &Path,
        duration: f64,
    ) -> Result<()> {
        let interval = self.config.seconds_per_frame(duration).max(1);
        let until = duration.min(MAX_PREVIEW_SECS);
        let timestamps: Vec<u32> = (0..)
            .map_while(|n: u32| n.checked_mul(interval))
            .take_while(|ts| f64::from(*ts) < until)
            .collect();
        tracing::info!(
            "{}: extracting {} frames every {}s",
            item.id,
            timestamps.len(),
            interval
        );

        let mut written = 0;
        for batch in timestamps.chunks(self.config.frame_batch_size.max(1)) {
            let mut frames = Vec::with_capacity(batch.len());
            for &timestamp in batch {
                match self
                    .tool
                    .extract_frame(path, f64::from(timestamp), Some(self.config.frame_width))
                    .await
                {
                    Ok(image) => frames.push(Frame { timestamp, image }),
                    Err(e) => tracing::debug!("{} frame at {}s skipped: {}", item.id, timestamp, e),
                }
            }

            if frames.is_empty() {
                continue;
            }
            let inserted = ctx.store.insert_frames(&item.id, &frames)?;
            if inserted == 0 {
                tracing::info!("{} was deleted, stopping frame extraction", item.id);
                return Ok(());
            }
            written += inserted;
        }

        if written > 0 && ctx.store.set_frames_available(&item.id, true, Some(interval))? {
            ctx.reporter.metadata_refresh();
        }
        Ok(())
    }

    async fn remote(&self, item: &MediaItem, ctx: &JobContext<'_>) -> Result<JobOutcome> {
        let source = self.source.as_ref();
        let resource_id = item.uri.as_str();

        let attempted = self
            .policy
            .retry_classified(resource_id, move |_| source.inspect(resource_id))
            .await;
        let info = match attempted.outcome {
            Ok(info) => info,
            Err(error) => return Ok(error.into()),
        };

        let output = JobOutput::Metadata(info.to_metadata(item.force_raw_stream));
        if !ctx.store.complete(&item.id, &output)? {
            tracing::info!("{} changed while its metadata was fetched", item.id);
            return Ok(JobOutcome::Persisted);
        }
        ctx.reporter.metadata_refresh();

        if let Some(url) = info.thumbnail.as_deref() {
            match self.remote_thumbnail(url).await {
                Ok((full, low_res)) => self.store_thumbnails(item, ctx, &full, &low_res)?,
                Err(e) => tracing::warn!("{} thumbnail download failed: {}", item.id, e),
            }
        }

        Ok(JobOutcome::Persisted)
    }

    async fn remote_thumbnail(&self, url: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let full = response.bytes().await?.to_vec();
        let low_res = self.tool.downscale(&full, self.config.thumbnail_width).await?;
        Ok((full, low_res))
    }
}

#[async_trait]
impl Pipeline for MetadataPipeline {
    fn kind(&self) -> JobKind {
        JobKind::Metadata
    }

    async fn execute(&self, item: &MediaItem, ctx: &JobContext<'_>) -> Result<JobOutcome> {
        if item.is_local() {
            self.local(item, ctx).await
        } else {
            self.remote(item, ctx).await
        }
    }
}
