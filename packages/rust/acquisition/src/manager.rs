//! Export job submission and polling.

use std::sync::Arc;
use std::time::Duration;

use burnwatch_shared::{ExportJob, PipelineObserver, Result};
use serde::Serialize;
use tracing::instrument;

use crate::catalog::{CatalogImage, ExportSource, ImageryCatalog, MosaicRequest, TileRequest};

/// Terminal jobs out of all tracked jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobProgress {
    pub done: usize,
    pub total: usize,
}

impl JobProgress {
    pub fn is_complete(&self) -> bool {
        self.done == self.total
    }
}

impl std::fmt::Display for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.done, self.total)
    }
}

/// Submits export jobs against an [`ImageryCatalog`] and tracks them to completion.
pub struct JobManager {
    catalog: Arc<dyn ImageryCatalog>,
}

impl JobManager {
    pub fn new(catalog: Arc<dyn ImageryCatalog>) -> Self {
        Self { catalog }
    }

    /// Submit one export per candidate image, least cloudy first, at most
    /// `max_tiles` of them. Jobs are named `<prefix>0000`, `<prefix>0001`, ...
    ///
    /// No candidates means no jobs, not an error.
    #[instrument(skip_all, fields(collection = %request.query.collection, max_tiles = request.max_tiles))]
    pub async fn submit_tiles(&self, request: &TileRequest) -> Result<Vec<ExportJob>> {
        let mut candidates: Vec<CatalogImage> = self.catalog.list_images(&request.query).await?;
        candidates.sort_by(|a, b| a.cloud_cover.total_cmp(&b.cloud_cover));
        candidates.truncate(request.max_tiles);
        tracing::info!(candidates = candidates.len(), "candidate images after filtering");

        if candidates.is_empty() {
            tracing::info!("no images matched the filters, nothing to export");
            return Ok(Vec::new());
        }

        let settings = &request.settings;
        let mut jobs = Vec::with_capacity(candidates.len());
        for (i, image) in candidates.iter().enumerate() {
            let description = format!("{}{i:04}", settings.prefix);
            let export = settings.request(
                ExportSource::Image {
                    id: image.id.clone(),
                },
                &request.query.region,
                description.clone(),
            );
            let job_id = self.catalog.submit_export(&export).await?;
            tracing::debug!(%job_id, %description, image = %image.id, "export submitted");
            jobs.push(ExportJob::submitted(
                job_id,
                description,
                &settings.folder,
                settings.scale_m,
            ));
        }

        tracing::info!(
            jobs = jobs.len(),
            folder = %settings.folder,
            scale_m = settings.scale_m,
            "export jobs submitted"
        );
        Ok(jobs)
    }

    /// Submit a single median composite over every matching image, named
    /// `<prefix>mosaic`. Returns `None` when no image matches.
    #[instrument(skip_all, fields(collection = %request.query.collection))]
    pub async fn submit_mosaic(&self, request: &MosaicRequest) -> Result<Option<ExportJob>> {
        let candidates = self.catalog.list_images(&request.query).await?;
        tracing::info!(candidates = candidates.len(), "images in mosaic");
        if candidates.is_empty() {
            tracing::info!("no images matched the filters, nothing to export");
            return Ok(None);
        }

        let settings = &request.settings;
        let description = format!("{}mosaic", settings.prefix);
        let export = settings.request(
            ExportSource::MedianComposite {
                query: request.query.clone(),
            },
            &request.query.region,
            description.clone(),
        );
        let job_id = self.catalog.submit_export(&export).await?;
        tracing::info!(%job_id, %description, "mosaic export submitted");

        Ok(Some(ExportJob::submitted(
            job_id,
            description,
            &settings.folder,
            settings.scale_m,
        )))
    }

    /// One status pass over every non-terminal job.
    pub async fn poll(&self, jobs: &mut [ExportJob]) -> Result<JobProgress> {
        for job in jobs.iter_mut().filter(|j| !j.is_terminal()) {
            let state = self.catalog.job_state(&job.id).await?;
            if job.observe(state) {
                tracing::debug!(job = %job.description, %state, "job state changed");
            }
        }

        Ok(JobProgress {
            done: jobs.iter().filter(|j| j.is_terminal()).count(),
            total: jobs.len(),
        })
    }

    /// Poll every `interval` until all jobs are terminal.
    ///
    /// There is no timeout; drop the future to stop waiting.
    #[instrument(skip_all, fields(jobs = jobs.len()))]
    pub async fn wait_all(
        &self,
        jobs: &mut [ExportJob],
        interval: Duration,
        observer: &dyn PipelineObserver,
    ) -> Result<JobProgress> {
        loop {
            let progress = self.poll(jobs).await?;
            tracing::info!("export progress: {progress} finished");
            observer.progress(progress.done, progress.total, "export jobs finished");
            if progress.is_complete() {
                return Ok(progress);
            }
            tokio::time::sleep(interval).await;
        }
    }
}
