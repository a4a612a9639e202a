//! Conversion dispatch.
//!
//! [`Pipeline`] runs one normalizer for one job synchronously. [`Dispatcher`]
//! owns a fixed pool of OS threads fed by a bounded channel, so the async
//! request side only ever awaits a reply and never does conversion work
//! itself. Callers hold a cloneable handle; there is no global pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::format::{classify, FileKind, LayerKind};
use crate::ingest::UploadedAsset;
use crate::raster::{normalize_raster, RasterOptions};
use crate::vector::{normalize_vector, VectorOptions};

/// URL prefix under which processed files are served.
pub const SERVE_PREFIX: &str = "/cog";

/// One unit of conversion work.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub asset: UploadedAsset,
    /// User-facing filename; drives classification and output naming.
    pub declared_filename: String,
    pub job_id: String,
    /// Keep the input file after a successful conversion.
    pub retain_source: bool,
}

impl ConversionJob {
    /// Job for a freshly ingested asset, reusing its id.
    #[must_use]
    pub fn for_asset(asset: UploadedAsset, retain_source: bool) -> Self {
        Self {
            declared_filename: asset.original_filename.clone(),
            job_id: asset.id.clone(),
            asset,
            retain_source,
        }
    }
}

/// Outcome of a successful job, serialized as the upload response.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    pub success: bool,
    pub id: String,
    /// Stem of the declared filename.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LayerKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmtiles_url: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub primary_output: PathBuf,
    #[serde(skip)]
    pub secondary_output: Option<PathBuf>,
}

/// Directories and normalizer settings shared by every job.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub raster: RasterOptions,
    pub vector: VectorOptions,
}

/// Runs the normalizer matching a job's declared filename.
#[derive(Debug, Clone)]
pub struct Pipeline {
    options: PipelineOptions,
}

impl Pipeline {
    #[must_use]
    pub fn new(options: PipelineOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Convert the job's asset into the processed directory.
    ///
    /// On success the input is deleted unless the job retains it.
    ///
    /// # Errors
    /// [`Error::Validation`] for unsupported formats, [`Error::Conversion`]
    /// when the normalizer fails.
    pub fn process(&self, job: &ConversionJob) -> Result<ConversionResult> {
        let kind = classify(&job.declared_filename);
        let stem = Path::new(&job.declared_filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("layer")
            .to_string();
        let input = &job.asset.stored_path;
        info!(job = %job.job_id, file = %job.declared_filename, kind = kind.label(), "Conversion started");

        let result = match kind {
            FileKind::Raster => {
                let output_name = format!("{stem}_{}.tif", job.job_id);
                let output = self.options.processed_dir.join(&output_name);
                normalize_raster(input, &output, &self.options.raster)?;
                ConversionResult {
                    success: true,
                    id: job.job_id.clone(),
                    name: stem,
                    kind: LayerKind::Raster,
                    url: format!("{SERVE_PREFIX}/{output_name}"),
                    pmtiles_url: None,
                    message: "Raster converted to COG successfully".to_string(),
                    warnings: Vec::new(),
                    primary_output: output,
                    secondary_output: None,
                }
            }
            FileKind::VectorArchive | FileKind::VectorPlain => {
                let output_name = format!("{stem}_{}.geojson", job.job_id);
                let output = self.options.processed_dir.join(&output_name);
                let outcome = normalize_vector(input, &job.declared_filename, &output, &self.options.vector)?;
                let pmtiles_url = outcome
                    .pmtiles
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(|n| format!("{SERVE_PREFIX}/{n}"));
                let mut message = "Vector converted to GeoJSON (EPSG:4326) successfully".to_string();
                if !outcome.warnings.is_empty() {
                    message.push_str(" (vector tiles unavailable)");
                }
                ConversionResult {
                    success: true,
                    id: job.job_id.clone(),
                    name: stem,
                    kind: LayerKind::Vector,
                    url: format!("{SERVE_PREFIX}/{output_name}"),
                    pmtiles_url,
                    message,
                    warnings: outcome.warnings,
                    primary_output: output,
                    secondary_output: outcome.pmtiles,
                }
            }
            FileKind::Unsupported => {
                return Err(Error::validation(format!(
                    "Unsupported file format: {}. Supported: TIF, SHP (as zip), GeoJSON",
                    job.declared_filename
                )));
            }
        };

        if !job.retain_source {
            match std::fs::remove_file(input) {
                Ok(()) => debug!(path = %input.display(), "Removed consumed input"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %input.display(), error = %e, "Could not remove consumed input"),
            }
        }
        info!(job = %job.job_id, url = %result.url, "Conversion finished");
        Ok(result)
    }
}

struct Envelope {
    job: ConversionJob,
    reply: oneshot::Sender<Result<ConversionResult>>,
}

/// Handle to a fixed-size pool of conversion workers.
///
/// Dropping every handle closes the queue; workers finish their current job
/// and exit.
#[derive(Clone)]
pub struct Dispatcher {
    sender: mpsc::Sender<Envelope>,
    workers: usize,
}

impl Dispatcher {
    /// Spawn `workers` threads reading from a queue of `queue_depth` jobs.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn start(pipeline: Pipeline, workers: usize, queue_depth: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Envelope>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let pipeline = Arc::new(pipeline);

        for index in 0..workers {
            let receiver = Arc::clone(&receiver);
            let pipeline = Arc::clone(&pipeline);
            std::thread::Builder::new()
                .name(format!("geoswipe-worker-{index}"))
                .spawn(move || worker_loop(index, &receiver, &pipeline))?;
        }
        info!(workers, queue_depth, "Conversion pool started");
        Ok(Self { sender, workers })
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Queue `job` and wait for its result.
    ///
    /// Waits for queue space when the pool is saturated.
    ///
    /// # Errors
    /// Returns the job's own error, or a conversion error if the pool is gone.
    pub async fn submit(&self, job: ConversionJob) -> Result<ConversionResult> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope { job, reply })
            .await
            .map_err(|_| Error::conversion("conversion pool has shut down"))?;
        response
            .await
            .map_err(|_| Error::conversion("conversion worker dropped the job"))?
    }
}

fn worker_loop(index: usize, receiver: &Mutex<mpsc::Receiver<Envelope>>, pipeline: &Pipeline) {
    loop {
        // the lock is held only while waiting; the job runs unlocked
        let next = receiver.lock().blocking_recv();
        let Some(Envelope { job, reply }) = next else {
            debug!(worker = index, "Conversion queue closed");
            return;
        };

        let job_id = job.job_id.clone();
        let result = catch_unwind(AssertUnwindSafe(|| pipeline.process(&job)))
            .unwrap_or_else(|_| Err(Error::conversion("conversion worker panicked")));
        if let Err(e) = &result {
            error!(worker = index, job = %job_id, error = %e, "Conversion failed");
        }
        if reply.send(result).is_err() {
            debug!(worker = index, job = %job_id, "Requester went away before the result");
        }
    }
}
