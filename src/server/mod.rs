//! HTTP surface.
//!
//! A thin axum layer: handlers validate input, hand heavy work to the
//! [`Dispatcher`] or a blocking task, and turn library errors into JSON
//! responses.

mod handlers;
pub mod types;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::dispatcher::{Dispatcher, Pipeline, PipelineOptions};
use crate::error::Result;

/// Shared handler state.
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub upload_dir: PathBuf,
    pub processed_dir: PathBuf,
}

impl AppState {
    /// Create the storage directories and start the conversion pool.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created or a worker
    /// thread cannot be spawned.
    pub fn new(options: PipelineOptions, workers: usize, queue_depth: usize) -> Result<Self> {
        std::fs::create_dir_all(&options.upload_dir)?;
        std::fs::create_dir_all(&options.processed_dir)?;
        let upload_dir = options.upload_dir.clone();
        let processed_dir = options.processed_dir.clone();
        let dispatcher = Dispatcher::start(Pipeline::new(options), workers, queue_depth)?;
        Ok(Self {
            dispatcher,
            upload_dir,
            processed_dir,
        })
    }
}

/// All routes, traced.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/upload", post(handlers::upload).layer(DefaultBodyLimit::disable()))
        .route("/upload-local", post(handlers::upload_local))
        .route("/process-local", post(handlers::upload_local))
        .route("/layers", get(handlers::list_layers))
        .route("/layers/:id", delete(handlers::delete_layer))
        .route("/uploads", get(handlers::list_uploads))
        // GET routes also answer HEAD
        .route("/cog/*path", get(handlers::serve_file))
        .route("/tiles/info", get(handlers::tile_info))
        .route("/tiles/:z/:x/:y", get(handlers::tile))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_options(root: &std::path::Path) -> PipelineOptions {
    use crate::raster::RasterOptions;
    use crate::vector::VectorOptions;

    let options = PipelineOptions {
        upload_dir: root.join("uploads"),
        processed_dir: root.join("processed"),
        raster: RasterOptions {
            block_size: 64,
            ..RasterOptions::default()
        },
        vector: VectorOptions {
            tiling_tool: None,
            ..VectorOptions::default()
        },
    };
    std::fs::create_dir_all(&options.upload_dir).unwrap();
    std::fs::create_dir_all(&options.processed_dir).unwrap();
    options
}
