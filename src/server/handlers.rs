//! Route handlers.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{info, instrument};

use super::types::{
    ApiError, DeleteResponse, HealthResponse, LayersResponse, LocalFileRequest, TileQuery, UploadsResponse,
};
use super::AppState;
use crate::dispatcher::{ConversionJob, ConversionResult, SERVE_PREFIX};
use crate::error::{Error, Result};
use crate::format::{classify, extension, FileKind};
use crate::xyz_tile::{self, RasterInfo, DEFAULT_TILE_SIZE};
use crate::{catalog, ingest, range};

type ApiResult<T> = std::result::Result<T, ApiError>;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "geoswipe",
    })
}

fn ensure_supported(filename: &str) -> Result<()> {
    if classify(filename) == FileKind::Unsupported {
        return Err(Error::validation(format!(
            "Unsupported file format: {filename}. Supported: TIF, SHP (as zip), GeoJSON"
        )));
    }
    Ok(())
}

/// `POST /upload`: stream the `file` field to disk, then convert it.
#[instrument(skip_all)]
pub async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> ApiResult<Json<ConversionResult>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::validation(format!("Invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation("No filename provided"))?;
        let filename = ingest::sanitize_filename(filename)?;
        ensure_supported(&filename)?;

        let asset = ingest::stream_to_disk(Box::pin(field), &state.upload_dir, &filename).await?;
        info!(file = %filename, bytes = asset.byte_size, "Upload received");
        let stored = asset.stored_path.clone();
        return match state.dispatcher.submit(ConversionJob::for_asset(asset, false)).await {
            Ok(result) => Ok(Json(result)),
            Err(e) => {
                // never leave the upload orphaned
                let _ = tokio::fs::remove_file(&stored).await;
                Err(e.into())
            }
        };
    }
    Err(Error::validation("Missing multipart field `file`").into())
}

/// `POST /upload-local`: convert a file already in the upload directory,
/// keeping the source.
#[instrument(skip_all, fields(filename = %request.filename))]
pub async fn upload_local(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LocalFileRequest>,
) -> ApiResult<Json<ConversionResult>> {
    let asset = ingest::locate_existing(&state.upload_dir, &request.filename)?;
    ensure_supported(&asset.original_filename)?;
    let result = state.dispatcher.submit(ConversionJob::for_asset(asset, true)).await?;
    Ok(Json(result))
}

pub async fn list_layers(State(state): State<Arc<AppState>>) -> Json<LayersResponse> {
    Json(LayersResponse {
        layers: catalog::list_layers(&state.processed_dir),
    })
}

pub async fn list_uploads(State(state): State<Arc<AppState>>) -> Json<UploadsResponse> {
    Json(UploadsResponse {
        files: catalog::list_uploads(&state.upload_dir),
    })
}

pub async fn delete_layer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    catalog::delete_layer(&state.processed_dir, &id)?;
    Ok(Json(DeleteResponse {
        success: true,
        message: format!("Layer {id} deleted"),
    }))
}

/// `GET|HEAD /cog/*path` with `Range` support.
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let (plan, body) = range::open(&state.processed_dir, &path, method == Method::HEAD, range_header).await?;

    let mut builder = Response::builder()
        .status(plan.status)
        .header(header::CONTENT_TYPE, plan.content_type)
        .header(header::CONTENT_LENGTH, plan.content_length)
        .header(header::ACCEPT_RANGES, "bytes");
    if let Some(content_range) = &plan.content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }
    let body = body.map_or_else(Body::empty, Body::from_stream);
    builder
        .body(body)
        .map_err(|e| ApiError(Error::conversion(format!("response build failed: {e}"))))
}

/// Map a tile `url` parameter onto a stored raster.
///
/// Accepts `/cog/<file>`, `<file>`, or an absolute URL with either path.
fn raster_path(state: &AppState, url: &str) -> Result<PathBuf> {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.find('/').map_or("", |i| &rest[i..]),
        None => url,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let relative = path
        .strip_prefix(SERVE_PREFIX)
        .unwrap_or(path)
        .trim_start_matches('/');
    range::validate_relative_path(relative)?;
    if !matches!(extension(relative).as_deref(), Some("tif" | "tiff")) {
        return Err(Error::validation(format!("Not a raster layer: {url}")));
    }
    let full = state.processed_dir.join(relative);
    if !full.is_file() {
        return Err(Error::not_found(format!("Raster not found: {url}")));
    }
    Ok(full)
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::conversion(format!("render task failed: {e}")))?
}

/// `GET /tiles/{z}/{x}/{y}?url=`; `y` may carry a `.png` suffix.
#[instrument(skip_all, fields(url = %query.url))]
pub async fn tile(
    State(state): State<Arc<AppState>>,
    Path((z, x, y)): Path<(u32, u32, String)>,
    Query(query): Query<TileQuery>,
) -> ApiResult<Response> {
    let y: u32 = y
        .strip_suffix(".png")
        .unwrap_or(&y)
        .parse()
        .map_err(|_| Error::validation(format!("Invalid tile row: {y}")))?;
    xyz_tile::validate_address(z, x, y)?;
    let path = raster_path(&state, &query.url)?;
    let size = query.tile_size.unwrap_or(DEFAULT_TILE_SIZE);

    let image = blocking(move || xyz_tile::render_tile(&path, z, x, y, size)).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "public, max-age=60"),
        ],
        image.as_bytes().to_vec(),
    )
        .into_response())
}

/// `GET /tiles/info?url=`.
pub async fn tile_info(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TileQuery>,
) -> ApiResult<Json<RasterInfo>> {
    let path = raster_path(&state, &query.url)?;
    let info = blocking(move || xyz_tile::raster_info(&path)).await?;
    Ok(Json(info))
}
