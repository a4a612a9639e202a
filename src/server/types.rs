//! Request and response bodies, and the mapping of errors onto HTTP.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::catalog::{LayerEntry, UploadEntry};
use crate::error::Error;

/// Body of `POST /upload-local`.
#[derive(Debug, Deserialize)]
pub struct LocalFileRequest {
    pub filename: String,
}

/// Query of the tile endpoints.
#[derive(Debug, Deserialize)]
pub struct TileQuery {
    /// Stored raster, as a `/cog/...` URL or a bare filename.
    pub url: String,
    /// Output tile edge in pixels.
    pub tile_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LayersResponse {
    pub layers: Vec<LayerEntry>,
}

#[derive(Debug, Serialize)]
pub struct UploadsResponse {
    pub files: Vec<UploadEntry>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    message: String,
}

/// Library error carried out of a handler.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Error::Conversion(_) | Error::Io(_) | Error::Tiff(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(ErrorBody {
            success: false,
            message: self.0.to_string(),
        });
        match self.0 {
            Error::RangeNotSatisfiable { size } => {
                (status, [(header::CONTENT_RANGE, format!("bytes */{size}"))], body).into_response()
            }
            _ => (status, body).into_response(),
        }
    }
}
