//! Error taxonomy shared by the pipeline and the serving layer.

use thiserror::Error;

/// Result type used throughout `geoswipe`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while ingesting, normalizing, or serving layers.
///
/// Packaging failures of the tiled-vector companion are not represented here:
/// they downgrade a successful [`crate::dispatcher::ConversionResult`] to one
/// carrying warnings instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected input: bad filename, unsupported format, path traversal, bad tile address.
    #[error("{0}")]
    Validation(String),

    /// Missing asset, layer, or stored file.
    #[error("{0}")]
    NotFound(String),

    /// A byte range that lies outside the stored file.
    #[error("requested range not satisfiable for {size}-byte file")]
    RangeNotSatisfiable { size: u64 },

    /// A normalizer failed; the owning job is aborted.
    #[error("{0}")]
    Conversion(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tiff error: {0}")]
    Tiff(#[from] tiff::TiffError),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion(msg.into())
    }

    /// True for failures that are the client's fault (4xx).
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::RangeNotSatisfiable { .. }
        )
    }

    /// Collapse decode and I/O failures that happened inside a normalizer into
    /// a [`Error::Conversion`], keeping client errors untouched.
    #[must_use]
    pub fn into_conversion(self) -> Self {
        match self {
            Self::Io(e) => Self::Conversion(e.to_string()),
            Self::Tiff(e) => Self::Conversion(format!("raster decode error: {e}")),
            other => other,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Conversion(format!("archive error: {e}"))
    }
}

impl From<geojson::Error> for Error {
    fn from(e: geojson::Error) -> Self {
        Self::Conversion(format!("geojson error: {e}"))
    }
}

impl From<shapefile::Error> for Error {
    fn from(e: shapefile::Error) -> Self {
        Self::Conversion(format!("shapefile error: {e}"))
    }
}
