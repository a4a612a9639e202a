//! Filename-based format classification.
//!
//! Classification looks only at the extension (case-insensitive); file
//! contents are never sniffed.

use serde::Serialize;

/// What the pipeline can do with a file, judged by its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    /// `.tif` / `.tiff`
    Raster,
    /// `.zip`, expected to hold a shapefile triplet
    VectorArchive,
    /// `.shp` / `.geojson` / `.json`
    VectorPlain,
    Unsupported,
}

impl FileKind {
    #[must_use]
    pub fn is_raster(self) -> bool {
        self == Self::Raster
    }

    #[must_use]
    pub fn is_vector(self) -> bool {
        matches!(self, Self::VectorArchive | Self::VectorPlain)
    }

    /// Coarse label used in listings: `raster`, `vector` or `unknown`.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Raster => "raster",
            Self::VectorArchive | Self::VectorPlain => "vector",
            Self::Unsupported => "unknown",
        }
    }
}

/// Kind of a servable layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Raster,
    Vector,
}

impl LayerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raster => "raster",
            Self::Vector => "vector",
        }
    }
}

/// Lowercased extension of `name`, if any.
pub(crate) fn extension(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Classify a filename.
#[must_use]
pub fn classify(name: &str) -> FileKind {
    match extension(name).as_deref() {
        Some("tif" | "tiff") => FileKind::Raster,
        Some("zip") => FileKind::VectorArchive,
        Some("shp" | "geojson" | "json") => FileKind::VectorPlain,
        _ => FileKind::Unsupported,
    }
}
