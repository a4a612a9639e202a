//! Layer discovery by directory scan.
//!
//! The processed directory is the only record of what layers exist; every
//! listing rescans it. A `.pmtiles` file whose GeoJSON sibling exists is
//! reported on that sibling's entry rather than as a layer of its own.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

use crate::dispatcher::SERVE_PREFIX;
use crate::error::{Error, Result};
use crate::format::{classify, extension, LayerKind};

/// A servable layer as listed to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerEntry {
    /// Filename stem.
    pub id: String,
    /// Filename.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: LayerKind,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pmtiles_url: Option<String>,
}

/// A file waiting in incoming storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadEntry {
    pub filename: String,
    /// Size in MiB, two decimals.
    pub size_mb: f64,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// Regular files directly inside `dir`, name-ordered, skipping hidden and
/// in-progress temporary files.
fn files(dir: &Path) -> impl Iterator<Item = (PathBuf, String)> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e: DirEntry| {
            let name = e.file_name().to_str()?.to_string();
            (!name.starts_with('.')).then(|| (e.into_path(), name))
        })
}

fn stem(name: &str) -> &str {
    Path::new(name).file_stem().and_then(|s| s.to_str()).unwrap_or(name)
}

fn layer_kind(name: &str) -> Option<LayerKind> {
    match extension(name).as_deref() {
        Some("tif" | "tiff") => Some(LayerKind::Raster),
        Some("geojson" | "json" | "pmtiles") => Some(LayerKind::Vector),
        _ => None,
    }
}

/// Servable layers in `dir`, without duplicate ids.
#[must_use]
pub fn list_layers(dir: &Path) -> Vec<LayerEntry> {
    let all: Vec<(PathBuf, String)> = files(dir).collect();
    let geojson_stems: HashSet<&str> = all
        .iter()
        .filter(|(_, name)| matches!(extension(name).as_deref(), Some("geojson" | "json")))
        .map(|(_, name)| stem(name))
        .collect();
    let pmtiles_stems: HashSet<&str> = all
        .iter()
        .filter(|(_, name)| extension(name).as_deref() == Some("pmtiles"))
        .map(|(_, name)| stem(name))
        .collect();

    let mut seen = HashSet::new();
    let mut layers = Vec::new();
    for (path, name) in &all {
        let Some(kind) = layer_kind(name) else {
            debug!(path = %path.display(), "Skipping non-layer file");
            continue;
        };
        let id = stem(name);
        let is_pmtiles = extension(name).as_deref() == Some("pmtiles");
        if is_pmtiles && geojson_stems.contains(id) {
            continue;
        }
        if !seen.insert(id.to_string()) {
            continue;
        }
        let pmtiles_url = (!is_pmtiles && kind == LayerKind::Vector && pmtiles_stems.contains(id))
            .then(|| format!("{SERVE_PREFIX}/{id}.pmtiles"));
        layers.push(LayerEntry {
            id: id.to_string(),
            name: name.clone(),
            kind,
            url: format!("{SERVE_PREFIX}/{name}"),
            pmtiles_url,
        });
    }
    layers
}

/// Delete the first layer file whose stem ends with `id`, together with its
/// `.pmtiles` companion. Returns the removed paths.
///
/// # Errors
/// [`Error::Validation`] for ids with path components, [`Error::NotFound`]
/// when nothing matches.
pub fn delete_layer(dir: &Path, id: &str) -> Result<Vec<PathBuf>> {
    if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
        return Err(Error::validation(format!("Invalid layer id: {id:?}")));
    }
    let (path, name) = files(dir)
        .find(|(_, name)| layer_kind(name).is_some() && stem(name).ends_with(id))
        .ok_or_else(|| Error::not_found("Layer not found"))?;

    std::fs::remove_file(&path)?;
    let mut removed = vec![path];
    if extension(&name).as_deref() != Some("pmtiles") {
        let companion = dir.join(format!("{}.pmtiles", stem(&name)));
        if companion.is_file() {
            std::fs::remove_file(&companion)?;
            removed.push(companion);
        }
    }
    info!(id, files = removed.len(), "Layer deleted");
    Ok(removed)
}

/// Files in incoming storage with their size and coarse kind.
#[must_use]
pub fn list_uploads(dir: &Path) -> Vec<UploadEntry> {
    files(dir)
        .map(|(path, filename)| {
            let bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            #[allow(clippy::cast_precision_loss)]
            let size_mb = (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
            let kind = classify(&filename).label();
            UploadEntry { filename, size_mb, kind }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_list_layers_pairs_companions() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "dem_a.tif",
            "dem_a.tif.ovr",
            "roads_b.geojson",
            "roads_b.pmtiles",
            "orphan_c.pmtiles",
            ".tmpXYZ",
            "notes.txt",
        ] {
            touch(dir.path(), name);
        }

        let layers = list_layers(dir.path());
        let ids: Vec<&str> = layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["dem_a", "orphan_c", "roads_b"]);

        let roads = &layers[2];
        assert_eq!(roads.kind, LayerKind::Vector);
        assert_eq!(roads.name, "roads_b.geojson");
        assert_eq!(roads.url, "/cog/roads_b.geojson");
        assert_eq!(roads.pmtiles_url.as_deref(), Some("/cog/roads_b.pmtiles"));

        assert_eq!(layers[0].kind, LayerKind::Raster);
        assert_eq!(layers[1].url, "/cog/orphan_c.pmtiles");
        assert!(layers[1].pmtiles_url.is_none());
    }

    #[test]
    fn test_list_layers_unique_ids() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "same.tif");
        touch(dir.path(), "same.tiff");
        touch(dir.path(), "same.json");
        let layers = list_layers(dir.path());
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].name, "same.json");
    }

    #[test]
    fn test_delete_layer_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "roads_1234.geojson");
        touch(dir.path(), "roads_1234.pmtiles");
        touch(dir.path(), "dem_5678.tif");

        let removed = delete_layer(dir.path(), "1234").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(!dir.path().join("roads_1234.pmtiles").exists());
        assert!(dir.path().join("dem_5678.tif").exists());

        assert!(matches!(delete_layer(dir.path(), "1234"), Err(Error::NotFound(_))));
        assert!(matches!(delete_layer(dir.path(), "../x"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_list_uploads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.tif"), vec![0u8; 1536 * 1024]).unwrap();
        touch(dir.path(), "parcels.zip");
        touch(dir.path(), "readme.md");

        let uploads = list_uploads(dir.path());
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0].filename, "big.tif");
        assert!((uploads[0].size_mb - 1.5).abs() < f64::EPSILON);
        assert_eq!(uploads[0].kind, "raster");
        assert_eq!(uploads[1].kind, "vector");
        assert_eq!(uploads[2].kind, "unknown");
        assert_eq!(uploads[1].size_mb, 0.0);
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_layers(&dir.path().join("absent")).is_empty());
    }
}
