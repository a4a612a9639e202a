//! Zipped shapefile extraction.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::{Error, Result};
use crate::format::extension;

/// Extract `archive` into `dest` and return the first `.shp` found by a
/// recursive, name-ordered walk.
///
/// An entry whose name would escape `dest` aborts the extraction with an
/// error; entries before it may already be on disk.
///
/// # Errors
/// Returns a conversion error if the archive is unreadable or holds no shapefile.
pub fn extract_shapefile(archive: &Path, dest: &Path) -> Result<PathBuf> {
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    zip.extract(dest)?;
    debug!(archive = %archive.display(), entries = zip.len(), "Extracted archive");

    WalkDir::new(dest)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .and_then(extension)
                .is_some_and(|ext| ext == "shp")
        })
        .ok_or_else(|| Error::conversion("No shapefile found in archive"))
}
