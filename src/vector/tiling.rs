//! Packaging GeoJSON into PMTiles with an external tiler.
//!
//! The tiler is invoked tippecanoe-style with automatic zoom selection and
//! density-based feature dropping. Failure here never fails a conversion;
//! callers turn a [`PackagingError`] into a warning.

use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_TILING_TOOL: &str = "tippecanoe";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("tiling tool `{tool}` could not be started: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tiling tool `{tool}` failed ({status}): {stderr}")]
    Failed {
        tool: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("tiling tool `{tool}` produced no output")]
    NoOutput { tool: String },
}

/// Run `tool` to turn `geojson` into `pmtiles`.
///
/// A partially written `pmtiles` file is removed on failure.
///
/// # Errors
/// Returns a [`PackagingError`] if the tool is missing, exits non-zero, or
/// leaves no output behind.
pub fn package(geojson: &Path, pmtiles: &Path, tool: &str) -> Result<(), PackagingError> {
    let layer = geojson
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("layer");

    let mut cmd = Command::new(tool);
    cmd.arg("-o")
        .arg(pmtiles)
        .arg("-zg")
        .arg("--drop-densest-as-needed")
        .arg("--force")
        .arg("-l")
        .arg(layer)
        .arg(geojson)
        .stdin(Stdio::null());
    debug!(?cmd, "Running tiling tool");

    let output = cmd.output().map_err(|source| PackagingError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    if !output.status.success() {
        let _ = std::fs::remove_file(pmtiles);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.lines().last().unwrap_or_default().trim().to_string();
        return Err(PackagingError::Failed {
            tool: tool.to_string(),
            status: output.status,
            stderr,
        });
    }
    if !pmtiles.is_file() {
        return Err(PackagingError::NoOutput { tool: tool.to_string() });
    }

    info!(output = %pmtiles.display(), "Packaged vector tiles");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tool_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let geojson = dir.path().join("a.geojson");
        std::fs::write(&geojson, "{}").unwrap();
        let err = package(&geojson, &dir.path().join("a.pmtiles"), "geoswipe-no-such-tiler").unwrap_err();
        assert!(matches!(err, PackagingError::Spawn { .. }));
        assert!(err.to_string().contains("geoswipe-no-such-tiler"));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_tool_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let geojson = dir.path().join("a.geojson");
        let pmtiles = dir.path().join("a.pmtiles");
        std::fs::write(&geojson, "{}").unwrap();
        std::fs::write(&pmtiles, "partial").unwrap();
        // `false` ignores its arguments and exits 1
        let err = package(&geojson, &pmtiles, "false").unwrap_err();
        assert!(matches!(err, PackagingError::Failed { .. }));
        assert!(!pmtiles.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_silent_tool_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let geojson = dir.path().join("a.geojson");
        std::fs::write(&geojson, "{}").unwrap();
        let err = package(&geojson, &dir.path().join("a.pmtiles"), "true").unwrap_err();
        assert!(matches!(err, PackagingError::NoOutput { .. }));
    }
}
