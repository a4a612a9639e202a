//! Byte-range serving of processed files.
//!
//! Request handling runs in four steps:
//!
//! 1. [`validate_relative_path`] rejects traversal before touching the disk.
//! 2. [`content_type`] picks the MIME type from the extension, refusing
//!    `.ovr` sidecars and anything that is not a servable kind.
//! 3. [`parse_range`] turns a `Range` header into a [`RangeSpec`].
//! 4. [`plan`] decides status, length and headers.
//!
//! [`open`] combines all four and hands back a body stream that reads
//! 64 KiB at a time.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use axum::http::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{Error, Result};
use crate::format::extension;

/// Read size used when streaming file bodies.
pub const READ_CHUNK: usize = 64 * 1024;

/// Reject paths that could leave the served directory.
///
/// # Errors
/// Returns [`Error::Validation`] for empty, absolute, backslashed, or
/// parent-relative paths.
pub fn validate_relative_path(path: &str) -> Result<()> {
    let invalid = || Error::validation("Invalid path");
    if path.is_empty() || path.contains('\\') || path.contains('\0') {
        return Err(invalid());
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(invalid()),
        }
    }
    Ok(())
}

/// MIME type for a servable file.
///
/// # Errors
/// [`Error::NotFound`] for `.ovr` sidecars, [`Error::Validation`] for any
/// other unservable extension.
pub fn content_type(path: &str) -> Result<&'static str> {
    match extension(path).as_deref() {
        Some("tif" | "tiff") => Ok("image/tiff"),
        Some("pmtiles") => Ok("application/octet-stream"),
        Some("geojson" | "json") => Ok("application/geo+json"),
        Some("ovr") => Err(Error::not_found("Overview sidecars are not served")),
        _ => Err(Error::validation("Unsupported file type")),
    }
}

/// Inclusive byte window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; never zero.
    #[must_use]
    pub fn byte_count(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// What a `Range` header asks for, resolved against a file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No header, or one we do not honour.
    Full,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Resolve a `Range` header against `size`.
///
/// Supports `bytes=<start>-[<end>]` and suffix ranges `bytes=-<n>`; `end`
/// is clamped to the last byte. Multi-range and malformed headers fall back
/// to [`RangeSpec::Full`].
#[must_use]
pub fn parse_range(header: Option<&str>, size: u64) -> RangeSpec {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return RangeSpec::Full;
    };
    if spec.contains(',') {
        return RangeSpec::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return RangeSpec::Full;
        };
        if suffix == 0 || size == 0 {
            return RangeSpec::Unsatisfiable;
        }
        return RangeSpec::Partial(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let Ok(start) = start.parse::<u64>() else {
        return RangeSpec::Full;
    };
    let end = if end.is_empty() {
        u64::MAX
    } else {
        match end.parse::<u64>() {
            Ok(e) => e,
            Err(_) => return RangeSpec::Full,
        }
    };
    if start >= size {
        return RangeSpec::Unsatisfiable;
    }
    let end = end.min(size - 1);
    if start > end {
        return RangeSpec::Unsatisfiable;
    }
    RangeSpec::Partial(ByteRange { start, end })
}

/// Status and headers of a file response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServePlan {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub content_length: u64,
    /// First byte of the body within the file.
    pub offset: u64,
    pub content_range: Option<String>,
    /// False for `HEAD`.
    pub send_body: bool,
}

/// Decide how to answer a request for a `size`-byte file.
///
/// `HEAD` always reports the whole file.
///
/// # Errors
/// [`Error::RangeNotSatisfiable`] when the range lies outside the file.
pub fn plan(head: bool, range: Option<&str>, size: u64, content_type: &'static str) -> Result<ServePlan> {
    let full = ServePlan {
        status: StatusCode::OK,
        content_type,
        content_length: size,
        offset: 0,
        content_range: None,
        send_body: !head,
    };
    if head {
        return Ok(full);
    }
    match parse_range(range, size) {
        RangeSpec::Full => Ok(full),
        RangeSpec::Unsatisfiable => Err(Error::RangeNotSatisfiable { size }),
        RangeSpec::Partial(r) => Ok(ServePlan {
            status: StatusCode::PARTIAL_CONTENT,
            content_length: r.byte_count(),
            offset: r.start,
            content_range: Some(format!("bytes {}-{}/{size}", r.start, r.end)),
            ..full
        }),
    }
}

/// Body of a planned response.
pub type FileBody = ReaderStream<Take<File>>;

/// Validate, locate and position a file under `root` for serving.
///
/// # Errors
/// Validation, not-found and range errors per the module docs; I/O errors
/// opening or seeking the file.
pub async fn open(
    root: &Path,
    relative: &str,
    head: bool,
    range: Option<&str>,
) -> Result<(ServePlan, Option<FileBody>)> {
    validate_relative_path(relative)?;
    let content_type = content_type(relative)?;
    let path: PathBuf = root.join(relative);

    let size = match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Err(Error::not_found("File not found")),
    };
    let plan = plan(head, range, size, content_type)?;
    debug!(path = %path.display(), status = %plan.status, offset = plan.offset, len = plan.content_length, "Serving file");
    if !plan.send_body {
        return Ok((plan, None));
    }

    let mut file = File::open(&path).await?;
    if plan.offset > 0 {
        file.seek(SeekFrom::Start(plan.offset)).await?;
    }
    let body = ReaderStream::with_capacity(file.take(plan.content_length), READ_CHUNK);
    Ok((plan, Some(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_traversal_rejected() {
        for bad in ["../secret", "a/../../b", "/etc/passwd", "a\\b", ""] {
            assert!(
                matches!(validate_relative_path(bad), Err(Error::Validation(_))),
                "{bad} should be rejected"
            );
        }
        assert!(validate_relative_path("dem_1.tif").is_ok());
        assert!(validate_relative_path("sub/dem.tif").is_ok());
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type("a.TIF").unwrap(), "image/tiff");
        assert_eq!(content_type("a.pmtiles").unwrap(), "application/octet-stream");
        assert_eq!(content_type("a.geojson").unwrap(), "application/geo+json");
        assert!(matches!(content_type("a.tif.ovr"), Err(Error::NotFound(_))));
        assert!(matches!(content_type("a.txt"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_parse_range_cases() {
        let r = |start, end| RangeSpec::Partial(ByteRange { start, end });
        assert_eq!(parse_range(Some("bytes=0-99"), 1000), r(0, 99));
        assert_eq!(parse_range(Some("bytes=900-2000"), 1000), r(900, 999));
        assert_eq!(parse_range(Some("bytes=500-"), 1000), r(500, 999));
        assert_eq!(parse_range(Some("bytes=-100"), 1000), r(900, 999));
        assert_eq!(parse_range(Some("bytes=-5000"), 1000), r(0, 999));
        assert_eq!(parse_range(Some("bytes=1000-1005"), 1000), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=50-10"), 1000), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(Some("bytes=0-"), 0), RangeSpec::Unsatisfiable);
        assert_eq!(parse_range(None, 1000), RangeSpec::Full);
        assert_eq!(parse_range(Some("bytes=0-1,5-9"), 1000), RangeSpec::Full);
        assert_eq!(parse_range(Some("items=0-9"), 1000), RangeSpec::Full);
        assert_eq!(parse_range(Some("bytes=a-b"), 1000), RangeSpec::Full);
    }

    #[test]
    fn test_plan_partial() {
        let p = plan(false, Some("bytes=0-99"), 1000, "image/tiff").unwrap();
        assert_eq!(p.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(p.content_length, 100);
        assert_eq!(p.content_range.as_deref(), Some("bytes 0-99/1000"));

        let p = plan(false, Some("bytes=900-2000"), 1000, "image/tiff").unwrap();
        assert_eq!(p.content_range.as_deref(), Some("bytes 900-999/1000"));
        assert_eq!(p.content_length, 100);
    }

    #[test]
    fn test_plan_full_and_head() {
        let p = plan(false, None, 1000, "image/tiff").unwrap();
        assert_eq!((p.status, p.content_length, p.send_body), (StatusCode::OK, 1000, true));

        let p = plan(true, Some("bytes=0-9"), 1000, "image/tiff").unwrap();
        assert_eq!((p.status, p.content_length, p.send_body), (StatusCode::OK, 1000, false));

        let err = plan(false, Some("bytes=1000-1005"), 1000, "image/tiff").unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { size: 1000 }));
    }

    #[tokio::test]
    async fn test_open_streams_exact_window() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("big.tif"), &data).unwrap();

        let (plan, body) = open(dir.path(), "big.tif", false, Some("bytes=70000-139999"))
            .await
            .unwrap();
        assert_eq!(plan.content_length, 70_000);

        let mut received = Vec::new();
        let mut body = body.unwrap();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= READ_CHUNK);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, &data[70_000..140_000]);
    }

    #[tokio::test]
    async fn test_open_missing_and_head() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.geojson"), b"{}").unwrap();

        assert!(matches!(open(dir.path(), "b.geojson", false, None).await, Err(Error::NotFound(_))));
        let (plan, body) = open(dir.path(), "a.geojson", true, None).await.unwrap();
        assert_eq!(plan.content_length, 2);
        assert!(body.is_none());
    }
}
