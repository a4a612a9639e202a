//! Streaming ingest of uploaded files.
//!
//! Uploads are written to the incoming directory in fixed 1 MiB writes no
//! matter how the transport chunks them, so memory use stays at one chunk.
//! Each stored file is prefixed with a full UUID.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use bytes::{Buf, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Write size for uploads.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// A file sitting in incoming storage, waiting to be normalized.
#[derive(Debug, Clone, Serialize)]
pub struct UploadedAsset {
    pub id: String,
    pub original_filename: String,
    pub stored_path: PathBuf,
    pub byte_size: u64,
}

/// Reduce a client-supplied filename to its final path component.
///
/// # Errors
/// Returns a validation error if nothing usable is left.
pub fn sanitize_filename(name: &str) -> Result<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    if last.is_empty() || last == "." || last == ".." || last.chars().any(char::is_control) {
        return Err(Error::validation(format!("Invalid filename: {name:?}")));
    }
    Ok(last.to_string())
}

/// Stream `body` into `dir` under `<uuid>_<filename>`.
///
/// # Errors
/// Returns an error if the stream fails or the file cannot be written; the
/// partial file is removed first.
pub async fn stream_to_disk<S, E>(body: S, dir: &Path, filename: &str) -> Result<UploadedAsset>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: Display,
{
    let original_filename = sanitize_filename(filename)?;
    let id = Uuid::new_v4().to_string();
    let stored_path = dir.join(format!("{id}_{original_filename}"));

    match write_chunks(body, &stored_path).await {
        Ok(byte_size) => {
            info!(path = %stored_path.display(), bytes = byte_size, "Upload stored");
            Ok(UploadedAsset {
                id,
                original_filename,
                stored_path,
                byte_size,
            })
        }
        Err(e) => {
            warn!(path = %stored_path.display(), error = %e, "Upload failed, removing partial file");
            let _ = tokio::fs::remove_file(&stored_path).await;
            Err(e)
        }
    }
}

async fn write_chunks<S, E>(mut body: S, path: &Path) -> Result<u64>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: Display,
{
    let mut file = File::create(path).await?;
    let mut pending = BytesMut::with_capacity(CHUNK_SIZE);
    let mut written = 0u64;

    while let Some(piece) = body.next().await {
        let piece = piece.map_err(|e| std::io::Error::other(format!("Upload interrupted: {e}")))?;
        pending.extend_from_slice(&piece);
        while pending.len() >= CHUNK_SIZE {
            file.write_all(&pending[..CHUNK_SIZE]).await?;
            pending.advance(CHUNK_SIZE);
            written += CHUNK_SIZE as u64;
        }
    }
    if !pending.is_empty() {
        file.write_all(&pending).await?;
        written += pending.len() as u64;
    }
    file.flush().await?;
    debug!(bytes = written, "Upload stream drained");
    Ok(written)
}

/// Resolve a file already placed in incoming storage out-of-band.
///
/// # Errors
/// Validation error for names with path components; not-found (listing
/// what is available) if the file is absent.
pub fn locate_existing(dir: &Path, filename: &str) -> Result<UploadedAsset> {
    let clean = sanitize_filename(filename)?;
    if clean != filename {
        return Err(Error::validation(format!("Invalid filename: {filename:?}")));
    }
    let stored_path = dir.join(&clean);
    match std::fs::metadata(&stored_path) {
        Ok(meta) if meta.is_file() => Ok(UploadedAsset {
            id: Uuid::new_v4().to_string(),
            original_filename: clean,
            stored_path,
            byte_size: meta.len(),
        }),
        _ => {
            let mut available: Vec<String> = std::fs::read_dir(dir)
                .map(|entries| {
                    entries
                        .filter_map(std::result::Result::ok)
                        .filter(|e| e.path().is_file())
                        .filter_map(|e| e.file_name().into_string().ok())
                        .collect()
                })
                .unwrap_or_default();
            available.sort();
            Err(Error::not_found(format!(
                "File {clean} not found. Available files: [{}]",
                available.join(", ")
            )))
        }
    }
}
