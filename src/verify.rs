//! File verification utilities (MD5 checksums, size checks and the
//! verified marker).

use crate::error::DatasetError;
use crate::types::{display_name, DatasetSpec, RemoteFile, Split};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name of the sidecar file recording a successful verification.
pub const MARKER_FILE: &str = ".datafetch.json";

/// Computes the MD5 hash of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
///
/// # Returns
///
/// The MD5 hash as a lowercase hexadecimal string, or an error.
pub async fn compute_file_md5(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> io::Result<String> {
        use io::Read;
        use md5::{Digest, Md5};

        let file = std::fs::File::open(&path)?;
        let mut reader = io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| io::Error::other(format!("Task join error: {}", e)))?
}

/// Checks a finished temp file against the expected length and digest.
///
/// On mismatch the temp file is deleted and [`DatasetError::Integrity`] is
/// returned.
pub(crate) async fn verify_download(
    spec: &DatasetSpec,
    file: &RemoteFile,
    part: &Path,
    url: &str,
) -> Result<(), DatasetError> {
    let fail = |expected: String, actual: String| DatasetError::Integrity {
        dataset: spec.id.clone(),
        file: file.file_name.clone(),
        url: url.to_string(),
        expected,
        actual,
    };

    let size = tokio::fs::metadata(part)
        .await
        .map_err(|e| DatasetError::fs(part, e))?
        .len();

    if let Some(expected) = file.length {
        if size != expected {
            discard(part).await;
            return Err(fail(format!("{} bytes", expected), format!("{} bytes", size)));
        }
    }

    info!("🔍 Verifying MD5 for {}", file.file_name);
    let computed = compute_file_md5(part)
        .await
        .map_err(|e| DatasetError::fs(part, e))?;

    if !computed.eq_ignore_ascii_case(&file.md5) {
        discard(part).await;
        return Err(fail(format!("md5 {}", file.md5), format!("md5 {}", computed)));
    }

    info!("✅ MD5 verified for {}", file.file_name);
    Ok(())
}

async fn discard(part: &Path) {
    if let Err(e) = tokio::fs::remove_file(part).await {
        warn!("Failed to remove corrupted {}: {}", part.display(), e);
    }
}

/// Per-file entry of the verified marker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VerifiedFile {
    pub file_name: String,
    pub md5: String,
    pub length: u64,
    /// Decoded files, relative to the target directory.
    pub outputs: Vec<PathBuf>,
}

/// Sidecar written next to the materialized files.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMarker {
    pub dataset: String,
    pub split: Split,
    pub files: Vec<VerifiedFile>,
    /// Unix timestamp of the verification.
    pub verified_at: u64,
}

impl VerifiedMarker {
    pub async fn read(dir: &Path) -> Option<Self> {
        let content = tokio::fs::read_to_string(dir.join(MARKER_FILE)).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring unreadable marker in {}: {}", dir.display(), e);
                None
            }
        }
    }

    pub fn write(&self, dir: &Path) -> Result<(), DatasetError> {
        let path = dir.join(MARKER_FILE);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DatasetError::fs(&path, io::Error::other(e)))?;
        std::fs::write(&path, json).map_err(|e| DatasetError::fs(&path, e))
    }

    /// Whether this marker covers every file of `spec`.
    pub fn covers(&self, spec: &DatasetSpec) -> bool {
        if !self.dataset.eq_ignore_ascii_case(&spec.id) || self.split != spec.split {
            return false;
        }
        spec.files.iter().all(|f| {
            self.files
                .iter()
                .any(|v| v.file_name == f.file_name && v.md5.eq_ignore_ascii_case(&f.md5))
        })
    }

    /// Absolute paths of every decoded file under `dir`.
    pub fn outputs(&self, dir: &Path) -> Vec<PathBuf> {
        self.files
            .iter()
            .flat_map(|f| f.outputs.iter().map(|o| dir.join(o)))
            .collect()
    }
}

/// Returns the marker when `spec.target` is already materialized and
/// verified.
pub(crate) async fn verified_marker(spec: &DatasetSpec) -> Option<VerifiedMarker> {
    let marker = VerifiedMarker::read(&spec.target).await?;
    if !marker.covers(spec) {
        debug!(
            "Marker in {} does not match {}/{}",
            spec.target.display(),
            spec.id,
            spec.split
        );
        return None;
    }
    for output in marker.outputs(&spec.target) {
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            info!(
                "{} is missing from {}, re-acquiring",
                display_name(&output),
                spec.target.display()
            );
            return None;
        }
    }
    Some(marker)
}
