//! Decoding verified downloads into a staging directory and swapping it into
//! place.

use crate::error::DatasetError;
use crate::types::DatasetSpec;
use crate::verify::{VerifiedFile, VerifiedMarker};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Decodes every verified temp file of `spec` and publishes the result at
/// `spec.target`.
///
/// `sizes` holds the verified size of each file, in `spec.files` order.
/// Runs on a blocking task that also owns `held`, so whatever `held`
/// releases on drop (scratch cleanup, the target lock) is released only
/// after the swap has finished, even when this future is dropped early.
pub(crate) async fn materialize<H>(
    spec: &DatasetSpec,
    sizes: Vec<u64>,
    held: H,
) -> Result<VerifiedMarker, DatasetError>
where
    H: Send + 'static,
{
    let spec = spec.clone();
    blocking(move || {
        let result = materialize_blocking(&spec, &sizes);
        drop(held);
        result
    })
    .await
}

/// Returns the public path to its last published state after a swap was
/// interrupted between parking the old target and moving in the new one.
///
/// Must be called with the target lock held.
pub(crate) async fn recover_interrupted_swap(spec: &DatasetSpec) -> Result<(), DatasetError> {
    let target = spec.target.clone();
    let retired = spec.retired_dir();
    blocking(move || restore_retired(&target, &retired)).await
}

fn restore_retired(target: &Path, retired: &Path) -> Result<(), DatasetError> {
    if !retired.exists() {
        return Ok(());
    }
    if target.exists() {
        debug!("Removing leftover {}", retired.display());
        return remove_dir_if_exists(retired);
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatasetError::fs(parent, e))?;
    }
    info!(
        "♻️  Restoring {} from an interrupted swap",
        target.display()
    );
    std::fs::rename(retired, target).map_err(|e| DatasetError::fs(target, e))
}

async fn blocking<T, F>(f: F) -> Result<T, DatasetError>
where
    F: FnOnce() -> Result<T, DatasetError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        DatasetError::fs(
            PathBuf::new(),
            io::Error::other(format!("Task join error: {}", e)),
        )
    })?
}

fn materialize_blocking(spec: &DatasetSpec, sizes: &[u64]) -> Result<VerifiedMarker, DatasetError> {
    let staging = spec.staging_dir();
    remove_dir_if_exists(&staging)?;
    std::fs::create_dir_all(&staging).map_err(|e| DatasetError::fs(&staging, e))?;

    let mut files = Vec::with_capacity(spec.files.len());
    for (file, &length) in spec.files.iter().zip(sizes) {
        let part = spec.part_path(file);
        info!("📂 Decoding {} ({:?})", file.file_name, file.format);

        let outputs = file
            .format
            .decoder()
            .decode(&part, &file.file_name, &staging)
            .map_err(|e| DatasetError::fs(&part, e))?;

        files.push(VerifiedFile {
            file_name: file.file_name.clone(),
            md5: file.md5.clone(),
            length,
            outputs,
        });
    }

    let marker = VerifiedMarker {
        dataset: spec.id.clone(),
        split: spec.split,
        files,
        verified_at: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };
    // Written before the swap so it becomes visible together with the data.
    marker.write(&staging)?;

    swap_into_place(&staging, &spec.target, &spec.retired_dir())?;
    info!("✅ Materialized {}/{} at {}", spec.id, spec.split, spec.target.display());
    Ok(marker)
}

/// Replaces `target` with `staging`.
///
/// On Linux an existing target is exchanged with `staging` in a single
/// `renameat2(RENAME_EXCHANGE)`. Where that is unavailable the previous
/// `target` is parked at `retired` first and restored if the final rename
/// fails; [`recover_interrupted_swap`] covers a crash in between.
pub(crate) fn swap_into_place(
    staging: &Path,
    target: &Path,
    retired: &Path,
) -> Result<(), DatasetError> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatasetError::fs(parent, e))?;
    }

    let had_previous = target.exists();
    if had_previous {
        match sys::exchange(staging, target) {
            Ok(()) => {
                // `staging` now holds the previous content.
                if let Err(e) = remove_any(staging) {
                    warn!("Failed to remove replaced {}: {}", staging.display(), e);
                }
                return Ok(());
            }
            Err(e) => debug!("Exchange of {} unavailable: {}", target.display(), e),
        }

        remove_dir_if_exists(retired)?;
        std::fs::rename(target, retired).map_err(|e| DatasetError::fs(target, e))?;
    }

    if let Err(e) = std::fs::rename(staging, target) {
        if had_previous {
            if let Err(restore) = std::fs::rename(retired, target) {
                warn!(
                    "Failed to restore {} from {}: {}",
                    target.display(),
                    retired.display(),
                    restore
                );
            }
        }
        return Err(DatasetError::fs(target, e));
    }

    if had_previous {
        if let Err(e) = remove_any(retired) {
            warn!("Failed to remove retired {}: {}", retired.display(), e);
        }
    }
    Ok(())
}

#[cfg(all(target_os = "linux", any(target_env = "gnu", target_env = "musl")))]
mod sys {
    use std::ffi::CString;
    use std::io;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    pub(super) fn exchange(a: &Path, b: &Path) -> io::Result<()> {
        let a = CString::new(a.as_os_str().as_bytes())?;
        let b = CString::new(b.as_os_str().as_bytes())?;
        let r = unsafe {
            libc::renameat2(
                libc::AT_FDCWD,
                a.as_ptr(),
                libc::AT_FDCWD,
                b.as_ptr(),
                libc::RENAME_EXCHANGE,
            )
        };
        if r == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(all(target_os = "linux", any(target_env = "gnu", target_env = "musl"))))]
mod sys {
    use std::io;
    use std::path::Path;

    pub(super) fn exchange(_a: &Path, _b: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "atomic directory exchange is not available",
        ))
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<(), DatasetError> {
    match remove_any(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DatasetError::fs(path, e)),
    }
}

fn remove_any(path: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
