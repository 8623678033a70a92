//! Main orchestration logic for acquiring datasets.

use crate::download::{fetch_file, progress_bar};
use crate::error::DatasetError;
use crate::lock::DatasetLock;
use crate::materialize::{materialize, recover_interrupted_swap};
use crate::registry::Registry;
use crate::types::{Acquired, DatasetSpec, DownloadState, FetchConfig, Split};
use crate::verify::{verified_marker, verify_download, VerifiedMarker};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Acquires datasets from a [`Registry`] into local directories.
///
/// # Example
///
/// ```no_run
/// use datafetch::{DatasetFetcher, FetchConfig, Registry, Split};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = DatasetFetcher::new(Registry::builtin(), FetchConfig::default())?;
/// let train = fetcher.acquire("MNIST", Split::Train, "/tmp/twister2deepnet/mnist").await?;
/// println!("MNIST train at {}", train.path.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DatasetFetcher {
    registry: Registry,
    config: FetchConfig,
    client: reqwest::Client,
}

impl DatasetFetcher {
    pub fn new(registry: Registry, config: FetchConfig) -> Result<Self, DatasetError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            registry,
            config,
            client,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Resolves without touching the filesystem or the network.
    pub fn resolve(
        &self,
        id: &str,
        split: Split,
        dest: impl AsRef<Path>,
    ) -> Result<DatasetSpec, DatasetError> {
        self.registry.resolve(id, split, dest)
    }

    /// Ensures `id`/`split` is present and verified under `dest`.
    pub async fn acquire(
        &self,
        id: &str,
        split: Split,
        dest: impl AsRef<Path>,
    ) -> Result<Acquired, DatasetError> {
        let spec = self.resolve(id, split, dest)?;
        self.acquire_spec(&spec).await
    }

    /// Ensures an already resolved spec is present and verified.
    ///
    /// The steps are:
    ///
    /// 1. Return immediately if the target carries a matching marker
    /// 2. Take the per-target lock and check the marker again
    /// 3. Fetch and verify every file into the scratch directory
    /// 4. Decode into staging and swap it onto the target
    ///
    /// Temp files and the lock are released on every exit path, including
    /// when the returned future is dropped.
    pub async fn acquire_spec(&self, spec: &DatasetSpec) -> Result<Acquired, DatasetError> {
        let mut tracker = StateTracker::new(spec);

        if let Some(marker) = verified_marker(spec).await {
            return tracker.already_verified(&marker).await;
        }

        tokio::fs::create_dir_all(&spec.scratch)
            .await
            .map_err(|e| DatasetError::fs(&spec.scratch, e))?;
        let lock = DatasetLock::acquire(&spec.lock_path(), self.config.lock_timeout).await?;

        recover_interrupted_swap(spec).await?;

        // Another caller may have finished while we waited.
        if let Some(marker) = verified_marker(spec).await {
            return tracker.already_verified(&marker).await;
        }

        let reservation = Reservation {
            _scratch: ScratchGuard::new(spec),
            _lock: lock,
        };
        tracker.advance(DownloadState::InProgress);

        match self.run(spec, reservation).await {
            Ok((marker, bytes_fetched)) => {
                tracker.advance(DownloadState::Verified);
                let path = absolute(&spec.target).await?;
                Ok(Acquired {
                    files: marker.outputs(&path),
                    path,
                    state: tracker.state,
                    fetched: true,
                    bytes_fetched,
                })
            }
            Err(e) => {
                tracker.advance(DownloadState::Failed);
                error!("❌ Acquiring {}/{} failed: {}", spec.id, spec.split, e);
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        spec: &DatasetSpec,
        reservation: Reservation,
    ) -> Result<(VerifiedMarker, u64), DatasetError> {
        info!(
            "📦 Acquiring {}/{} ({} files) into {}",
            spec.id,
            spec.split,
            spec.files.len(),
            spec.target.display()
        );

        let mut sizes = Vec::with_capacity(spec.files.len());
        for file in &spec.files {
            let part = spec.part_path(file);
            let pb = progress_bar(self.config.show_progress, file.length, &file.file_name);

            let fetched = fetch_file(&self.client, &self.config, spec, file, &part, &pb).await;
            let (url, size) = match fetched {
                Ok(done) => {
                    pb.finish_and_clear();
                    done
                }
                Err(e) => {
                    pb.abandon();
                    return Err(e);
                }
            };

            verify_download(spec, file, &part, &url).await?;
            sizes.push(size);
        }

        let bytes = sizes.iter().sum::<u64>();
        // The blocking task owns the reservation from here on.
        let marker = materialize(spec, sizes, reservation).await?;
        Ok((marker, bytes))
    }
}

/// Owns the [`DownloadState`] of one acquisition call.
struct StateTracker<'a> {
    spec: &'a DatasetSpec,
    state: DownloadState,
}

impl<'a> StateTracker<'a> {
    fn new(spec: &'a DatasetSpec) -> Self {
        Self {
            spec,
            state: DownloadState::NotStarted,
        }
    }

    fn advance(&mut self, next: DownloadState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "Unexpected transition for {}/{}: {} -> {}",
                self.spec.id, self.spec.split, self.state, next
            );
        }
        debug!(
            "{}/{}: {} -> {}",
            self.spec.id, self.spec.split, self.state, next
        );
        self.state = next;
    }

    async fn already_verified(
        &mut self,
        marker: &VerifiedMarker,
    ) -> Result<Acquired, DatasetError> {
        self.advance(DownloadState::Verified);
        info!(
            "✅ {}/{} already verified at {}",
            self.spec.id,
            self.spec.split,
            self.spec.target.display()
        );
        let path = absolute(&self.spec.target).await?;
        Ok(Acquired {
            files: marker.outputs(&path),
            path,
            state: self.state,
            fetched: false,
            bytes_fetched: 0,
        })
    }
}

/// What one acquisition holds while it writes. Fields drop in order, so
/// the scratch directories are gone before the lock is released.
struct Reservation {
    _scratch: ScratchGuard,
    _lock: DatasetLock,
}

/// Removes this acquisition's temp and staging directories on drop.
struct ScratchGuard {
    dirs: [PathBuf; 2],
}

impl ScratchGuard {
    fn new(spec: &DatasetSpec) -> Self {
        Self {
            dirs: [spec.work_dir(), spec.staging_dir()],
        }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        for dir in &self.dirs {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => debug!("Cleaned up {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to clean up {}: {}", dir.display(), e),
            }
        }
    }
}

async fn absolute(path: &Path) -> Result<PathBuf, DatasetError> {
    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| DatasetError::fs(path, e))
}
