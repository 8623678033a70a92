//! Data structures for dataset acquisition.

use crate::extract::ArchiveFormat;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Name of the scratch directory created next to the materialized datasets.
pub const SCRATCH_DIR: &str = ".datafetch";

/// Which half of a dataset to fetch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

impl Split {
    pub fn as_str(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid split '{0}', expected 'train' or 'test'")]
pub struct ParseSplitError(String);

impl FromStr for Split {
    type Err = ParseSplitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "test" => Ok(Split::Test),
            _ => Err(ParseSplitError(s.to_string())),
        }
    }
}

/// A single remote file, available from one or more mirrors.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// File name as published upstream (e.g. `train-images-idx3-ubyte.gz`).
    pub file_name: String,
    /// Candidate URLs, tried in order.
    pub urls: Vec<String>,
    /// Expected MD5 digest of the fetched bytes, lowercase hex.
    pub md5: String,
    /// Expected size of the fetched bytes, when known.
    pub length: Option<u64>,
    /// How the fetched bytes are decoded when materialized.
    pub format: ArchiveFormat,
}

impl RemoteFile {
    /// `(url, expected_hash, byte_length)` for every mirror, in order.
    pub fn sources(&self) -> impl Iterator<Item = (&str, &str, Option<u64>)> + '_ {
        self.urls
            .iter()
            .map(move |url| (url.as_str(), self.md5.as_str(), self.length))
    }
}

/// Everything needed to acquire one split of one dataset.
///
/// Produced by [`crate::Registry::resolve`] and never mutated afterwards.
/// All derived paths live under `scratch`, which sits on the same filesystem
/// as `target` so that the final rename is atomic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Canonical dataset name from the registry.
    pub id: String,
    pub split: Split,
    pub files: Vec<RemoteFile>,
    /// Public path where the verified dataset appears.
    pub target: PathBuf,
    /// Scratch directory for temp files, staging and locks.
    pub scratch: PathBuf,
}

impl DatasetSpec {
    fn key(&self) -> String {
        format!("{}-{}", self.id, self.split)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.scratch.join(format!("{}.lock", self.key()))
    }

    /// Directory holding the `.part` files of this acquisition.
    pub fn work_dir(&self) -> PathBuf {
        self.scratch.join("tmp").join(self.key())
    }

    pub fn part_path(&self, file: &RemoteFile) -> PathBuf {
        self.work_dir().join(format!("{}.part", file.file_name))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.scratch.join(format!("staging-{}", self.key()))
    }

    /// Where a previous target is parked while the new one is swapped in.
    pub fn retired_dir(&self) -> PathBuf {
        self.scratch.join(format!("retired-{}", self.key()))
    }

    pub fn total_length(&self) -> Option<u64> {
        self.files.iter().map(|f| f.length).sum()
    }
}

/// Lifecycle of a single acquisition.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    NotStarted,
    InProgress,
    Verified,
    Failed,
}

impl DownloadState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `NotStarted -> Verified` covers a target that was already materialized
    /// by an earlier call.
    pub fn can_transition_to(self, next: DownloadState) -> bool {
        use DownloadState::*;
        matches!(
            (self, next),
            (NotStarted, InProgress)
                | (NotStarted, Verified)
                | (InProgress, Verified)
                | (InProgress, Failed)
                | (Failed, InProgress)
        )
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DownloadState::NotStarted => "not started",
            DownloadState::InProgress => "in progress",
            DownloadState::Verified => "verified",
            DownloadState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Configuration for acquiring datasets.
///
/// # Example
///
/// ```
/// use datafetch::{FetchConfig, RetryPolicy};
/// use std::time::Duration;
///
/// let config = FetchConfig {
///     retry: RetryPolicy {
///         max_retries: 5,
///         ..RetryPolicy::default()
///     },
///     request_timeout: Duration::from_secs(60),
///     show_progress: false,
///     ..FetchConfig::default()
/// };
/// assert_eq!(config.retry.max_retries, 5);
/// ```
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Retry and backoff schedule applied per URL.
    pub retry: RetryPolicy,
    /// Upper bound for sending a request and for every read of the body.
    pub request_timeout: Duration,
    /// Upper bound for establishing a connection.
    pub connect_timeout: Duration,
    /// How long to wait for another process holding the same target.
    pub lock_timeout: Duration,
    /// Draw progress bars on stderr (only when it is a terminal).
    pub show_progress: bool,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            lock_timeout: Duration::from_secs(600),
            show_progress: true,
            user_agent: format!("datafetch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Outcome of a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    /// Absolute path of the materialized dataset directory.
    pub path: PathBuf,
    /// Absolute paths of the decoded files.
    pub files: Vec<PathBuf>,
    pub state: DownloadState,
    /// `false` when the target was already verified and nothing was fetched.
    pub fetched: bool,
    pub bytes_fetched: u64,
}

pub(crate) fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> DatasetSpec {
        DatasetSpec {
            id: "MNIST".into(),
            split: Split::Train,
            files: vec![RemoteFile {
                file_name: "train-labels-idx1-ubyte.gz".into(),
                urls: vec!["https://a/x".into(), "https://b/x".into()],
                md5: "d53e105ee54ea40749a09fcbcd1e9432".into(),
                length: Some(28881),
                format: ArchiveFormat::Gzip,
            }],
            target: PathBuf::from("/data/MNIST/train"),
            scratch: PathBuf::from("/data/.datafetch"),
        }
    }

    #[test]
    fn split_parses_case_insensitively() {
        assert_eq!("train".parse::<Split>().unwrap(), Split::Train);
        assert_eq!(" TEST ".parse::<Split>().unwrap(), Split::Test);
        assert!("validation".parse::<Split>().is_err());
        assert_eq!(Split::Test.to_string(), "test");
    }

    #[test]
    fn derived_paths_stay_in_scratch() {
        let spec = spec();
        let file = &spec.files[0];
        assert_eq!(
            spec.lock_path(),
            PathBuf::from("/data/.datafetch/MNIST-train.lock")
        );
        assert_eq!(
            spec.part_path(file),
            PathBuf::from("/data/.datafetch/tmp/MNIST-train/train-labels-idx1-ubyte.gz.part")
        );
        assert!(spec.staging_dir().starts_with(&spec.scratch));
        assert!(spec.retired_dir().starts_with(&spec.scratch));
        assert_ne!(spec.staging_dir(), spec.retired_dir());
    }

    #[test]
    fn sources_yield_one_tuple_per_mirror() {
        let spec = spec();
        let sources: Vec<_> = spec.files[0].sources().collect();
        assert_eq!(sources.len(), 2);
        assert_eq!(
            sources[1],
            ("https://b/x", "d53e105ee54ea40749a09fcbcd1e9432", Some(28881))
        );
    }

    #[test]
    fn state_transitions_follow_the_table() {
        use DownloadState::*;
        assert!(NotStarted.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Verified));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(InProgress));
        assert!(NotStarted.can_transition_to(Verified));
        assert!(!Verified.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Verified));
        assert!(!NotStarted.can_transition_to(Failed));
    }

    #[test]
    fn total_length_requires_every_length() {
        let mut spec = spec();
        assert_eq!(spec.total_length(), Some(28881));
        spec.files[0].length = None;
        assert_eq!(spec.total_length(), None);
    }
}
