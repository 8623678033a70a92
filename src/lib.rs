//! DataFetch - Reliable dataset downloader with verified, atomic materialization
//!
//! This library ensures that a named dataset split (such as MNIST train) is
//! present in a local directory, downloaded from known mirrors and checked
//! against published MD5 digests.
//!
//! # Features
//!
//! - **Explicit Registry**: Dataset identifiers map to mirrors and digests via an immutable table
//! - **Automatic Retry**: Bounded exponential backoff on transient network failures
//! - **Resumable Downloads**: Partial temp files continue with HTTP range requests
//! - **MD5 Verification**: Corrupted downloads are rejected and removed
//! - **Atomic Materialization**: Archives are decoded into staging and renamed into place
//! - **Idempotent & Concurrent-Safe**: Verified targets short-circuit; an advisory lock serializes writers
//!
//! # Example
//!
//! ```no_run
//! use datafetch::{DatasetFetcher, FetchConfig, Registry, Split};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = DatasetFetcher::new(Registry::builtin(), FetchConfig::default())?;
//!
//! for split in [Split::Train, Split::Test] {
//!     let dataset = fetcher.acquire("MNIST", split, "/tmp/twister2deepnet/mnist").await?;
//!     println!("{} ready at {}", split, dataset.path.display());
//! }
//! # Ok(())
//! # }
//! ```

mod download;
mod error;
pub mod extract;
pub mod lock;
mod materialize;
mod orchestrator;
mod registry;
mod retry;
mod types;
pub mod verify;

pub use error::{DatasetError, TransferError};
pub use extract::{ArchiveFormat, Decoder};
pub use orchestrator::DatasetFetcher;
pub use registry::{DatasetEntry, Registry, ResourceEntry};
pub use retry::RetryPolicy;
pub use types::{
    Acquired, DatasetSpec, DownloadState, FetchConfig, ParseSplitError, RemoteFile, Split,
    SCRATCH_DIR,
};
pub use verify::{compute_file_md5, VerifiedMarker, MARKER_FILE};
