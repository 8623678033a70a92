//! Remote file download with retry, mirror fallback and resume.

use crate::error::{DatasetError, TransferError};
use crate::types::{DatasetSpec, FetchConfig, RemoteFile};
use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::path::Path;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::timeout;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

/// Fetches `file` into `part`, trying every URL in order.
///
/// Each URL gets the full retry budget of `config.retry`; permanent
/// failures skip straight to the next URL. Local write failures abort
/// immediately.
///
/// # Returns
///
/// The URL that succeeded and the size of the temp file.
pub(crate) async fn fetch_file(
    client: &reqwest::Client,
    config: &FetchConfig,
    spec: &DatasetSpec,
    file: &RemoteFile,
    part: &Path,
    pb: &indicatif::ProgressBar,
) -> Result<(String, u64), DatasetError> {
    if let Some(parent) = part.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DatasetError::fs(parent, e))?;
    }

    let mut last_failure: Option<(String, TransferError)> = None;

    for (url, _, _) in file.sources() {
        info!("⬇️  Fetching {} from {}", file.file_name, url);

        let mut attempt = 0u32;
        let result = Retry::spawn(config.retry.delays(), move || {
            attempt += 1;
            let attempt = attempt;
            async move {
                match fetch_once(client, config, url, file.length, part, pb).await {
                    Ok(size) => Ok(size),
                    Err(e) if e.is_transient() => {
                        warn!(
                            "Attempt {}/{} for {} failed: {}",
                            attempt,
                            config.retry.max_attempts(),
                            url,
                            e
                        );
                        RetryError::to_transient(e)
                    }
                    Err(e) => RetryError::to_permanent(e),
                }
            }
        })
        .await;

        match result {
            Ok(size) => return Ok((url.to_string(), size)),
            Err(TransferError::Local { path, source }) => {
                return Err(DatasetError::Filesystem { path, source });
            }
            Err(e) => {
                warn!("Giving up on {}: {}", url, e);
                last_failure = Some((url.to_string(), e));
            }
        }
    }

    let (url, source) = last_failure.unwrap_or_else(|| (String::new(), TransferError::NoSources));
    Err(DatasetError::Fetch {
        dataset: spec.id.clone(),
        url,
        source,
    })
}

/// One GET against one URL, resuming from whatever `part` already holds.
async fn fetch_once(
    client: &reqwest::Client,
    config: &FetchConfig,
    url: &str,
    expected_length: Option<u64>,
    part: &Path,
    pb: &indicatif::ProgressBar,
) -> Result<u64, TransferError> {
    let local = |source: std::io::Error| TransferError::Local {
        path: part.to_path_buf(),
        source,
    };

    let mut existing = match tokio::fs::metadata(part).await {
        Ok(m) => m.len(),
        Err(_) => 0,
    };

    if let Some(expected) = expected_length {
        if existing == expected && existing > 0 {
            debug!("{} already holds all {} bytes", part.display(), existing);
            pb.set_position(existing);
            return Ok(existing);
        }
        if existing > expected {
            existing = 0;
        }
    }

    let mut response = send(client, config, url, existing).await?;

    if response.status() == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
        // The temp file does not fit the remote resource; start over.
        info!(
            "{} rejected resume at byte {}, fetching from the start",
            url, existing
        );
        match tokio::fs::remove_file(part).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(local(e)),
        }
        existing = 0;
        response = send(client, config, url, existing).await?;
    }

    let status = response.status();
    let resume = match status {
        StatusCode::PARTIAL_CONTENT if existing > 0 => true,
        s if s.is_success() && s != StatusCode::PARTIAL_CONTENT => false,
        _ => return Err(TransferError::Status(status)),
    };

    if resume {
        info!("Resuming {} at byte {}", url, existing);
    } else {
        existing = 0;
    }

    let content_length = response.content_length();
    if let Some(total) = content_length.map(|n| n + existing).or(expected_length) {
        pb.set_length(total);
    }
    pb.set_position(existing);

    let handle = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(resume)
        .truncate(!resume)
        .open(part)
        .await
        .map_err(local)?;
    let mut file = BufWriter::new(handle);

    // Keep what arrived even on failure, the next attempt resumes from it.
    let mut received = 0u64;
    let mut stream = response.bytes_stream();
    let streamed = loop {
        let next = match timeout(config.request_timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => break Err(TransferError::Timeout(config.request_timeout)),
        };
        match next {
            Some(Ok(chunk)) => {
                if let Err(e) = file.write_all(&chunk).await {
                    break Err(local(e));
                }
                received += chunk.len() as u64;
                pb.inc(chunk.len() as u64);
            }
            Some(Err(e)) => break Err(TransferError::Http(e)),
            None => break Ok(()),
        }
    };
    file.flush().await.map_err(local)?;
    file.get_ref().sync_all().await.map_err(local)?;
    streamed?;

    if let Some(expected) = content_length {
        if received != expected {
            return Err(TransferError::Truncated {
                expected,
                received,
            });
        }
    } else {
        warn!(
            "Content-Length header was not present for {}. Cannot verify transfer size.",
            url
        );
    }

    Ok(existing + received)
}

/// Sends a GET, asking for the bytes after `offset` when it is non-zero.
async fn send(
    client: &reqwest::Client,
    config: &FetchConfig,
    url: &str,
    offset: u64,
) -> Result<reqwest::Response, TransferError> {
    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={}-", offset));
    }

    let response = timeout(config.request_timeout, request.send())
        .await
        .map_err(|_| TransferError::Timeout(config.request_timeout))??;
    Ok(response)
}

/// A per-file progress bar, hidden unless enabled and stderr is a terminal.
pub(crate) fn progress_bar(enabled: bool, length: Option<u64>, name: &str) -> indicatif::ProgressBar {
    if !enabled || !atty::is(atty::Stream::Stderr) {
        return indicatif::ProgressBar::hidden();
    }

    let pb = indicatif::ProgressBar::new(length.unwrap_or(0));
    if let Ok(style) = indicatif::ProgressStyle::default_bar().template(
        "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg} | {elapsed_precise} elapsed, ETA {eta_precise}",
    ) {
        pb.set_style(style.progress_chars("█▓▒░ "));
    }
    pb.set_message(name.to_string());
    pb
}
