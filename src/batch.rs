#![forbid(unsafe_code)]

//! Sequential multi-URL runner behind the `fetch` binary.
//!
//! Each URL is handled on its own: a failed probe or download is recorded and
//! the loop moves on. Nothing is retried.

use std::{collections::BTreeSet, path::PathBuf};

use tracing::{debug, warn};

use crate::downloader::{Downloader, FormatSelector};

/// Partition of the input URLs. A URL listed twice ends up wherever its last
/// attempt put it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: BTreeSet<String>,
    pub failed: BTreeSet<String>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, url: &str, ok: bool) {
        let (hit, miss) = if ok {
            (&mut self.succeeded, &mut self.failed)
        } else {
            (&mut self.failed, &mut self.succeeded)
        };
        miss.remove(url);
        hit.insert(url.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlOutcome {
    /// The predicted file was already on disk.
    Skipped(PathBuf),
    Downloaded(PathBuf),
    Failed(String),
}

impl UrlOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Downloads every URL in order and reports which ones made it.
pub fn run<S: AsRef<str>>(
    downloader: &dyn Downloader,
    urls: &[S],
    format: FormatSelector,
    overwrite: bool,
) -> BatchReport {
    let mut report = BatchReport::default();
    for url in urls {
        let url = url.as_ref();
        println!("▶️ Trying: {url}");
        let outcome = process_url(downloader, url, format, overwrite);
        match &outcome {
            UrlOutcome::Skipped(path) => {
                println!("⚠️ Already downloaded: {}", path.display());
            }
            UrlOutcome::Downloaded(path) => {
                println!("🟢 Downloaded: {url} -> {}\n", path.display());
            }
            UrlOutcome::Failed(message) => {
                println!("🔴 Failed: {url}");
                println!("{message}");
            }
        }
        report.record(url, outcome.is_success());
    }
    report
}

/// One URL: probe the target name unless overwriting, then download.
pub fn process_url(
    downloader: &dyn Downloader,
    url: &str,
    format: FormatSelector,
    overwrite: bool,
) -> UrlOutcome {
    if !overwrite {
        match downloader.expected_filename(url, format) {
            Ok(path) if path.exists() => return UrlOutcome::Skipped(path),
            Ok(path) => debug!(url, path = %path.display(), "target not on disk yet"),
            Err(err) => {
                warn!(url, error = %err, "could not determine target file name");
                return UrlOutcome::Failed(format!("could not determine the file name: {err}"));
            }
        }
    }

    match downloader.download(url, format) {
        Ok(result) => UrlOutcome::Downloaded(result.path),
        Err(err) => {
            warn!(url, error = %err, "download failed");
            UrlOutcome::Failed(err.to_string())
        }
    }
}
