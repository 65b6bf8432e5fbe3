#![forbid(unsafe_code)]

//! Batch downloader: `fetch <mp4|mp3> <url>... [--overwrite]`.
//!
//! URLs are processed one after another; failures are collected and listed at
//! the end instead of aborting the run.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use mediadrop_tools::{
    batch::{self, BatchReport},
    config::{RuntimeOverrides, resolve_runtime_settings},
    downloader::{FormatSelector, YtDlp},
    logging,
    security::ensure_not_root,
};
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Best video and audio merged into an MP4 file.
    Mp4,
    /// Best audio transcoded to MP3.
    Mp3,
}

impl From<Mode> for FormatSelector {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Mp4 => FormatSelector::Video,
            Mode::Mp3 => FormatSelector::Audio,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about = "Download media URLs as MP4 video or MP3 audio")]
struct FetchArgs {
    /// Output format.
    #[arg(value_enum)]
    mode: Mode,
    /// One or more media URLs.
    #[arg(required = true)]
    urls: Vec<String>,
    /// Download again even when the target file already exists.
    #[arg(long)]
    overwrite: bool,
    /// Destination directory (defaults to DOWNLOAD_FOLDER, then ./Downloads).
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = FetchArgs::parse();
    logging::init("info");
    ensure_not_root("fetch")?;

    let settings = resolve_runtime_settings(RuntimeOverrides {
        download_dir: args.output_dir.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;
    let ytdlp = YtDlp::new(settings.ytdlp_program.clone(), settings.download_dir.clone());
    ytdlp.ensure_available()?;

    let format = FormatSelector::from(args.mode);
    info!(
        count = args.urls.len(),
        format = format.label(),
        dir = %settings.download_dir.display(),
        "starting batch"
    );

    let report = batch::run(&ytdlp, args.urls.as_slice(), format, args.overwrite);
    print!("{}", render_summary(&report));
    Ok(())
}

fn render_summary(report: &BatchReport) -> String {
    let mut out = String::from("\n=== Summary ===\n");
    if report.all_succeeded() {
        out.push_str("🟢 Everything downloaded successfully!\n");
    } else {
        out.push_str("🔴 URLs not downloaded:\n");
        for url in &report.failed {
            out.push_str(&format!("   - {url}\n"));
        }
    }
    out
}
