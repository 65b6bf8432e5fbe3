#![forbid(unsafe_code)]

//! Wrapper around the `yt-dlp` executable.
//!
//! Every download is two engine calls: `--dump-single-json` to learn the title,
//! uploader and duration, then the real download with
//! `--print after_move:filepath` so yt-dlp tells us where the merged or
//! transcoded file ended up. Files are named `<title>.<ext>` inside the output
//! directory; same-titled sources overwrite each other.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use anyhow::bail;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// yt-dlp output template, relative to the output directory.
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

/// Closed choice between a muxed video file and an audio-only file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FormatSelector {
    Video,
    Audio,
}

impl FormatSelector {
    /// Extension of the file left behind once merging/transcoding finished.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Video => "mp4",
            Self::Audio => "mp3",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    fn engine_args(self) -> &'static [&'static str] {
        match self {
            Self::Video => &["-f", "bv*+ba/b", "--merge-output-format", "mp4"],
            Self::Audio => &[
                "-f",
                "bestaudio/best",
                "-x",
                "--audio-format",
                "mp3",
                "--audio-quality",
                "192K",
            ],
        }
    }
}

/// What a successful download hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub path: PathBuf,
    pub title: Option<String>,
    pub uploader: Option<String>,
    /// Seconds, rounded.
    pub duration: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no URL given")]
    EmptyUrl,
    #[error("could not launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("could not prepare {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    Engine(String),
    #[error("could not read metadata from the download engine: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("the download engine did not report an output file")]
    MissingOutput,
    #[error("download task aborted: {0}")]
    Aborted(String),
}

/// Seam between callers (batch runner, chat flow) and the engine.
pub trait Downloader: Send + Sync {
    /// Downloads `url` and returns the produced file. Blocks until the engine
    /// exits.
    fn download(&self, url: &str, format: FormatSelector) -> Result<DownloadResult, DownloadError>;

    /// Asks the engine which file a download of `url` would produce, without
    /// downloading it.
    fn expected_filename(&self, url: &str, format: FormatSelector)
    -> Result<PathBuf, DownloadError>;
}

#[derive(Deserialize)]
struct MediaInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
}

/// The production [`Downloader`]: shells out to yt-dlp.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
    output_dir: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            output_dir: output_dir.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Runs `<engine> --version` to fail loudly when yt-dlp is missing.
    pub fn ensure_available(&self) -> anyhow::Result<()> {
        let status = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => bail!(
                "{} is installed but returned a failure status",
                self.program.display()
            ),
            Err(err) => bail!(
                "{} is not installed or not in PATH: {}",
                self.program.display(),
                err
            ),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.stdin(Stdio::null());
        command
    }

    fn output_template(&self) -> String {
        self.output_dir
            .join(OUTPUT_TEMPLATE)
            .to_string_lossy()
            .into_owned()
    }

    /// Runs the prepared command and returns its stdout. yt-dlp sometimes exits
    /// 0 after a postprocessor failure, so any `ERROR` on stderr also counts.
    fn run(&self, mut command: Command) -> Result<String, DownloadError> {
        let output = command.output().map_err(|source| DownloadError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() || stderr.contains("ERROR") {
            return Err(DownloadError::Engine(engine_failure_message(
                &self.program,
                &stderr,
                output.status,
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn fetch_info(&self, url: &str) -> Result<MediaInfo, DownloadError> {
        let mut command = self.command();
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--")
            .arg(url);
        let stdout = self.run(command)?;
        Ok(serde_json::from_str(&stdout)?)
    }
}

impl Downloader for YtDlp {
    fn download(&self, url: &str, format: FormatSelector) -> Result<DownloadResult, DownloadError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::EmptyUrl);
        }
        fs::create_dir_all(&self.output_dir).map_err(|source| DownloadError::OutputDir {
            path: self.output_dir.display().to_string(),
            source,
        })?;

        let info = self.fetch_info(url)?;
        debug!(url, title = ?info.title, "resolved metadata");

        let mut command = self.command();
        command
            .args(format.engine_args())
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--no-simulate")
            .arg("--print")
            .arg("after_move:filepath")
            .arg("--output")
            .arg(self.output_template())
            .arg("--")
            .arg(url);
        let stdout = self.run(command)?;

        let path = last_line(&stdout)
            .map(PathBuf::from)
            .ok_or(DownloadError::MissingOutput)?;
        if !path.is_file() {
            return Err(DownloadError::MissingOutput);
        }
        info!(url, path = %path.display(), format = format.label(), "download finished");

        Ok(DownloadResult {
            path,
            title: info.title,
            uploader: info.uploader.or(info.channel),
            duration: info
                .duration
                .filter(|value| value.is_finite() && *value >= 0.0)
                .map(|value| value.round() as u64),
        })
    }

    fn expected_filename(
        &self,
        url: &str,
        format: FormatSelector,
    ) -> Result<PathBuf, DownloadError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::EmptyUrl);
        }
        let mut command = self.command();
        command
            .args(format.engine_args())
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--get-filename")
            .arg("--output")
            .arg(self.output_template())
            .arg("--")
            .arg(url);
        let stdout = self.run(command)?;
        let predicted = last_line(&stdout).ok_or_else(|| {
            DownloadError::Engine(format!("could not determine the file name for {url}"))
        })?;
        // --get-filename reports the pre-postprocessing extension.
        Ok(PathBuf::from(predicted).with_extension(format.extension()))
    }
}

fn last_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

fn engine_failure_message(program: &Path, stderr: &str, status: ExitStatus) -> String {
    let errors: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.contains("ERROR"))
        .collect();
    if !errors.is_empty() {
        return errors.join("\n");
    }
    let trimmed = stderr.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    format!("{} exited with {}", program.display(), status)
}
