#![forbid(unsafe_code)]

//! Cached listing of the directory the file server currently exposes.
//!
//! Browsers poll `/list` aggressively, so a listing is reused for
//! [`CATALOG_TTL`] before the directory is read again. Uploads and directory
//! switches call [`Catalog::invalidate`] (or switch through
//! [`Catalog::set_dir`], which does it for them) so their effect shows up
//! immediately.
//!
//! Locking: `state` guards the active directory and the cached listing; it is
//! never held while the disk is read. `refresh` serializes rescans so that
//! concurrent readers of a stale cache trigger a single scan. A generation
//! counter, bumped on every invalidation, keeps a scan that raced with a
//! directory switch from being installed.

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant, UNIX_EPOCH},
};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::security::safe_relative_path;

/// How long a listing stays valid. Fixed for the lifetime of the process.
pub const CATALOG_TTL: Duration = Duration::from_secs(5);

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac"];
const PDF_EXTENSIONS: &[&str] = &["pdf"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Image,
    Video,
    Audio,
    Pdf,
    Folder,
    Other,
}

/// One row of `/list`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    /// Bytes; always 0 for folders.
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub mtime: f64,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

/// Maps a file name to its media kind by (case-insensitive) extension.
pub fn classify(name: &str) -> EntryKind {
    let Some(ext) = Path::new(name).extension().and_then(|ext| ext.to_str()) else {
        return EntryKind::Other;
    };
    let ext = ext.to_ascii_lowercase();
    let ext = ext.as_str();
    if IMAGE_EXTENSIONS.contains(&ext) {
        EntryKind::Image
    } else if VIDEO_EXTENSIONS.contains(&ext) {
        EntryKind::Video
    } else if AUDIO_EXTENSIONS.contains(&ext) {
        EntryKind::Audio
    } else if PDF_EXTENSIONS.contains(&ext) {
        EntryKind::Pdf
    } else {
        EntryKind::Other
    }
}

/// Produces the entries of one directory. Swappable so tests can count scans.
pub trait DirectoryScanner: Send + Sync {
    fn scan(&self, dir: &Path) -> io::Result<Vec<CatalogEntry>>;
}

/// Reads direct children from disk, skipping dot-files, sorted by name.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsScanner;

impl DirectoryScanner for FsScanner {
    fn scan(&self, dir: &Path) -> io::Result<Vec<CatalogEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            // Follow symlinks; a dangling one is simply not listed.
            let metadata = match fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!(name = %name, error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let (kind, size) = if metadata.is_dir() {
                (EntryKind::Folder, 0)
            } else if metadata.is_file() {
                (classify(&name), metadata.len())
            } else {
                continue;
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0);
            entries.push(CatalogEntry {
                name,
                size,
                mtime,
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

struct Listing {
    entries: Arc<Vec<CatalogEntry>>,
    computed_at: Instant,
}

struct CatalogState {
    active_dir: PathBuf,
    generation: u64,
    listing: Option<Listing>,
}

/// The served directory plus its cached listing.
pub struct Catalog<S = FsScanner> {
    scanner: S,
    ttl: Duration,
    default_dir: PathBuf,
    state: RwLock<CatalogState>,
    refresh: Mutex<()>,
}

impl Catalog<FsScanner> {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::with_scanner(dir, FsScanner)
    }
}

impl<S: DirectoryScanner> Catalog<S> {
    /// `dir` becomes both the active directory and the fallback used by
    /// [`Catalog::default_dir`].
    pub fn with_scanner(dir: impl AsRef<Path>, scanner: S) -> Result<Self, CatalogError> {
        let dir = existing_dir(dir.as_ref())?;
        Ok(Self {
            scanner,
            ttl: CATALOG_TTL,
            default_dir: dir.clone(),
            state: RwLock::new(CatalogState {
                active_dir: dir,
                generation: 0,
                listing: None,
            }),
            refresh: Mutex::new(()),
        })
    }

    #[cfg(test)]
    fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn active_dir(&self) -> PathBuf {
        self.state.read().active_dir.clone()
    }

    pub fn default_dir(&self) -> &Path {
        &self.default_dir
    }

    /// Returns the listing of the active directory, rescanning when the cached
    /// one is missing or older than the TTL.
    pub fn list(&self) -> io::Result<Arc<Vec<CatalogEntry>>> {
        if let Some(entries) = self.fresh_listing() {
            return Ok(entries);
        }

        let _refresh = self.refresh.lock();
        loop {
            // Whoever held `refresh` before us may already have done the work.
            if let Some(entries) = self.fresh_listing() {
                return Ok(entries);
            }

            let (dir, generation) = {
                let state = self.state.read();
                (state.active_dir.clone(), state.generation)
            };
            let started = Instant::now();
            let entries = Arc::new(self.scanner.scan(&dir)?);

            let mut state = self.state.write();
            if state.generation != generation {
                debug!(dir = %dir.display(), "catalog changed during scan; rescanning");
                continue;
            }
            state.listing = Some(Listing {
                entries: entries.clone(),
                computed_at: started,
            });
            debug!(dir = %dir.display(), count = entries.len(), "catalog refreshed");
            return Ok(entries);
        }
    }

    /// Drops the cached listing so the next [`Catalog::list`] rescans.
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        state.listing = None;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Switches the served directory. Invalid paths leave everything as it was.
    pub fn set_dir(&self, path: &Path) -> Result<PathBuf, CatalogError> {
        let dir = existing_dir(path)?;
        let mut state = self.state.write();
        state.active_dir = dir.clone();
        state.listing = None;
        state.generation = state.generation.wrapping_add(1);
        info!(dir = %dir.display(), "serving new directory");
        Ok(dir)
    }

    /// Maps a client-supplied relative name to a regular file inside the
    /// active directory.
    pub fn resolve_file(&self, name: &str) -> Option<PathBuf> {
        let relative = safe_relative_path(name)?;
        let path = self.state.read().active_dir.join(relative);
        path.is_file().then_some(path)
    }

    fn fresh_listing(&self) -> Option<Arc<Vec<CatalogEntry>>> {
        let state = self.state.read();
        state
            .listing
            .as_ref()
            .filter(|listing| listing.computed_at.elapsed() < self.ttl)
            .map(|listing| listing.entries.clone())
    }
}

fn existing_dir(path: &Path) -> Result<PathBuf, CatalogError> {
    match fs::canonicalize(path) {
        Ok(dir) if dir.is_dir() => Ok(dir),
        _ => Err(CatalogError::NotADirectory(path.to_path_buf())),
    }
}
