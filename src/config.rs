#![forbid(unsafe_code)]

//! Runtime settings shared by the three binaries.
//!
//! Precedence, highest first: command-line flags, process environment, the
//! `.env` file, built-in defaults. Blank values count as unset at every layer.

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DOWNLOAD_DIR: &str = "./Downloads";
pub const DEFAULT_WWW_ROOT: &str = "./www";
pub const DEFAULT_SERVER_PORT: u16 = 5000;
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_YTDLP_PROGRAM: &str = "yt-dlp";

const KEY_TOKEN: &str = "TELEGRAM_TOKEN";
const KEY_DOWNLOAD_DIR: &str = "DOWNLOAD_FOLDER";
const KEY_WWW_ROOT: &str = "WWW_ROOT";
const KEY_HOST: &str = "MEDIADROP_HOST";
const KEY_PORT: &str = "MEDIADROP_PORT";
const KEY_YTDLP: &str = "YTDLP_BIN";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub download_dir: PathBuf,
    pub www_root: PathBuf,
    pub server_host: String,
    pub server_port: u16,
    pub bot_token: Option<String>,
    pub ytdlp_program: PathBuf,
}

impl RuntimeSettings {
    pub fn require_bot_token(&self) -> Result<&str> {
        self.bot_token
            .as_deref()
            .ok_or_else(|| anyhow!("{KEY_TOKEN} not set (checked environment and .env)"))
    }
}

/// Command-line values; `None` defers to the lower layers.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_dir: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub server_port: Option<u16>,
    pub server_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

/// Reads `.env` (or `overrides.env_path`) and the process environment.
pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(settings_from_layers(
        &file_vars,
        |key| env::var(key).ok(),
        overrides,
    ))
}

/// Environment and `.env` lookups, environment first.
struct Layers<'a, F> {
    file_vars: &'a HashMap<String, String>,
    env_lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Layers<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.env_lookup)(key)
            .and_then(non_blank)
            .or_else(|| self.file_vars.get(key).cloned().and_then(non_blank))
    }

    fn path(&self, key: &str) -> Option<PathBuf> {
        self.get(key).map(PathBuf::from)
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn settings_from_layers(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let layers = Layers {
        file_vars,
        env_lookup,
    };

    RuntimeSettings {
        download_dir: overrides
            .download_dir
            .or_else(|| layers.path(KEY_DOWNLOAD_DIR))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
        www_root: overrides
            .www_root
            .or_else(|| layers.path(KEY_WWW_ROOT))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT)),
        server_host: overrides
            .server_host
            .and_then(non_blank)
            .or_else(|| layers.get(KEY_HOST))
            .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
        // An unparsable port falls back rather than aborting startup.
        server_port: overrides
            .server_port
            .or_else(|| layers.get(KEY_PORT).and_then(|port| port.parse().ok()))
            .unwrap_or(DEFAULT_SERVER_PORT),
        bot_token: layers.get(KEY_TOKEN),
        ytdlp_program: layers
            .path(KEY_YTDLP)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_PROGRAM)),
    }
}

/// Parses a dotenv-style file. A missing file is an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().filter_map(parse_env_line).collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// `KEY=value`, optionally prefixed with `export` and quoted with `"` or `'`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), unquote(value.trim()).to_string()))
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| value.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(value)
}
