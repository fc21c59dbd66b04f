use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::dropbox::types::{
    DEFAULT_AUTHORIZE_URL, DEFAULT_AUTH_ENDPOINT, DEFAULT_CONTENT_ENDPOINT,
};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DROPBOX_PATH: &str = "/";
pub const DEFAULT_CONCURRENCY: usize = 8;

/// Non-credential keys of the config file. Credential keys live in the same
/// file and are read by the credentials resolver.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ConfigFile {
    dropbox_path: Option<String>,
    port: Option<u16>,
    concurrency: Option<NonZeroUsize>,
    authorize_url: Option<String>,
    api_endpoint: Option<String>,
    content_endpoint: Option<String>,
}

/// Settings shared by every command, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: PathBuf,
    pub dropbox_path: String,
    pub port: u16,
    pub concurrency: NonZeroUsize,
    pub authorize_url: String,
    pub auth_endpoint: String,
    pub content_endpoint: String,
}

impl Settings {
    /// Load settings from `config`, or `$HOME/.dropbox/config` if not given.
    /// A missing file yields the defaults.
    pub fn load(config: Option<PathBuf>) -> Result<Self> {
        let config_path = match config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let file = read_config_file(&config_path)?;
        Ok(Self::from_file(config_path, file))
    }

    fn from_file(config_path: PathBuf, file: ConfigFile) -> Self {
        Self {
            config_path,
            dropbox_path: file
                .dropbox_path
                .unwrap_or_else(|| DEFAULT_DROPBOX_PATH.to_string()),
            port: file.port.unwrap_or(DEFAULT_PORT),
            concurrency: file
                .concurrency
                .or(NonZeroUsize::new(DEFAULT_CONCURRENCY))
                .unwrap_or(NonZeroUsize::MIN),
            authorize_url: file
                .authorize_url
                .unwrap_or_else(|| DEFAULT_AUTHORIZE_URL.to_string()),
            auth_endpoint: file
                .api_endpoint
                .unwrap_or_else(|| DEFAULT_AUTH_ENDPOINT.to_string()),
            content_endpoint: file
                .content_endpoint
                .unwrap_or_else(|| DEFAULT_CONTENT_ENDPOINT.to_string()),
        }
    }

    pub fn with_config_path(config_path: PathBuf) -> Self {
        Self::from_file(config_path, ConfigFile::default())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("could not determine home directory")?;
    Ok(home_dir.join(".dropbox").join("config"))
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(ConfigFile::default())
        }
        Err(e) => Err(e).with_context(|| format!("failed to read config file {}", path.display())),
    }
}
