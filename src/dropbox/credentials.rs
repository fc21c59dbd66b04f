//! Credential resolution.
//!
//! Credentials are assembled by a [`Resolver`]: an ordered list of
//! [`CredentialSource`]s, each filling the fields it knows about. Later
//! sources overwrite earlier ones, so the usual order is file, then
//! environment, then explicit values from the command line.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

pub const KEY_APP_KEY: &str = "dropbox-app-key";
pub const KEY_APP_SECRET: &str = "dropbox-app-secret";
pub const KEY_ACCESS_TOKEN: &str = "dropbox-access-token";
pub const KEY_REFRESH_TOKEN: &str = "dropbox-refresh-token";

pub const ENV_APP_KEY: &str = "DROPBOX_APP_KEY";
pub const ENV_APP_SECRET: &str = "DROPBOX_APP_SECRET";
pub const ENV_ACCESS_TOKEN: &str = "DROPBOX_ACCESS_TOKEN";
pub const ENV_REFRESH_TOKEN: &str = "DROPBOX_REFRESH_TOKEN";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "dropbox-app-key", default)]
    pub app_key: String,
    #[serde(rename = "dropbox-app-secret", default)]
    pub app_secret: String,
    #[serde(rename = "dropbox-access-token", default)]
    pub access_token: String,
    #[serde(rename = "dropbox-refresh-token", default)]
    pub refresh_token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(s: &str) -> &'static str {
            if s.is_empty() {
                ""
            } else {
                "***"
            }
        }
        f.debug_struct("Credentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &redact(&self.app_secret))
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .finish()
    }
}

/// A set of credential fields where each one may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialCredentials {
    #[serde(rename = "dropbox-app-key")]
    pub app_key: Option<String>,
    #[serde(rename = "dropbox-app-secret")]
    pub app_secret: Option<String>,
    #[serde(rename = "dropbox-access-token")]
    pub access_token: Option<String>,
    #[serde(rename = "dropbox-refresh-token")]
    pub refresh_token: Option<String>,
}

impl PartialCredentials {
    fn apply(self, creds: &mut Credentials) {
        if let Some(v) = self.app_key {
            creds.app_key = v;
        }
        if let Some(v) = self.app_secret {
            creds.app_secret = v;
        }
        if let Some(v) = self.access_token {
            creds.access_token = v;
        }
        if let Some(v) = self.refresh_token {
            creds.refresh_token = v;
        }
    }

    fn without_empty(self) -> Self {
        let keep = |v: Option<String>| v.filter(|s| !s.is_empty());
        Self {
            app_key: keep(self.app_key),
            app_secret: keep(self.app_secret),
            access_token: keep(self.access_token),
            refresh_token: keep(self.refresh_token),
        }
    }
}

/// One link of the resolver chain.
pub trait CredentialSource: Send + Sync {
    /// Overwrite the fields of `creds` this source defines.
    fn fill(&self, creds: &mut Credentials) -> Result<()>;
}

/// Reads credentials from a TOML file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    required: bool,
}

impl FileSource {
    /// A missing file is an error.
    pub fn required(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: true,
        }
    }

    /// A missing file is skipped. An unreadable or malformed one is still an error.
    pub fn optional(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required: false,
        }
    }
}

impl CredentialSource for FileSource {
    fn fill(&self, creds: &mut Credentials) -> Result<()> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound && !self.required => {
                tracing::debug!(path = %self.path.display(), "credentials file not found, skipping");
                return Ok(());
            }
            Err(source) => {
                return Err(Error::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let partial: PartialCredentials =
            toml::from_str(&contents).map_err(|source| Error::CredentialsParse {
                path: self.path.clone(),
                source,
            })?;
        tracing::debug!(path = %self.path.display(), "loaded credentials file");
        partial.apply(creds);
        Ok(())
    }
}

type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reads `DROPBOX_*` environment variables. Unset or empty variables are skipped.
#[derive(Clone)]
pub struct EnvSource {
    lookup: Lookup,
}

impl fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSource").finish_non_exhaustive()
    }
}

impl EnvSource {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Use a custom variable lookup instead of the process environment.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
        }
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialSource for EnvSource {
    fn fill(&self, creds: &mut Credentials) -> Result<()> {
        PartialCredentials {
            app_key: (self.lookup)(ENV_APP_KEY),
            app_secret: (self.lookup)(ENV_APP_SECRET),
            access_token: (self.lookup)(ENV_ACCESS_TOKEN),
            refresh_token: (self.lookup)(ENV_REFRESH_TOKEN),
        }
        .without_empty()
        .apply(creds);
        Ok(())
    }
}

/// Fixed values, e.g. from command-line flags. Empty values are skipped.
#[derive(Debug, Clone, Default)]
pub struct StaticSource(pub PartialCredentials);

impl CredentialSource for StaticSource {
    fn fill(&self, creds: &mut Credentials) -> Result<()> {
        self.0.clone().without_empty().apply(creds);
        Ok(())
    }
}

#[derive(Default)]
pub struct Resolver {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl CredentialSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Run every source in order. Fields nobody defines stay empty.
    pub fn resolve(&self) -> Result<Credentials> {
        let mut creds = Credentials::default();
        for source in &self.sources {
            source.fill(&mut creds)?;
        }
        Ok(creds)
    }
}

/// Credentials file first, environment second.
pub fn load_credentials(path: &Path) -> Result<Credentials> {
    Resolver::new()
        .with(FileSource::required(path))
        .with(EnvSource::new())
        .resolve()
}

/// Persist `creds` to `path`, keeping any other keys already in the file.
pub fn write_credentials(path: &Path, creds: &Credentials) -> Result<()> {
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut table = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str::<toml::Table>(&contents).map_err(|source| Error::CredentialsParse {
                path: path.to_path_buf(),
                source,
            })?
        }
        Err(e) if e.kind() == ErrorKind::NotFound => toml::Table::new(),
        Err(e) => return Err(io_err(e)),
    };

    for (key, value) in [
        (KEY_APP_KEY, &creds.app_key),
        (KEY_APP_SECRET, &creds.app_secret),
        (KEY_ACCESS_TOKEN, &creds.access_token),
        (KEY_REFRESH_TOKEN, &creds.refresh_token),
    ] {
        table.insert(key.to_string(), toml::Value::String(value.clone()));
    }
    let contents = toml::to_string(&table)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    std::fs::write(path, contents).map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
    }

    tracing::info!(path = %path.display(), "credentials written");
    Ok(())
}
