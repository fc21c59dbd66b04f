use std::path::PathBuf;

use reqwest::StatusCode;

/// Errors returned by the Dropbox API library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to access credentials file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse credentials file {path:?}: {source}")]
    CredentialsParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize credentials: {0}")]
    CredentialsSerialize(#[from] toml::ser::Error),

    /// Network failure or timeout before a response arrived.
    #[error("{operation}: request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with a status >= 400. `body` is the raw response text.
    #[error("{operation}: request failed ({status}): {body:?}")]
    Api {
        operation: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("{operation}: failed to decode response: {source}")]
    Decode {
        operation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode request argument: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
