//! Minimal Dropbox API client: OAuth2 token exchange and single-request
//! file upload, plus credential resolution.

pub mod client;
pub mod content_hash;
pub mod credentials;
pub mod error;
pub mod oauth;
pub mod types;

pub use client::Client;
pub use credentials::{load_credentials, write_credentials, Credentials, Resolver};
pub use error::{Error, Result};
