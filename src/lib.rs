//! Dropbox command-line client.
//!
//! - `dropbox`: the API library (credentials, token exchange, upload).
//! - `cmd`: the CLI commands built on top of it.

pub mod cmd;
pub mod dropbox;
