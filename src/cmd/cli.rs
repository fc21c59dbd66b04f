use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::dropbox::types::WriteMode;

#[derive(Debug, Parser)]
#[command(name = "dropbox")]
#[command(about = "A Dropbox API client - authenticate and upload files")]
#[command(version)]
#[command(after_help = r#"
EXAMPLES:
  Log in through the browser and store tokens in the config file:
    dropbox authenticate --app-key <KEY> --app-secret <SECRET>

  Upload files into /backup/:
    dropbox upload-files -d /backup/ a.txt b.txt

ENVIRONMENT:
  DROPBOX_APP_KEY, DROPBOX_APP_SECRET, DROPBOX_ACCESS_TOKEN, DROPBOX_REFRESH_TOKEN
  override the values stored in the config file.
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (default is $HOME/.dropbox/config)
    #[arg(long, global = true, env = "DROPBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log more (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Authenticate user through the OAuth2 flow
    Authenticate(AuthenticateArgs),

    /// Upload files to Dropbox (do not use this to upload a file larger than 150 MiB)
    UploadFiles(UploadFilesArgs),
}

#[derive(Debug, Args)]
pub struct AuthenticateArgs {
    /// Dropbox application key
    #[arg(long)]
    pub app_key: Option<String>,

    /// Dropbox application secret
    #[arg(long)]
    pub app_secret: Option<String>,

    /// Listening port for the redirect URI server
    #[arg(short, long, env = "DROPBOX_PORT")]
    pub port: Option<u16>,

    /// Use PKCE instead of the app secret
    #[arg(long)]
    pub pkce: bool,

    /// Print the authorization URL instead of opening a browser
    #[arg(long)]
    pub no_browser: bool,
}

#[derive(Debug, Args)]
pub struct UploadFilesArgs {
    /// Local files to upload
    #[arg(required = true, num_args = 1..)]
    pub files: Vec<PathBuf>,

    /// Path in the user's Dropbox to save the files under
    #[arg(short = 'd', long, env = "DROPBOX_PATH")]
    pub dropbox_path: Option<String>,

    /// What to do when the file already exists
    #[arg(long, value_enum, default_value_t = ModeArg::Overwrite)]
    pub mode: ModeArg,

    /// Let Dropbox rename the file on conflict
    #[arg(long)]
    pub autorename: bool,

    /// Do not notify the user's desktop clients
    #[arg(long)]
    pub mute: bool,

    /// Treat identical content as a conflict too
    #[arg(long)]
    pub strict_conflict: bool,

    /// Send the content hash so Dropbox verifies the transfer
    #[arg(long)]
    pub content_hash: bool,

    /// Maximum number of uploads in flight
    #[arg(short = 'j', long, env = "DROPBOX_CONCURRENCY")]
    pub concurrency: Option<NonZeroUsize>,

    /// Exit with an error if any file fails to upload
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Add,
    Overwrite,
}

impl From<ModeArg> for WriteMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Add => WriteMode::Add,
            ModeArg::Overwrite => WriteMode::Overwrite,
        }
    }
}
