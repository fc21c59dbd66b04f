use clap::Parser;
use dropbox_cli::cmd::authenticate::execute_authenticate;
use dropbox_cli::cmd::cli::{Cli, Command};
use dropbox_cli::cmd::config::Settings;
use dropbox_cli::cmd::logging;
use dropbox_cli::cmd::upload::execute_upload;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let settings = Settings::load(cli.config)?;

    match cli.command {
        Command::Authenticate(args) => {
            execute_authenticate(args, &settings).await?;
        }
        Command::UploadFiles(args) => {
            execute_upload(args, &settings).await?;
        }
    }
    Ok(())
}
