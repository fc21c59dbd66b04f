use std::future::Future;
use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;

use crate::cmd::cli::AuthenticateArgs;
use crate::cmd::config::Settings;
use crate::cmd::listener::{interrupt_signal, RedirectListener, WaitOutcome};
use crate::dropbox::credentials::{
    EnvSource, FileSource, PartialCredentials, Resolver, StaticSource,
};
use crate::dropbox::oauth::{authorize_url, Pkce};
use crate::dropbox::types::TokenRequest;
use crate::dropbox::{write_credentials, Client, Credentials};

/// The user-facing side of the login: key prompt and browser.
pub trait Interaction: Send + Sync + 'static {
    /// Block until a key is pressed. `false` means the user chose to quit.
    fn confirm(&self) -> io::Result<bool>;

    fn open_browser(&self, url: &str) -> io::Result<()>;
}

/// Reads a single raw key from the terminal and opens the system browser.
pub struct Terminal {
    pub no_browser: bool,
}

struct RawModeGuard;

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

impl Interaction for Terminal {
    fn confirm(&self) -> io::Result<bool> {
        terminal::enable_raw_mode()?;
        let _guard = RawModeGuard;

        loop {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let quit = match key.code {
                    KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => true,
                    KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
                    _ => false,
                };
                return Ok(!quit);
            }
        }
    }

    fn open_browser(&self, url: &str) -> io::Result<()> {
        if self.no_browser {
            println!("🔗 Open this URL to log in:\n{}", url);
            return Ok(());
        }
        println!("🌐 Opening browser to {}", url);
        open::that(url)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthenticateOptions {
    pub port: Option<u16>,
    pub pkce: bool,
    /// Values given on the command line; they win over file and environment.
    pub overrides: PartialCredentials,
    pub env: EnvSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizeOutcome {
    Authenticated(Credentials),
    /// The user quit or the process was interrupted. Nothing was written.
    Cancelled,
}

/// Run the browser login and store the resulting tokens in the config file.
pub async fn authenticate<F>(
    settings: &Settings,
    options: AuthenticateOptions,
    interaction: Arc<dyn Interaction>,
    interrupt: F,
) -> Result<AuthorizeOutcome>
where
    F: Future<Output = ()>,
{
    let credentials = Resolver::new()
        .with(FileSource::optional(&settings.config_path))
        .with(options.env)
        .with(StaticSource(options.overrides))
        .resolve()
        .context("failed to load credentials")?;

    if credentials.app_key.is_empty() {
        bail!("missing app key: pass --app-key or set DROPBOX_APP_KEY");
    }
    if !options.pkce && credentials.app_secret.is_empty() {
        bail!("missing app secret: pass --app-secret, set DROPBOX_APP_SECRET or use --pkce");
    }

    let client = Client::builder()
        .auth_endpoint(&settings.auth_endpoint)
        .credentials(credentials.clone())
        .build()?;

    let listener = RedirectListener::bind(options.port.unwrap_or(settings.port)).await?;
    let redirect_uri = listener.redirect_uri();
    let pkce = options.pkce.then(Pkce::generate);
    let url = authorize_url(
        &settings.authorize_url,
        &credentials.app_key,
        &redirect_uri,
        pkce.as_ref(),
    )
    .context("invalid authorize URL")?;

    println!("Press any key to open the browser to login or 'q' to exit:");
    let prompt = Arc::clone(&interaction);
    let confirmed = match tokio::task::spawn_blocking(move || prompt.confirm()).await {
        Ok(Ok(confirmed)) => confirmed,
        Ok(Err(e)) => {
            listener.shutdown().await;
            return Err(e).context("failed to read input");
        }
        Err(e) => {
            listener.shutdown().await;
            return Err(e).context("failed to read input");
        }
    };
    if !confirmed {
        listener.shutdown().await;
        return Ok(AuthorizeOutcome::Cancelled);
    }

    if let Err(e) = interaction.open_browser(url.as_str()) {
        listener.shutdown().await;
        return Err(e).context("failed to open browser for authorization");
    }

    println!("⏳ Waiting for authorization...");
    let code = match listener.wait(interrupt).await? {
        WaitOutcome::Code(code) => code,
        WaitOutcome::Interrupted => return Ok(AuthorizeOutcome::Cancelled),
    };

    let mut request = TokenRequest::authorization_code(code, redirect_uri);
    if let Some(pkce) = pkce {
        request = request
            .with_client(&credentials.app_key, "")
            .with_code_verifier(pkce.verifier);
    }
    let token = client
        .oauth2_token(&request)
        .await
        .context("failed to get access token from dropbox")?;
    tracing::info!(account_id = %token.account_id, "token exchange complete");

    let stored = Credentials {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        ..credentials
    };
    write_credentials(&settings.config_path, &stored).context("failed to save credentials")?;

    Ok(AuthorizeOutcome::Authenticated(stored))
}

/// Run the `authenticate` command.
pub async fn execute_authenticate(args: AuthenticateArgs, settings: &Settings) -> Result<()> {
    let options = AuthenticateOptions {
        port: args.port,
        pkce: args.pkce,
        overrides: PartialCredentials {
            app_key: args.app_key,
            app_secret: args.app_secret,
            ..Default::default()
        },
        env: EnvSource::new(),
    };
    let interaction = Arc::new(Terminal {
        no_browser: args.no_browser,
    });

    match authenticate(settings, options, interaction, interrupt_signal()).await? {
        AuthorizeOutcome::Authenticated(_) => {
            println!("✅ Authenticated! Credentials saved to {}", settings.config_path.display());
        }
        AuthorizeOutcome::Cancelled => println!("exit"),
    }
    Ok(())
}
