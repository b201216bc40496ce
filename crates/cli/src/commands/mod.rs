// CLI subcommand dispatch.

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::Serialize;
use tracing::debug;

use checkin_client::config::ClientConfig;
use checkin_client::http::ApiClient;
use checkin_client::security::{remove_file_if_exists, write_private_file};
use checkin_client::session::{FileIdentityStorage, SessionStore};
use checkin_common::identity::SessionIdentity;

use crate::output::OutputFormat;

pub mod login;
pub mod logout;
pub mod profile;
pub mod watch;
pub mod whoami;

const COOKIES_FILE_NAME: &str = "cookies";

#[derive(Subcommand)]
pub enum Command {
    /// Sign in and store the identity locally
    Login(login::LoginArgs),
    /// Sign out locally and end the backend session
    Logout(logout::LogoutArgs),
    /// Show the locally stored identity (no network)
    Whoami(whoami::WhoamiArgs),
    /// Refresh the identity from the backend and show it
    Profile(profile::ProfileArgs),
    /// Stream live dashboard events
    Watch(watch::WatchArgs),
}

pub async fn run(cmd: Command, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        Command::Login(args) => login::run(args, config, format).await,
        Command::Logout(args) => logout::run(args, config, format).await,
        Command::Whoami(args) => whoami::run(args, config, format),
        Command::Profile(args) => profile::run(args, config, format).await,
        Command::Watch(args) => watch::run(args, config, format).await,
    }
}

/// Session store backed by the identity file, with the backend cookies
/// carried over between invocations.
pub(crate) struct CliSession {
    pub store: SessionStore<ApiClient, FileIdentityStorage>,
    cookies_path: PathBuf,
}

impl CliSession {
    pub fn open(config: &ClientConfig) -> Result<Self> {
        let api = ApiClient::new(config.api_base_url()?)?;
        let session_path = config.resolved_session_path()?;
        let cookies_path = session_path.with_file_name(COOKIES_FILE_NAME);

        match fs::read_to_string(&cookies_path) {
            Ok(header) => api.restore_cookies(header.trim()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read `{}`", cookies_path.display()))
            }
        }

        Ok(Self { store: SessionStore::new(api, FileIdentityStorage::new(session_path)), cookies_path })
    }

    pub fn save_cookies(&self) -> Result<()> {
        match self.store.api().cookie_header() {
            Some(header) => write_private_file(&self.cookies_path, header.as_bytes()),
            None => {
                debug!("no backend cookies to persist");
                Ok(())
            }
        }
    }

    pub fn forget_cookies(&self) -> Result<()> {
        remove_file_if_exists(&self.cookies_path)
    }
}

/// Identity as printed by the CLI.
#[derive(Debug, Serialize)]
pub(crate) struct IdentityOutput<'a> {
    pub signed_in: bool,
    #[serde(flatten)]
    pub identity: &'a SessionIdentity,
}

pub(crate) fn render_identity(identity: &SessionIdentity) -> String {
    let mut lines = Vec::new();
    let name = identity.display_name().unwrap_or("(unknown)");
    match identity.username.as_deref() {
        Some(username) if username != name => lines.push(format!("Signed in as {name} ({username})")),
        _ => lines.push(format!("Signed in as {name}")),
    }
    for key in ["email", "first_name", "last_name", "nickname"] {
        if let Some(value) = identity.field_str(key).filter(|value| !value.is_empty()) {
            lines.push(format!("  {key}: {value}"));
        }
    }
    lines.join("\n")
}
