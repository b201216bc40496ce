use anyhow::Result;
use clap::Args;
use serde::Serialize;

use checkin_client::config::ClientConfig;
use checkin_client::session::IdentityNotCleared;

use super::CliSession;
use crate::output::{print_output, print_warning, OutputFormat};

#[derive(Debug, Args)]
pub struct LogoutArgs {}

#[derive(Debug, Serialize)]
struct LogoutOutput {
    signed_in: bool,
    backend_session_ended: bool,
}

pub async fn run(_args: LogoutArgs, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    let session = CliSession::open(config)?;

    // Only a backend failure is downgraded to a warning; a stored identity
    // left on disk fails the command.
    let backend_session_ended = match session.store.logout().await {
        Ok(()) => true,
        Err(error) if error.downcast_ref::<IdentityNotCleared>().is_some() => {
            session.forget_cookies()?;
            return Err(error);
        }
        Err(error) => {
            print_warning(format, "LOGOUT_INCOMPLETE", &format!("signed out locally; backend logout failed: {error:#}"));
            false
        }
    };
    session.forget_cookies()?;

    let output = LogoutOutput { signed_in: false, backend_session_ended };
    print_output(format, &output, |_| "Signed out".to_string())?;
    Ok(())
}
