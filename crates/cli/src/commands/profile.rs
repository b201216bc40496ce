use anyhow::Result;
use clap::Args;
use tracing::warn;

use checkin_client::config::ClientConfig;

use super::{render_identity, CliSession, IdentityOutput};
use crate::exit_code::AuthError;
use crate::output::{print_output, OutputFormat};

#[derive(Debug, Args)]
pub struct ProfileArgs {}

pub async fn run(_args: ProfileArgs, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    let session = CliSession::open(config)?;
    let identity = session.store.restore().await.ok_or(AuthError::NotSignedIn)?;

    if let Err(error) = session.save_cookies() {
        warn!(error = %format!("{error:#}"), "failed to persist backend cookies");
    }

    print_output(format, &IdentityOutput { signed_in: true, identity: &identity }, |output| {
        render_identity(output.identity)
    })?;
    Ok(())
}
