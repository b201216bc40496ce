use anyhow::Result;
use clap::Args;

use checkin_client::config::ClientConfig;

use super::{render_identity, CliSession, IdentityOutput};
use crate::exit_code::AuthError;
use crate::output::{print_output, OutputFormat};

#[derive(Debug, Args)]
pub struct WhoamiArgs {}

pub fn run(_args: WhoamiArgs, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    let session = CliSession::open(config)?;
    let identity = session.store.load_user().ok_or(AuthError::NotSignedIn)?;

    print_output(format, &IdentityOutput { signed_in: true, identity: &identity }, |output| {
        render_identity(output.identity)
    })?;
    Ok(())
}
