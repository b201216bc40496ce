use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{bail, Context, Result};
use clap::Args;
use tracing::warn;

use checkin_client::config::ClientConfig;
use checkin_client::http::ApiError;

use super::{render_identity, CliSession, IdentityOutput};
use crate::exit_code::AuthError;
use crate::output::{print_output, OutputFormat};

#[derive(Debug, Args)]
pub struct LoginArgs {
    /// Account name on the check-in backend
    pub username: String,

    /// Read the password from stdin instead of prompting
    #[arg(long)]
    pub password_stdin: bool,
}

pub async fn run(args: LoginArgs, config: &ClientConfig, format: OutputFormat) -> Result<()> {
    let password = read_password(&mut io::stdin().lock(), args.password_stdin || !io::stdin().is_terminal())?;
    let session = CliSession::open(config)?;

    let identity = match session.store.login(&args.username, &password).await {
        Ok(identity) => identity,
        Err(error) => {
            let rejected = error
                .chain()
                .find_map(|cause| cause.downcast_ref::<ApiError>())
                .filter(|api_error| api_error.status.is_client_error())
                .map(|api_error| api_error.detail.clone());
            return Err(match rejected {
                Some(detail) => error.context(AuthError::Rejected(detail)),
                None => error,
            });
        }
    };

    if let Err(error) = session.save_cookies() {
        warn!(error = %format!("{error:#}"), "failed to persist backend cookies");
    }

    print_output(format, &IdentityOutput { signed_in: true, identity: &identity }, |output| {
        render_identity(output.identity)
    })?;
    Ok(())
}

fn read_password<R: BufRead>(input: &mut R, from_stdin: bool) -> Result<String> {
    if !from_stdin {
        let mut err = io::stderr().lock();
        write!(err, "Password: ")?;
        err.flush()?;
    }

    let mut line = String::new();
    input.read_line(&mut line).context("failed to read password")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}
