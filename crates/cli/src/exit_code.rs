// Consistent exit codes for the checkin CLI.
//
//   0  = success
//   1  = general error
//   2  = usage/argument error
//   11 = authentication error
//   13 = network error

use std::process;

use checkin_client::http::ApiError;

/// Named exit codes for the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Error = 1,
    Usage = 2,
    Auth = 11,
    Network = 13,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map an anyhow error to an exit code by inspecting the error chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<AuthError>().is_some() {
            return Self::Auth;
        }

        for cause in err.chain() {
            if cause.downcast_ref::<AuthError>().is_some() {
                return Self::Auth;
            }
            if let Some(api_err) = cause.downcast_ref::<ApiError>() {
                return Self::from_status(api_err.status.as_u16());
            }
            if let Some(http_err) = cause.downcast_ref::<reqwest::Error>() {
                if http_err.is_connect() || http_err.is_timeout() {
                    return Self::Network;
                }
            }
            if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
                return match io_err.kind() {
                    std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut => Self::Network,
                    _ => Self::Error,
                };
            }
        }

        Self::Error
    }

    /// Map a backend HTTP status to an exit code.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            400 | 404 | 422 => Self::Usage,
            502..=504 => Self::Network,
            _ => Self::Error,
        }
    }
}

impl From<ExitCode> for process::ExitCode {
    fn from(code: ExitCode) -> Self {
        process::ExitCode::from(code.code() as u8)
    }
}

/// Authentication failure raised by the CLI itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No identity is persisted locally.
    NotSignedIn,
    /// The backend refused the credentials.
    Rejected(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotSignedIn => write!(f, "not signed in"),
            Self::Rejected(detail) => write!(f, "login rejected: {detail}"),
        }
    }
}

impl std::error::Error for AuthError {}
