// Signed-in identity, kept in memory and in durable storage.
//
// Every mutating call writes durable storage before memory, so a reader
// of `user()` never sees an identity that was not persisted. Logout clears
// storage, then memory, before talking to the backend.

pub mod storage;

use anyhow::Result;
use checkin_common::identity::SessionIdentity;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::http::AuthApi;

pub use storage::{FileIdentityStorage, IdentityStorage, MemoryIdentityStorage};

/// Logout signed out in memory but left the identity record in storage.
#[derive(Debug, Error)]
#[error("stored identity could not be removed")]
pub struct IdentityNotCleared {
    /// The backend logout failure, when that call failed as well.
    pub backend: Option<String>,
}

pub struct SessionStore<A: AuthApi, S: IdentityStorage> {
    api: A,
    storage: S,
    user_tx: watch::Sender<Option<SessionIdentity>>,
}

impl<A: AuthApi, S: IdentityStorage> SessionStore<A, S> {
    pub fn new(api: A, storage: S) -> Self {
        let (user_tx, _) = watch::channel(None);
        Self { api, storage, user_tx }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Snapshot of the current identity.
    pub fn user(&self) -> Option<SessionIdentity> {
        self.user_tx.borrow().clone()
    }

    pub fn watch_user(&self) -> watch::Receiver<Option<SessionIdentity>> {
        self.user_tx.subscribe()
    }

    pub fn is_signed_in(&self) -> bool {
        self.user_tx.borrow().is_some()
    }

    /// Persist `identity`, then make it current. On a storage failure the
    /// in-memory identity is left unchanged.
    pub fn set_user(&self, identity: SessionIdentity) -> Result<()> {
        self.storage.save(&identity)?;
        self.user_tx.send_replace(Some(identity));
        Ok(())
    }

    /// Adopt the persisted identity, if any. A record that cannot be read
    /// is treated as absent.
    pub fn load_user(&self) -> Option<SessionIdentity> {
        match self.storage.load() {
            Ok(Some(identity)) => {
                debug!(username = ?identity.username, "loaded persisted identity");
                self.user_tx.send_replace(Some(identity.clone()));
                Some(identity)
            }
            Ok(None) => None,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "ignoring unreadable identity record");
                None
            }
        }
    }

    /// Obtain the CSRF cookie, authenticate, store the minimal identity and
    /// then try to enrich it from the profile endpoint.
    ///
    /// Fails without storing anything when the CSRF or login request fails.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionIdentity> {
        if let Err(err) = self.api.fetch_csrf_token().await {
            error!(username, error = %format!("{err:#}"), "login failed: CSRF step");
            return Err(err);
        }

        let minimal = match self.api.login(username, password).await {
            Ok(identity) => identity,
            Err(err) => {
                error!(username, error = %format!("{err:#}"), "login failed");
                return Err(err);
            }
        };

        self.set_user(minimal.clone())?;
        info!(username, "signed in");

        Ok(self.fetch_user_profile().await.unwrap_or(minimal))
    }

    /// Replace the identity with the backend profile. Failures are logged
    /// and the previous identity is kept.
    pub async fn fetch_user_profile(&self) -> Option<SessionIdentity> {
        match self.api.fetch_profile().await {
            Ok(profile) => {
                if let Err(err) = self.set_user(profile) {
                    warn!(error = %format!("{err:#}"), "failed to persist profile");
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "profile refresh failed; keeping previous identity");
            }
        }
        self.user()
    }

    /// Restore the persisted identity and refresh it when one was found.
    pub async fn restore(&self) -> Option<SessionIdentity> {
        self.load_user()?;
        self.fetch_user_profile().await
    }

    /// Clear the identity locally, then end the backend session.
    ///
    /// The in-memory identity is always cleared. A storage failure is
    /// reported as [`IdentityNotCleared`] (carrying any backend failure);
    /// otherwise a backend failure is returned as is.
    pub async fn logout(&self) -> Result<()> {
        let cleared = self.storage.clear();
        self.user_tx.send_replace(None);
        if let Err(err) = &cleared {
            error!(error = %format!("{err:#}"), "failed to remove persisted identity");
        }

        let ended = self.api.logout().await;
        match (cleared, ended) {
            (Ok(()), Ok(())) => {
                info!("signed out");
                Ok(())
            }
            (Ok(()), Err(err)) => Err(err),
            (Err(err), ended) => {
                let backend = ended.err().map(|backend| format!("{backend:#}"));
                Err(err.context(IdentityNotCleared { backend }))
            }
        }
    }
}
