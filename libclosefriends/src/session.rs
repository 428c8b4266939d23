//! Session manager
//!
//! Produces an authenticated client for one account. A cached session is
//! probed first; an expired one keeps its device identity and falls through to
//! a fresh login with the stored credentials. Challenges come back as errors
//! carrying the kind of code the caller must collect. Nothing here retries.

use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::error::{Result, SessionError};
use crate::platforms::{
    InstagramClient, LoginCodes, LoginOutcome, LoginRequest, ProbeOutcome, SessionState,
};
use crate::types::Account;

/// How an authentication ended up succeeding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    /// The cached session passed the probe
    Cached,
    /// A fresh login was needed
    Login,
}

pub struct SessionManager<'a> {
    store: &'a AccountStore,
}

impl<'a> SessionManager<'a> {
    pub fn new(store: &'a AccountStore) -> Self {
        Self { store }
    }

    /// Authenticate `client` as the stored `account`
    ///
    /// On `BadCredentials` the account record is deleted and
    /// `InvalidCredentials` is returned: a password the service has rejected
    /// is never tried again by a background job.
    pub async fn authenticate(
        &self,
        client: &mut dyn InstagramClient,
        account: &Account,
        codes: &LoginCodes,
    ) -> Result<SessionSource> {
        let username = account.username.as_str();

        let device = match self.store.read_session(username)? {
            Some(cached) if !cached.is_empty() => {
                client.load_state(cached.clone());
                match client.probe().await? {
                    ProbeOutcome::Valid => {
                        debug!(username, "Cached session is valid");
                        self.store.write_session(username, &client.dump_state())?;
                        return Ok(SessionSource::Cached);
                    }
                    ProbeOutcome::AuthRequired => {
                        info!(username, "Cached session expired, logging in again");
                        cached.without_credentials()
                    }
                }
            }
            _ => {
                debug!(username, "No cached session");
                SessionState::new_device()
            }
        };

        client.load_state(device);
        match login(client, username, &account.password, codes).await {
            Ok(()) => {
                self.store.write_session(username, &client.dump_state())?;
                Ok(SessionSource::Login)
            }
            Err(SessionError::InvalidCredentials) => {
                warn!(
                    owner = self.store.owner(),
                    username, "Stored password rejected, removing account record"
                );
                self.store.remove_record(username);
                Err(SessionError::InvalidCredentials.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Log in with credentials that are not stored yet
    ///
    /// Used when connecting or re-validating an account. The device identity
    /// cached under `device_of` is reused when present. Returns the session to
    /// persist once the account is saved; nothing is written or deleted here.
    pub async fn login_fresh(
        &self,
        client: &mut dyn InstagramClient,
        device_of: &str,
        username: &str,
        password: &str,
        codes: &LoginCodes,
    ) -> Result<SessionState> {
        let device = self
            .store
            .read_session(device_of)?
            .map(|cached| cached.without_credentials())
            .filter(|state| !state.is_empty())
            .unwrap_or_else(SessionState::new_device);
        client.load_state(device);

        login(client, username, password, codes).await?;
        Ok(client.dump_state())
    }
}

async fn login(
    client: &mut dyn InstagramClient,
    username: &str,
    password: &str,
    codes: &LoginCodes,
) -> std::result::Result<(), SessionError> {
    let request = LoginRequest::new(username, password).with_codes(codes);
    match client.login(request).await {
        LoginOutcome::Success => {
            info!(username, "Logged in");
            Ok(())
        }
        LoginOutcome::ChallengeRequired => {
            info!(username, "Login needs a verification code");
            Err(SessionError::VerificationCodeRequired)
        }
        LoginOutcome::TwoFactorRequired => {
            info!(username, "Login needs a two-factor code");
            Err(SessionError::TwoFactorCodeRequired)
        }
        LoginOutcome::BadCredentials => Err(SessionError::InvalidCredentials),
        LoginOutcome::UnknownError(message) => {
            warn!(username, error = %message, "Login failed");
            Err(SessionError::UnknownService(message))
        }
    }
}
