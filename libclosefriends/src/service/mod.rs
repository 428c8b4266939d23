//! Service layer for CloseFriends
//!
//! Two entry points sit on top of the stores and the job machinery:
//!
//! - [`AccountService`]: everything that only touches local state (listing,
//!   detail, delete, reset, checkpoint and lease maintenance, quota admin).
//!   The operator CLI uses this directly.
//! - [`CloseFriendsService`]: the operations a signed-in user triggers from the
//!   web layer. Connecting or updating an account logs in to Instagram;
//!   follower and close-friends requests are checked here and then handed to
//!   an [`AsyncDispatcher`]. Every operation returns an [`Outcome`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libclosefriends::platforms::mock::MockClientFactory;
//! use libclosefriends::quota::FileQuotaStore;
//! use libclosefriends::service::{CloseFriendsService, ConnectRequest};
//! use libclosefriends::Config;
//!
//! # async fn example() -> libclosefriends::Result<()> {
//! let config = Config::load()?;
//! let quotas = Arc::new(FileQuotaStore::new(config.data_path()));
//! let (service, _dispatcher) =
//!     CloseFriendsService::with_tokio(config, quotas, Arc::new(MockClientFactory::default()));
//!
//! let outcome = service
//!     .connect_account("web-user", ConnectRequest::new("alice", "hunter2", 100))
//!     .await;
//! println!("{}", outcome.message);
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod events;
pub mod jobs;

pub use dispatch::{AsyncDispatcher, TokioDispatcher};
pub use events::{Event, EventBus, EventReceiver};
pub use jobs::{Job, JobRunner};

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accounts::{AccountStore, AccountUpdate};
use crate::config::Config;
use crate::error::{AccountError, CloseFriendsError, CodeKind, JobError, Result};
use crate::lease::{self, LeaseRecord};
use crate::platforms::{ClientFactory, ClientOptions, LoginCodes};
use crate::quota::{Quota, QuotaLedger, QuotaStore};
use crate::session::SessionManager;
use crate::types::{validate_username, Account, AccountConfig, AccountSummary, JobKind};

/// What every user-facing operation reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    /// Set when the caller must collect a code and retry
    pub pending_code: Option<CodeKind>,
}

impl Outcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            pending_code: None,
        }
    }

    pub fn from_error(error: &CloseFriendsError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            pending_code: error.pending_code(),
        }
    }
}

impl From<Result<String>> for Outcome {
    fn from(result: Result<String>) -> Self {
        match result {
            Ok(message) => Outcome::ok(message),
            Err(e) => {
                warn!(error = %e, "Operation failed");
                Outcome::from_error(&e)
            }
        }
    }
}

/// Everything known about one account, minus its password
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountDetail {
    pub username: String,
    pub config: AccountConfig,
    pub followers_count: u32,
    pub allocated: u32,
    pub adding_to_close_friends: bool,
    pub getting_followers: bool,
    /// Entries in the stored follower list
    pub followers_stored: usize,
    pub checkpoint: Option<String>,
    /// Followers after the checkpoint; `None` when the checkpoint is not in the list
    pub remaining: Option<usize>,
    pub lease: Option<LeaseRecord>,
}

/// Local account maintenance
#[derive(Clone)]
pub struct AccountService {
    data_dir: PathBuf,
    quotas: Arc<dyn QuotaStore>,
}

impl AccountService {
    pub fn new(data_dir: impl Into<PathBuf>, quotas: Arc<dyn QuotaStore>) -> Self {
        Self {
            data_dir: data_dir.into(),
            quotas,
        }
    }

    pub fn from_config(config: &Config, quotas: Arc<dyn QuotaStore>) -> Self {
        Self::new(config.data_path(), quotas)
    }

    pub fn store(&self, owner: &str) -> Result<AccountStore> {
        AccountStore::open(&self.data_dir, owner)
    }

    fn ledger(&self) -> QuotaLedger<'_> {
        QuotaLedger::new(self.quotas.as_ref())
    }

    pub fn list(&self, owner: &str) -> Result<Vec<AccountSummary>> {
        self.store(owner)?.list()
    }

    pub fn detail(&self, owner: &str, username: &str) -> Result<AccountDetail> {
        let store = self.store(owner)?;
        let account = store.load(username)?;
        let followers = store.read_followers(username)?;
        let checkpoint = store.read_checkpoint(username)?;
        let remaining = match &checkpoint {
            None => Some(followers.len()),
            Some(id) => followers
                .iter()
                .position(|f| f == id)
                .map(|index| followers.len() - index - 1),
        };

        Ok(AccountDetail {
            username: account.username,
            config: account.config,
            followers_count: account.followers_count,
            allocated: account.allocated,
            adding_to_close_friends: account.adding_to_close_friends,
            getting_followers: account.getting_followers,
            followers_stored: followers.len(),
            checkpoint,
            remaining,
            lease: lease::current(&store, username)?,
        })
    }

    /// Delete an account and give its allocation back
    ///
    /// Stray artifacts are removed even when the record is already gone, in
    /// which case `NotFound` is still reported.
    pub fn delete(&self, owner: &str, username: &str) -> Result<()> {
        let store = self.store(owner)?;
        ensure_idle(&store, username)?;

        match store.delete(username)? {
            Some(account) => {
                if account.allocated > 0 {
                    self.ledger().release(owner, account.allocated)?;
                }
                Ok(())
            }
            None => Err(AccountError::NotFound(username.to_string()).into()),
        }
    }

    /// Drop the follower list, zero the count and release the allocation
    ///
    /// The checkpoint is kept. Returns the amount released.
    pub fn reset_followers(&self, owner: &str, username: &str) -> Result<u32> {
        let store = self.store(owner)?;
        ensure_idle(&store, username)?;

        let before = store.load(username)?;
        store.remove_followers(username);
        store.modify(username, |account| {
            account.followers_count = 0;
            account.allocated = 0;
        })?;

        if before.allocated > 0 {
            self.ledger().release(owner, before.allocated)?;
        }
        info!(owner, username, released = before.allocated, "Followers reset");
        Ok(before.allocated)
    }

    pub fn clear_checkpoint(&self, owner: &str, username: &str) -> Result<()> {
        let store = self.store(owner)?;
        ensure_idle(&store, username)?;
        store.load(username)?;
        store.clear_checkpoint(username);
        info!(owner, username, "Checkpoint cleared");
        Ok(())
    }

    /// Remove an expired lease and clear both status flags it left behind
    pub fn clear_stale_lease(&self, owner: &str, username: &str) -> Result<bool> {
        let store = self.store(owner)?;
        let removed = lease::clear_stale(&store, username)?;
        if store.exists(username) {
            store.modify(username, |account| {
                account.adding_to_close_friends = false;
                account.getting_followers = false;
            })?;
        }
        Ok(removed)
    }

    pub fn quota(&self, owner: &str) -> Result<Quota> {
        self.quotas.read(owner)
    }

    /// Set the ceiling granted to `owner`; the current allocation is untouched
    pub fn set_allocation_limit(&self, owner: &str, max: u32) -> Result<Quota> {
        let quota = self.quotas.modify(owner, &mut |quota: &mut Quota| {
            quota.max_close_friends_allocation = max;
            Ok(())
        })?;
        if quota.current_allocation > max {
            warn!(
                owner,
                current = quota.current_allocation,
                max,
                "Allocation limit is below what is already allocated"
            );
        }
        Ok(quota)
    }
}

/// Refuse while a job holds the account's lease
fn ensure_idle(store: &AccountStore, username: &str) -> Result<()> {
    if lease::current(store, username)?.is_some() {
        return Err(JobError::InProgress(username.to_string()).into());
    }
    Ok(())
}

/// Connecting a new Instagram account
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub username: String,
    pub password: String,
    pub max_followers: u32,
    pub codes: LoginCodes,
}

impl ConnectRequest {
    pub fn new(username: &str, password: &str, max_followers: u32) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            max_followers,
            codes: LoginCodes::default(),
        }
    }

    pub fn with_codes(mut self, codes: LoginCodes) -> Self {
        self.codes = codes;
        self
    }
}

/// Changing an existing account; `None` leaves a field as it is
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_followers: Option<u32>,
    pub codes: LoginCodes,
}

pub struct CloseFriendsService {
    config: Arc<Config>,
    accounts: AccountService,
    quotas: Arc<dyn QuotaStore>,
    clients: Arc<dyn ClientFactory>,
    dispatcher: Arc<dyn AsyncDispatcher>,
    events: EventBus,
}

impl CloseFriendsService {
    pub fn new(
        config: Arc<Config>,
        quotas: Arc<dyn QuotaStore>,
        clients: Arc<dyn ClientFactory>,
        dispatcher: Arc<dyn AsyncDispatcher>,
        events: EventBus,
    ) -> Self {
        let accounts = AccountService::from_config(&config, Arc::clone(&quotas));
        Self {
            config,
            accounts,
            quotas,
            clients,
            dispatcher,
            events,
        }
    }

    /// Service whose jobs run as tasks on the current tokio runtime
    pub fn with_tokio(
        config: Config,
        quotas: Arc<dyn QuotaStore>,
        clients: Arc<dyn ClientFactory>,
    ) -> (Self, Arc<TokioDispatcher>) {
        let config = Arc::new(config);
        let events = EventBus::default();
        let runner = JobRunner::new(
            Arc::clone(&config),
            Arc::clone(&clients),
            Arc::clone(&quotas),
            events.clone(),
        );
        let dispatcher = Arc::new(TokioDispatcher::new(runner));
        let service = Self::new(
            config,
            quotas,
            clients,
            Arc::clone(&dispatcher) as Arc<dyn AsyncDispatcher>,
            events,
        );
        (service, dispatcher)
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn ledger(&self) -> QuotaLedger<'_> {
        QuotaLedger::new(self.quotas.as_ref())
    }

    /// Log in with new credentials and save the account, reserving its cap
    pub async fn connect_account(&self, owner: &str, request: ConnectRequest) -> Outcome {
        self.connect(owner, &request)
            .await
            .map(|()| "Account connected successfully".to_string())
            .into()
    }

    async fn connect(&self, owner: &str, request: &ConnectRequest) -> Result<()> {
        let username = request.username.as_str();
        validate_username(username)?;
        let config = AccountConfig::from_defaults(&self.config.defaults, request.max_followers);
        config.validate()?;

        let store = self.accounts.store(owner)?;
        if store.exists(username) {
            return Err(AccountError::AlreadyExists(username.to_string()).into());
        }
        self.ledger().check(owner, request.max_followers)?;

        let mut client = self.clients.client(username, &ClientOptions::default());
        let session = SessionManager::new(&store)
            .login_fresh(
                &mut *client,
                username,
                username,
                &request.password,
                &request.codes,
            )
            .await?;

        self.ledger().reserve(owner, request.max_followers)?;
        let mut account = Account::new(username, &request.password, config);
        account.allocated = request.max_followers;
        if let Err(e) = store.create(&account) {
            self.ledger().release(owner, request.max_followers)?;
            return Err(e);
        }
        store.write_session(username, &session)?;
        Ok(())
    }

    /// Change username, password or follower cap
    ///
    /// New credentials are checked with a fresh login before anything is
    /// changed. A cap change moves the allocation by the difference.
    pub async fn update_account(
        &self,
        owner: &str,
        old_username: &str,
        request: UpdateRequest,
    ) -> Outcome {
        self.update(owner, old_username, &request)
            .await
            .map(|username| format!("Account '{}' updated successfully.", username))
            .into()
    }

    async fn update(&self, owner: &str, old_username: &str, request: &UpdateRequest) -> Result<String> {
        let store = self.accounts.store(owner)?;
        let account = store.load(old_username)?;
        ensure_idle(&store, old_username)?;

        let username = request
            .username
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(old_username);
        let password = request
            .password
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&account.password);
        let renamed = username != old_username;
        if renamed {
            validate_username(username)?;
            if store.exists(username) {
                return Err(AccountError::AlreadyExists(username.to_string()).into());
            }
        }

        let session = if renamed || password != account.password {
            let mut client = self.clients.client(username, &ClientOptions::default());
            let state = SessionManager::new(&store)
                .login_fresh(&mut *client, old_username, username, password, &request.codes)
                .await?;
            Some(state)
        } else {
            None
        };

        let new_cap = request.max_followers.unwrap_or(account.config.max_followers);
        let new_allocation = if account.allocated > 0 { new_cap } else { 0 };
        if new_allocation != account.allocated {
            self.ledger()
                .adjust(owner, account.allocated, new_allocation)?;
        }

        let update = AccountUpdate {
            username: renamed.then(|| username.to_string()),
            password: Some(password.to_string()),
            max_followers: request.max_followers,
        };
        let updated = match store.update(old_username, &update) {
            Ok(updated) => updated,
            Err(e) => {
                if new_allocation != account.allocated {
                    self.ledger()
                        .adjust(owner, new_allocation, account.allocated)?;
                }
                return Err(e);
            }
        };
        store.modify(&updated.username, |a| a.allocated = new_allocation)?;

        if let Some(state) = session {
            store.write_session(&updated.username, &state)?;
        }
        Ok(updated.username)
    }

    /// Check preconditions and queue a follower retrieval
    pub async fn request_followers(&self, owner: &str, username: &str) -> Outcome {
        self.queue_followers(owner, username)
            .await
            .map(|()| format!("We have started gathering followers for {}.", username))
            .into()
    }

    async fn queue_followers(&self, owner: &str, username: &str) -> Result<()> {
        let store = self.accounts.store(owner)?;
        let account = store.load(username)?;
        if store.has_followers(username) {
            return Err(JobError::AlreadyRetrieved(username.to_string()).into());
        }
        ensure_not_running(&store, &account)?;

        // A reset gave the allocation back; take it again
        let reserved = if account.allocated == 0 {
            let cap = account.config.max_followers;
            self.ledger().reserve(owner, cap)?;
            store.modify(username, |a| a.allocated = cap)?;
            cap
        } else {
            0
        };

        let job = Job::new(JobKind::GetFollowers, owner, username);
        if let Err(e) = self.dispatcher.enqueue(job).await {
            if reserved > 0 {
                self.ledger().release(owner, reserved)?;
                store.modify(username, |a| a.allocated = 0)?;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Check preconditions and queue a close-friends run
    pub async fn request_close_friends(&self, owner: &str, username: &str) -> Outcome {
        self.queue_close_friends(owner, username)
            .await
            .map(|()| format!("Adding followers of {} to close friends.", username))
            .into()
    }

    async fn queue_close_friends(&self, owner: &str, username: &str) -> Result<()> {
        let store = self.accounts.store(owner)?;
        let account = store.load(username)?;
        if !store.has_followers(username) {
            return Err(JobError::NoFollowersAvailable(username.to_string()).into());
        }
        ensure_not_running(&store, &account)?;

        self.dispatcher
            .enqueue(Job::new(JobKind::AddToCloseFriends, owner, username))
            .await
    }

    pub fn list_accounts(&self, owner: &str) -> Result<Vec<AccountSummary>> {
        self.accounts.list(owner)
    }

    pub fn delete_account(&self, owner: &str, username: &str) -> Outcome {
        self.accounts
            .delete(owner, username)
            .map(|()| format!("Account '{}' deleted successfully", username))
            .into()
    }

    pub fn reset_followers(&self, owner: &str, username: &str) -> Outcome {
        self.accounts
            .reset_followers(owner, username)
            .map(|_| "Account details reset successfully".to_string())
            .into()
    }

    pub fn clear_checkpoint(&self, owner: &str, username: &str) -> Outcome {
        self.accounts
            .clear_checkpoint(owner, username)
            .map(|()| format!("Checkpoint cleared for {}", username))
            .into()
    }
}

/// Refuse while a flag or a live lease says a job is running
fn ensure_not_running(store: &AccountStore, account: &Account) -> Result<()> {
    if account.is_busy() {
        return Err(JobError::InProgress(account.username.clone()).into());
    }
    ensure_idle(store, &account.username)
}
