//! Per-user account storage
//!
//! Every connected Instagram account owns four artifacts under the owning
//! user's directory:
//!
//! ```text
//! <data_dir>/<owner>/accounts/<username>.json        account record
//! <data_dir>/<owner>/followers/<username>.txt        follower ids, one per line
//! <data_dir>/<owner>/last_added/<username>.txt       checkpoint
//! <data_dir>/<owner>/cache/<username>_session.json   session cache
//! ```
//!
//! Records are written through a temp file and renamed into place. No locking
//! happens here; one writer per account is the caller's job (see `lease`).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::error::{AccountError, Result, StorageError};
use crate::platforms::SessionState;
use crate::types::{validate_owner, validate_username, Account, AccountSummary, StatusFlag};

const SUBDIRS: [&str; 5] = ["accounts", "cache", "followers", "last_added", "leases"];

#[derive(Debug, Clone)]
pub struct AccountStore {
    root: PathBuf,
    owner: String,
}

/// Changes applied by [`AccountStore::update`]
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub username: Option<String>,
    pub password: Option<String>,
    pub max_followers: Option<u32>,
}

impl AccountStore {
    /// Open the store for one owning user, creating its directories
    pub fn open(data_dir: &Path, owner: &str) -> Result<Self> {
        validate_owner(owner)?;
        let root = data_dir.join(owner);
        for sub in SUBDIRS {
            let dir = root.join(sub);
            std::fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
        }
        Ok(Self {
            root,
            owner: owner.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn account_path(&self, username: &str) -> PathBuf {
        self.root.join("accounts").join(format!("{}.json", username))
    }

    fn followers_path(&self, username: &str) -> PathBuf {
        self.root.join("followers").join(format!("{}.txt", username))
    }

    fn checkpoint_path(&self, username: &str) -> PathBuf {
        self.root.join("last_added").join(format!("{}.txt", username))
    }

    fn session_path(&self, username: &str) -> PathBuf {
        self.root
            .join("cache")
            .join(format!("{}_session.json", username))
    }

    pub(crate) fn lease_path(&self, username: &str) -> PathBuf {
        self.root.join("leases").join(format!("{}.lease", username))
    }

    /// Artifacts in the fixed order used for rename and delete
    fn artifacts(&self, username: &str) -> [PathBuf; 4] {
        [
            self.account_path(username),
            self.followers_path(username),
            self.checkpoint_path(username),
            self.session_path(username),
        ]
    }

    pub fn exists(&self, username: &str) -> bool {
        self.account_path(username).exists()
    }

    /// Persist a new account record; fails if the username is taken
    pub fn create(&self, account: &Account) -> Result<()> {
        validate_username(&account.username)?;
        account.config.validate()?;

        if self.exists(&account.username) {
            return Err(AccountError::AlreadyExists(account.username.clone()).into());
        }

        self.save(account)?;
        info!(owner = %self.owner, username = %account.username, "Account created");
        Ok(())
    }

    pub fn load(&self, username: &str) -> Result<Account> {
        validate_username(username)?;
        let path = self.account_path(username);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(AccountError::NotFound(username.to_string()).into())
            }
            Err(e) => return Err(StorageError::io(&path, e).into()),
        };

        let mut account: Account =
            serde_json::from_str(&content).map_err(|e| StorageError::serde(&path, e))?;

        // The file name is authoritative (a rename may have been interrupted
        // before the record was rewritten).
        if account.username != username {
            warn!(
                recorded = %account.username,
                username,
                "Account record name differs from its file name"
            );
            account.username = username.to_string();
        }

        Ok(account)
    }

    pub fn save(&self, account: &Account) -> Result<()> {
        validate_username(&account.username)?;
        let path = self.account_path(&account.username);
        let json = serde_json::to_string_pretty(account).map_err(|e| StorageError::serde(&path, e))?;
        write_atomic(&path, json.as_bytes(), true)
    }

    /// Load, mutate and save a record in one step
    pub fn modify<F>(&self, username: &str, apply: F) -> Result<Account>
    where
        F: FnOnce(&mut Account),
    {
        let mut account = self.load(username)?;
        apply(&mut account);
        self.save(&account)?;
        Ok(account)
    }

    pub fn set_flag(&self, username: &str, flag: StatusFlag, value: bool) -> Result<()> {
        self.modify(username, |account| match flag {
            StatusFlag::AddingToCloseFriends => account.adding_to_close_friends = value,
            StatusFlag::GettingFollowers => account.getting_followers = value,
        })?;
        debug!(username, ?flag, value, "Status flag updated");
        Ok(())
    }

    /// Clear a status flag on an error path
    ///
    /// Never fails: the record may already be gone (bad-credentials cleanup),
    /// and the original error is what the caller reports.
    pub fn clear_flag(&self, username: &str, flag: StatusFlag) {
        match self.set_flag(username, flag, false) {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => error!(username, ?flag, error = %e, "Failed to clear status flag"),
        }
    }

    /// Apply credential/cap changes, renaming all artifacts when the username changes
    pub fn update(&self, old_username: &str, update: &AccountUpdate) -> Result<Account> {
        let mut account = self.load(old_username)?;
        if let Some(password) = &update.password {
            account.password = password.clone();
        }
        if let Some(max_followers) = update.max_followers {
            account.config.max_followers = max_followers;
        }
        account.config.validate()?;

        let target = match update.username.as_deref() {
            Some(new) if new != old_username => {
                validate_username(new)?;
                if self.exists(new) {
                    return Err(AccountError::AlreadyExists(new.to_string()).into());
                }
                self.rename(old_username, new)?;
                new.to_string()
            }
            _ => old_username.to_string(),
        };

        account.username = target;
        self.save(&account)?;
        info!(owner = %self.owner, old_username, username = %account.username, "Account updated");
        Ok(account)
    }

    /// Move every artifact from `old` to `new`
    ///
    /// Renames run in a fixed order (record, followers, checkpoint, session).
    /// If one fails, the ones already moved are moved back so the account stays
    /// reachable under `old`.
    pub fn rename(&self, old: &str, new: &str) -> Result<()> {
        validate_username(old)?;
        validate_username(new)?;

        let from = self.artifacts(old);
        let to = self.artifacts(new);
        let mut moved: Vec<usize> = Vec::new();

        for (i, (src, dst)) in from.iter().zip(to.iter()).enumerate() {
            if !src.exists() {
                continue;
            }
            if let Err(e) = std::fs::rename(src, dst) {
                error!(
                    old,
                    new,
                    artifact = %src.display(),
                    error = %e,
                    "Rename failed, rolling back"
                );
                for &j in moved.iter().rev() {
                    if let Err(undo) = std::fs::rename(&to[j], &from[j]) {
                        error!(
                            artifact = %to[j].display(),
                            error = %undo,
                            "Rollback of rename failed; artifact left under new name"
                        );
                    }
                }
                return Err(StorageError::io(src, e).into());
            }
            moved.push(i);
        }

        info!(owner = %self.owner, old, new, "Renamed account artifacts");
        Ok(())
    }

    /// Remove an account and everything attached to it
    ///
    /// Missing artifacts are fine. Returns the record if there was one.
    pub fn delete(&self, username: &str) -> Result<Option<Account>> {
        let account = match self.load(username) {
            Ok(account) => Some(account),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(username, error = %e, "Unreadable account record, deleting anyway");
                None
            }
        };

        for path in self.artifacts(username) {
            remove_if_exists(&path);
        }

        info!(owner = %self.owner, username, "Account deleted");
        Ok(account)
    }

    /// Remove only the account record (fail-closed credential policy)
    pub fn remove_record(&self, username: &str) {
        remove_if_exists(&self.account_path(username));
    }

    /// Summaries of every account, unordered
    pub fn list(&self) -> Result<Vec<AccountSummary>> {
        let dir = self.root.join("accounts");
        let entries = std::fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut accounts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(username) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(username) {
                Ok(account) => accounts.push(account.summary()),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable account record"),
            }
        }
        Ok(accounts)
    }

    /// True when a non-empty follower list is on disk
    pub fn has_followers(&self, username: &str) -> bool {
        std::fs::metadata(self.followers_path(username))
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Follower ids in stored order; a missing list reads as empty
    pub fn read_followers(&self, username: &str) -> Result<Vec<String>> {
        let path = self.followers_path(username);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(StorageError::io(&path, e).into()),
        }
    }

    pub fn write_followers(&self, username: &str, followers: &[String]) -> Result<()> {
        let path = self.followers_path(username);
        let mut content = String::with_capacity(followers.len() * 12);
        for id in followers {
            content.push_str(id);
            content.push('\n');
        }
        write_atomic(&path, content.as_bytes(), false)
    }

    pub fn remove_followers(&self, username: &str) {
        remove_if_exists(&self.followers_path(username));
    }

    pub fn read_checkpoint(&self, username: &str) -> Result<Option<String>> {
        let path = self.checkpoint_path(username);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let id = content.trim();
                Ok((!id.is_empty()).then(|| id.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&path, e).into()),
        }
    }

    pub fn write_checkpoint(&self, username: &str, subject_id: &str) -> Result<()> {
        write_atomic(&self.checkpoint_path(username), subject_id.as_bytes(), false)
    }

    pub fn clear_checkpoint(&self, username: &str) {
        remove_if_exists(&self.checkpoint_path(username));
    }

    /// The cached session, if present and non-empty
    pub fn read_session(&self, username: &str) -> Result<Option<SessionState>> {
        let path = self.session_path(username);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e).into()),
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupted session cache, ignoring");
                Ok(None)
            }
        }
    }

    pub fn write_session(&self, username: &str, state: &SessionState) -> Result<()> {
        let path = self.session_path(username);
        let json = serde_json::to_string(state).map_err(|e| StorageError::serde(&path, e))?;
        write_atomic(&path, json.as_bytes(), true)
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`
fn write_atomic(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    std::fs::write(&tmp, bytes).map_err(|e| StorageError::io(&tmp, e))?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| StorageError::io(&tmp, e))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
