//! Core types for CloseFriends

use serde::{Deserialize, Serialize};

use crate::config::DefaultsConfig;
use crate::error::{AccountError, CloseFriendsError, Result};

/// Per-account tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountConfig {
    pub followers_batch_size: u32,
    /// Seconds; the actual cooldown is drawn from `[batch_cooldown, 2 * batch_cooldown]`
    pub batch_cooldown: u64,
    pub max_followers: u32,
    pub action_delay_min: u64,
    pub action_delay_max: u64,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            followers_batch_size: 200,
            batch_cooldown: 60,
            max_followers: 100,
            action_delay_min: 2,
            action_delay_max: 5,
        }
    }
}

impl AccountConfig {
    pub fn from_defaults(defaults: &DefaultsConfig, max_followers: u32) -> Self {
        Self {
            followers_batch_size: defaults.followers_batch_size,
            batch_cooldown: defaults.batch_cooldown,
            max_followers,
            action_delay_min: defaults.action_delay_min,
            action_delay_max: defaults.action_delay_max,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.followers_batch_size == 0 {
            return Err(CloseFriendsError::InvalidInput(
                "followers_batch_size must be at least 1".to_string(),
            ));
        }
        if self.max_followers == 0 {
            return Err(CloseFriendsError::InvalidInput(
                "max_followers must be at least 1".to_string(),
            ));
        }
        if self.action_delay_min > self.action_delay_max {
            return Err(CloseFriendsError::InvalidInput(format!(
                "action_delay_min ({}) must not exceed action_delay_max ({})",
                self.action_delay_min, self.action_delay_max
            )));
        }
        Ok(())
    }
}

/// A connected Instagram account, persisted as `accounts/<username>.json`
///
/// The password is stored as entered so background jobs can log in again
/// without the user.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub config: AccountConfig,
    #[serde(default)]
    pub adding_to_close_friends: bool,
    #[serde(default)]
    pub getting_followers: bool,
    #[serde(default)]
    pub followers_count: u32,
    /// Amount this account currently holds in the owner's allocation
    #[serde(default)]
    pub allocated: u32,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("config", &self.config)
            .field("adding_to_close_friends", &self.adding_to_close_friends)
            .field("getting_followers", &self.getting_followers)
            .field("followers_count", &self.followers_count)
            .field("allocated", &self.allocated)
            .finish()
    }
}

impl Account {
    pub fn new(username: &str, password: &str, config: AccountConfig) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            config,
            adding_to_close_friends: false,
            getting_followers: false,
            followers_count: 0,
            allocated: 0,
        }
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            username: self.username.clone(),
            followers_count: self.followers_count,
            adding_to_close_friends: self.adding_to_close_friends,
            getting_followers: self.getting_followers,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.adding_to_close_friends || self.getting_followers
    }
}

/// What the account listing shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub username: String,
    pub followers_count: u32,
    pub adding_to_close_friends: bool,
    pub getting_followers: bool,
}

/// Status flags on the account record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFlag {
    AddingToCloseFriends,
    GettingFollowers,
}

/// Kind of background job run against one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    GetFollowers,
    AddToCloseFriends,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::GetFollowers => write!(f, "get_followers"),
            JobKind::AddToCloseFriends => write!(f, "add_to_close_friends"),
        }
    }
}

impl JobKind {
    /// The status flag that mirrors this job on the account record
    pub fn flag(&self) -> StatusFlag {
        match self {
            JobKind::GetFollowers => StatusFlag::GettingFollowers,
            JobKind::AddToCloseFriends => StatusFlag::AddingToCloseFriends,
        }
    }
}

/// Validate an Instagram username before it becomes a path component
///
/// Rules:
/// - 1 to 30 characters
/// - ASCII letters, digits, periods and underscores only
/// - Not `.` or `..`
pub fn validate_username(name: &str) -> Result<()> {
    validate_name(name, 30, &['.', '_'], "username")
}

/// Validate an owning user's name (the web layer's login name)
pub fn validate_owner(name: &str) -> Result<()> {
    validate_name(name, 64, &['.', '_', '-'], "owner")
}

fn validate_name(name: &str, max_len: usize, extra: &[char], what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(AccountError::InvalidName(format!("{} cannot be empty", what)).into());
    }

    if name.len() > max_len {
        return Err(AccountError::InvalidName(format!(
            "{} too long: {} characters (max {})",
            what,
            name.len(),
            max_len
        ))
        .into());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || extra.contains(&c))
    {
        return Err(AccountError::InvalidName(format!(
            "Invalid {} '{}'. Allowed: letters, digits, {}",
            what,
            name,
            extra.iter().map(|c| format!("'{}'", c)).collect::<Vec<_>>().join(" ")
        ))
        .into());
    }

    if name == "." || name == ".." {
        return Err(AccountError::InvalidName(format!("Reserved {} '{}'", what, name)).into());
    }

    Ok(())
}
