//! Error types for CloseFriends

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CloseFriendsError>;

/// User-facing wording for challenge and credential failures.
pub const VERIFICATION_CODE_REQUIRED: &str =
    "Enter the verification code sent to your email or phone number";
pub const TWO_FACTOR_CODE_REQUIRED: &str =
    "Two-factor authentication is required. Please enter the code sent to your email or phone number";
pub const INVALID_CREDENTIALS: &str = "Incorrect username or password. Please try again.";
pub const UNKNOWN_SERVICE_ERROR: &str = "Please enter a valid security code and try again";

#[derive(Error, Debug)]
pub enum CloseFriendsError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Account(#[from] AccountError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl CloseFriendsError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CloseFriendsError::InvalidInput(_) => 3,
            CloseFriendsError::Account(AccountError::InvalidName(_)) => 3,
            CloseFriendsError::Session(_) => 2,
            _ => 1,
        }
    }

    /// The kind of code the caller has to collect before retrying, if any.
    pub fn pending_code(&self) -> Option<CodeKind> {
        match self {
            CloseFriendsError::Session(SessionError::VerificationCodeRequired) => {
                Some(CodeKind::Verification)
            }
            CloseFriendsError::Session(SessionError::TwoFactorCodeRequired) => {
                Some(CodeKind::TwoFactor)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloseFriendsError::Account(AccountError::NotFound(_)))
    }
}

/// Which one-time code a login is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Verification,
    TwoFactor,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StorageError::Serde {
            path: path.into(),
            source,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AccountError {
    #[error("An account with the username '{0}' already exists")]
    AlreadyExists(String),

    #[error("Account '{0}' does not exist")]
    NotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("{}", VERIFICATION_CODE_REQUIRED)]
    VerificationCodeRequired,

    #[error("{}", TWO_FACTOR_CODE_REQUIRED)]
    TwoFactorCodeRequired,

    #[error("{}", INVALID_CREDENTIALS)]
    InvalidCredentials,

    #[error("{}", UNKNOWN_SERVICE_ERROR)]
    UnknownService(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Followers already retrieved for {0}. To get followers again, reset this account's followers.")]
    AlreadyRetrieved(String),

    #[error("No followers found for {0}. Please select 'Get followers' before you can add followers to close friends.")]
    NoFollowersAvailable(String),

    #[error("Checkpoint '{checkpoint}' for {username} is not in the follower list")]
    Inconsistency { username: String, checkpoint: String },

    #[error("A job is already running for {0}")]
    InProgress(String),

    #[error("Job for {username} stopped unexpectedly: {reason}")]
    Crashed { username: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("Allocation exceeded: requested {requested}, {available} of {max} remaining")]
    Exceeded { requested: u32, available: u32, max: u32 },
}

/// Failures reported by the service-side capabilities.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}
