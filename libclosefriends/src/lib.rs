//! CloseFriends - automation core for Instagram close-friends lists
//!
//! This library connects Instagram accounts on behalf of a user, retrieves
//! their followers and adds them to the account's close-friends list in paced,
//! resumable batches. The web layer and the operator CLI both sit on top of
//! [`service`].

pub mod accounts;
pub mod batch;
pub mod config;
pub mod error;
pub mod followers;
pub mod lease;
pub mod logging;
pub mod pacing;
pub mod platforms;
pub mod quota;
pub mod service;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use accounts::{AccountStore, AccountUpdate};
pub use config::Config;
pub use error::{CloseFriendsError, Result};
pub use quota::{FileQuotaStore, Quota, QuotaStore};
pub use service::{AccountService, CloseFriendsService, Outcome};
pub use types::{Account, AccountConfig, AccountSummary, JobKind};
