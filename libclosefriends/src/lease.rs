//! Per-account job lease
//!
//! At most one job may touch an account's follower list, checkpoint and
//! status flags at a time. A lease is a small JSON file at
//! `leases/<username>.lease` naming its holder and an expiry. It is created
//! with an exclusive link so two workers can never both acquire it, renewed
//! while the job makes progress, and removed by its holder when the job ends.
//! A lease whose expiry has passed belongs to a crashed worker and may be
//! taken over.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::AccountStore;
use crate::error::{JobError, Result, StorageError};
use crate::types::{validate_username, JobKind};

const TAKEOVER_ATTEMPTS: usize = 3;

/// Contents of a lease file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: Uuid,
    pub job: JobKind,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A held lease. Dropping it does not release the file; call [`Lease::release`].
#[derive(Debug)]
pub struct Lease {
    path: PathBuf,
    username: String,
    record: LeaseRecord,
    ttl: Duration,
}

impl Lease {
    /// Take the lease for `username`, or fail with `JobError::InProgress`
    pub fn acquire(
        store: &AccountStore,
        username: &str,
        job: JobKind,
        ttl: Duration,
    ) -> Result<Lease> {
        validate_username(username)?;
        let path = store.lease_path(username);
        let now = Utc::now();
        let record = LeaseRecord {
            holder: Uuid::new_v4(),
            job,
            acquired_at: now,
            expires_at: expiry(now, ttl),
        };

        for _ in 0..TAKEOVER_ATTEMPTS {
            if create_exclusive(&path, &record)? {
                debug!(username, job = %job, holder = %record.holder, "Lease acquired");
                return Ok(Lease {
                    path,
                    username: username.to_string(),
                    record,
                    ttl,
                });
            }

            let existing = read_record(&path)?;
            if let Some(current) = &existing {
                if !current.is_expired(Utc::now()) {
                    return Err(JobError::InProgress(username.to_string()).into());
                }
            }

            if !move_stale_aside(&path, existing.as_ref(), &record.holder)? {
                return Err(JobError::InProgress(username.to_string()).into());
            }
            warn!(username, job = %job, "Took over an expired lease");
        }

        Err(JobError::InProgress(username.to_string()).into())
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// Extend the expiry to cover a pause of `pause` plus one TTL of work
    ///
    /// Fails with `JobError::InProgress` if another worker has taken the lease
    /// over in the meantime.
    pub fn renew(&mut self, pause: Duration) -> Result<()> {
        self.ensure_held()?;
        let now = Utc::now();
        let mut record = self.record.clone();
        record.expires_at = expiry(now, self.ttl.saturating_add(pause));
        write_record(&self.path, &record)?;
        self.record = record;
        Ok(())
    }

    /// Remove the lease file if this worker still holds it
    pub fn release(self) -> Result<()> {
        match read_record(&self.path)? {
            Some(current) if current.holder == self.record.holder => {
                match std::fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(StorageError::io(&self.path, e).into()),
                }
                debug!(username = %self.username, "Lease released");
            }
            _ => {
                warn!(username = %self.username, "Lease no longer held at release");
            }
        }
        Ok(())
    }

    fn ensure_held(&self) -> Result<()> {
        match read_record(&self.path)? {
            Some(current) if current.holder == self.record.holder => Ok(()),
            _ => Err(JobError::InProgress(self.username.clone()).into()),
        }
    }
}

/// The live lease on `username`, if any
pub fn current(store: &AccountStore, username: &str) -> Result<Option<LeaseRecord>> {
    validate_username(username)?;
    let record = read_record(&store.lease_path(username))?;
    Ok(record.filter(|r| !r.is_expired(Utc::now())))
}

/// Remove an expired or unreadable lease. Returns whether anything was removed.
///
/// A live lease is left alone and reported as `JobError::InProgress`.
pub fn clear_stale(store: &AccountStore, username: &str) -> Result<bool> {
    validate_username(username)?;
    let path = store.lease_path(username);
    if !path.exists() {
        return Ok(false);
    }
    if let Some(record) = read_record(&path)? {
        if !record.is_expired(Utc::now()) {
            return Err(JobError::InProgress(username.to_string()).into());
        }
    }
    match std::fs::remove_file(&path) {
        Ok(()) => {
            info!(username, "Stale lease cleared");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(&path, e).into()),
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));
    now + ttl
}

/// Write the record to a temp file and link it into place. Linking fails if
/// the lease already exists, so the file is never visible half-written.
fn create_exclusive(path: &Path, record: &LeaseRecord) -> Result<bool> {
    let tmp = path.with_extension(format!("{}.tmp", record.holder));
    let json = serde_json::to_vec_pretty(record).map_err(|e| StorageError::serde(path, e))?;
    std::fs::write(&tmp, json).map_err(|e| StorageError::io(&tmp, e))?;

    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}

fn write_record(path: &Path, record: &LeaseRecord) -> Result<()> {
    let tmp = path.with_extension(format!("{}.tmp", record.holder));
    let json = serde_json::to_vec_pretty(record).map_err(|e| StorageError::serde(path, e))?;
    std::fs::write(&tmp, json).map_err(|e| StorageError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}

/// `None` for a missing or unreadable lease file
fn read_record(path: &Path) -> Result<Option<LeaseRecord>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable lease file");
                Ok(None)
            }
        },
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::io(path, e).into()),
    }
}

/// Move a stale lease out of the way. Returns false if what got moved turned
/// out to be a fresh lease from another worker, which is put back.
fn move_stale_aside(path: &Path, stale: Option<&LeaseRecord>, taker: &Uuid) -> Result<bool> {
    let aside = path.with_extension(format!("{}.stale", taker));
    match std::fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(StorageError::io(path, e).into()),
    }

    let moved = read_record(&aside)?;
    let same = match (stale, &moved) {
        (Some(a), Some(b)) => a.holder == b.holder,
        (None, None) => true,
        _ => false,
    };
    if !same {
        if let Some(record) = &moved {
            if !record.is_expired(Utc::now()) {
                // Another worker won the takeover; hand its lease back.
                let _ = std::fs::hard_link(&aside, path);
                let _ = std::fs::remove_file(&aside);
                return Ok(false);
            }
        }
    }
    let _ = std::fs::remove_file(&aside);
    Ok(true)
}
