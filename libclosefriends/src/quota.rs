//! Owning user's close-friends allocation
//!
//! `current_allocation` is the sum of follower caps held by the user's
//! accounts; it may never exceed `max_close_friends_allocation`. The store
//! makes each read-modify-write atomic; the ledger only decides the delta.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QuotaError, Result, StorageError};
use crate::types::validate_owner;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub current_allocation: u32,
    pub max_close_friends_allocation: u32,
}

impl Quota {
    pub fn available(&self) -> u32 {
        self.max_close_friends_allocation
            .saturating_sub(self.current_allocation)
    }
}

/// Storage for per-user quotas
///
/// `modify` must apply the closure atomically with respect to other calls for
/// the same user. If the closure fails nothing is written.
pub trait QuotaStore: Send + Sync {
    fn read(&self, owner: &str) -> Result<Quota>;

    fn modify(&self, owner: &str, apply: &mut dyn FnMut(&mut Quota) -> Result<()>)
        -> Result<Quota>;
}

/// Reserve/release policy over a [`QuotaStore`]
pub struct QuotaLedger<'a> {
    store: &'a dyn QuotaStore,
}

impl<'a> QuotaLedger<'a> {
    pub fn new(store: &'a dyn QuotaStore) -> Self {
        Self { store }
    }

    /// Fail with `QuotaExceeded` unless `amount` still fits
    pub fn check(&self, owner: &str, amount: u32) -> Result<()> {
        let quota = self.store.read(owner)?;
        ensure_fits(&quota, amount)
    }

    pub fn reserve(&self, owner: &str, amount: u32) -> Result<Quota> {
        let quota = self.store.modify(owner, &mut |quota: &mut Quota| {
            ensure_fits(quota, amount)?;
            quota.current_allocation += amount;
            Ok(())
        })?;
        debug!(owner, amount, current = quota.current_allocation, "Allocation reserved");
        Ok(quota)
    }

    /// Give back `amount`, clamping at zero
    pub fn release(&self, owner: &str, amount: u32) -> Result<Quota> {
        let quota = self.store.modify(owner, &mut |quota: &mut Quota| {
            if amount > quota.current_allocation {
                warn!(
                    owner,
                    amount,
                    current = quota.current_allocation,
                    "Release larger than current allocation, clamping to zero"
                );
            }
            quota.current_allocation = quota.current_allocation.saturating_sub(amount);
            Ok(())
        })?;
        debug!(owner, amount, current = quota.current_allocation, "Allocation released");
        Ok(quota)
    }

    /// Move an account's holding from `old` to `new`
    pub fn adjust(&self, owner: &str, old: u32, new: u32) -> Result<Quota> {
        if new > old {
            self.reserve(owner, new - old)
        } else {
            self.release(owner, old - new)
        }
    }

    pub fn available(&self, owner: &str) -> Result<u32> {
        Ok(self.store.read(owner)?.available())
    }
}

fn ensure_fits(quota: &Quota, amount: u32) -> Result<()> {
    let fits = quota
        .current_allocation
        .checked_add(amount)
        .is_some_and(|total| total <= quota.max_close_friends_allocation);
    if fits {
        Ok(())
    } else {
        Err(QuotaError::Exceeded {
            requested: amount,
            available: quota.available(),
            max: quota.max_close_friends_allocation,
        }
        .into())
    }
}

/// In-process quota store
#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    quotas: Mutex<HashMap<String, Quota>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_max(&self, owner: &str, max: u32) {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        quotas.entry(owner.to_string()).or_default().max_close_friends_allocation = max;
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn read(&self, owner: &str) -> Result<Quota> {
        let quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        Ok(quotas.get(owner).copied().unwrap_or_default())
    }

    fn modify(
        &self,
        owner: &str,
        apply: &mut dyn FnMut(&mut Quota) -> Result<()>,
    ) -> Result<Quota> {
        let mut quotas = self.quotas.lock().unwrap_or_else(|e| e.into_inner());
        let mut quota = quotas.get(owner).copied().unwrap_or_default();
        apply(&mut quota)?;
        quotas.insert(owner.to_string(), quota);
        Ok(quota)
    }
}

/// Quotas kept in `<data_dir>/<owner>/quota.json`
///
/// Atomic within one process; deployments with several worker processes
/// should put quotas in their database instead.
#[derive(Debug)]
pub struct FileQuotaStore {
    data_dir: PathBuf,
    lock: Mutex<()>,
}

impl FileQuotaStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, owner: &str) -> PathBuf {
        self.data_dir.join(owner).join("quota.json")
    }

    fn load(path: &Path) -> Result<Quota> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StorageError::serde(path, e).into())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Quota::default()),
            Err(e) => Err(StorageError::io(path, e).into()),
        }
    }

    fn store(path: &Path, quota: &Quota) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(quota).map_err(|e| StorageError::serde(path, e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StorageError::io(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
        Ok(())
    }

    /// Set the ceiling granted to a user (admin operation)
    pub fn set_max(&self, owner: &str, max: u32) -> Result<Quota> {
        self.modify(owner, &mut |quota: &mut Quota| {
            quota.max_close_friends_allocation = max;
            Ok(())
        })
    }
}

impl QuotaStore for FileQuotaStore {
    fn read(&self, owner: &str) -> Result<Quota> {
        validate_owner(owner)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        Self::load(&self.path(owner))
    }

    fn modify(
        &self,
        owner: &str,
        apply: &mut dyn FnMut(&mut Quota) -> Result<()>,
    ) -> Result<Quota> {
        validate_owner(owner)?;
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let path = self.path(owner);
        let mut quota = Self::load(&path)?;
        apply(&mut quota)?;
        Self::store(&path, &quota)?;
        Ok(quota)
    }
}
