//! Follower retrieval
//!
//! Pages through the authenticated account's followers until the account's
//! `max_followers` cap is reached or the service stops returning a cursor,
//! then commits the list in one write. Nothing is written if any page fails
//! or the run's lease is lost between pages. Duplicates returned by the
//! service across pages are kept as-is.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::accounts::AccountStore;
use crate::error::{JobError, Result};
use crate::lease::Lease;
use crate::platforms::FollowerSource;
use crate::service::events::{Event, EventBus};
use crate::types::JobKind;

pub struct FollowerRetriever<'a> {
    store: &'a AccountStore,
    events: &'a EventBus,
}

impl<'a> FollowerRetriever<'a> {
    pub fn new(store: &'a AccountStore, events: &'a EventBus) -> Self {
        Self { store, events }
    }

    /// Fetch and commit the follower list for `username`
    ///
    /// Returns the number of followers saved. `getting_followers` is set for the
    /// duration and is false again on every return path. `lease` is renewed
    /// after every page; losing it aborts with `JobError::InProgress`.
    #[instrument(skip(self, source, lease), fields(owner = %self.store.owner()))]
    pub async fn retrieve<S>(&self, source: &S, username: &str, lease: &mut Lease) -> Result<usize>
    where
        S: FollowerSource + ?Sized,
    {
        let account = self.store.load(username)?;
        if self.store.has_followers(username) {
            return Err(JobError::AlreadyRetrieved(username.to_string()).into());
        }
        let cap = account.config.max_followers as usize;
        let flag = JobKind::GetFollowers.flag();

        self.store.set_flag(username, flag, true)?;

        match self.fetch_and_commit(source, username, cap, lease).await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!(username, error = %e, "Follower retrieval failed, nothing saved");
                self.store.clear_flag(username, flag);
                Err(e)
            }
        }
    }

    async fn fetch_and_commit<S>(
        &self,
        source: &S,
        username: &str,
        cap: usize,
        lease: &mut Lease,
    ) -> Result<usize>
    where
        S: FollowerSource + ?Sized,
    {
        let followers = collect(source, cap, lease).await?;
        let count = followers.len();

        self.store.write_followers(username, &followers)?;
        self.store.modify(username, |account| {
            account.followers_count = count as u32;
            account.getting_followers = false;
        })?;

        info!(username, count, "Followers saved");
        self.events.emit(Event::FollowersSaved {
            owner: self.store.owner().to_string(),
            username: username.to_string(),
            count,
        });
        Ok(count)
    }
}

/// Accumulate pages while below `cap` and a cursor comes back, then truncate
async fn collect<S>(source: &S, cap: usize, lease: &mut Lease) -> Result<Vec<String>>
where
    S: FollowerSource + ?Sized,
{
    let mut followers: Vec<String> = Vec::new();
    let mut cursor: Option<String> = None;

    while followers.len() < cap {
        let page = source.page(cursor.as_deref()).await?;
        lease.renew(Duration::ZERO)?;

        let empty = page.items.is_empty();
        followers.extend(page.items);
        debug!(collected = followers.len(), "Follower page fetched");

        match page.next_cursor {
            // An empty page with a cursor would loop forever
            Some(_) if empty => {
                warn!(collected = followers.len(), "Empty follower page with a cursor, stopping");
                break;
            }
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    followers.truncate(cap);
    Ok(followers)
}
