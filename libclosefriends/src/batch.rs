//! Close-friends batch processor
//!
//! Walks the stored follower list in fixed-size batches, adding each follower
//! to close friends. After every successful add the checkpoint is overwritten
//! with that follower's id, so a run that dies at any point resumes right
//! after the last follower that was actually added. The first failed add
//! ends the run; there is no retry and no skipping.

use tracing::{error, info, instrument, warn};

use crate::accounts::AccountStore;
use crate::config::MissingCheckpointPolicy;
use crate::error::{JobError, Result};
use crate::lease::Lease;
use crate::pacing::Pacer;
use crate::platforms::CloseFriendAction;
use crate::service::events::{Event, EventBus};
use crate::types::{AccountConfig, JobKind};

/// What a finished run did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Followers skipped because the checkpoint was past them
    pub resumed_after: usize,
    pub added: usize,
    pub batches: usize,
}

pub struct BatchProcessor<'a> {
    store: &'a AccountStore,
    events: &'a EventBus,
    on_missing_checkpoint: MissingCheckpointPolicy,
}

impl<'a> BatchProcessor<'a> {
    pub fn new(
        store: &'a AccountStore,
        events: &'a EventBus,
        on_missing_checkpoint: MissingCheckpointPolicy,
    ) -> Self {
        Self {
            store,
            events,
            on_missing_checkpoint,
        }
    }

    /// Run the close-friends job for `username` to completion or first failure
    ///
    /// `adding_to_close_friends` is set while followers are being added and is
    /// false again on every return path. The checkpoint stays in place after
    /// a successful run.
    #[instrument(skip(self, action, lease), fields(owner = %self.store.owner()))]
    pub async fn run<A>(&self, action: &A, username: &str, lease: &mut Lease) -> Result<BatchReport>
    where
        A: CloseFriendAction + ?Sized,
    {
        let account = self.store.load(username)?;
        let followers = self.store.read_followers(username)?;
        if followers.is_empty() {
            return Err(JobError::NoFollowersAvailable(username.to_string()).into());
        }

        let start = self.resume_position(username, &followers)?;
        let pending = &followers[start..];
        info!(
            username,
            total = followers.len(),
            resumed_after = start,
            pending = pending.len(),
            "Adding followers to close friends"
        );

        let flag = JobKind::AddToCloseFriends.flag();
        self.store.set_flag(username, flag, true)?;

        let result = self
            .process(action, username, &account.config, pending, lease)
            .await;

        match result {
            Ok((added, batches)) => {
                self.store.set_flag(username, flag, false)?;
                info!(username, added, batches, "Close friends run completed");
                Ok(BatchReport {
                    resumed_after: start,
                    added,
                    batches,
                })
            }
            Err(e) => {
                self.store.clear_flag(username, flag);
                Err(e)
            }
        }
    }

    /// Index of the first follower still to be added
    fn resume_position(&self, username: &str, followers: &[String]) -> Result<usize> {
        let Some(checkpoint) = self.store.read_checkpoint(username)? else {
            return Ok(0);
        };

        match followers.iter().position(|id| *id == checkpoint) {
            Some(index) => Ok(index + 1),
            None => match self.on_missing_checkpoint {
                MissingCheckpointPolicy::Fail => Err(JobError::Inconsistency {
                    username: username.to_string(),
                    checkpoint,
                }
                .into()),
                MissingCheckpointPolicy::Restart => {
                    warn!(
                        username,
                        checkpoint = %checkpoint,
                        "Checkpoint not in follower list, starting from the top"
                    );
                    Ok(0)
                }
            },
        }
    }

    async fn process<A>(
        &self,
        action: &A,
        username: &str,
        config: &AccountConfig,
        pending: &[String],
        lease: &mut Lease,
    ) -> Result<(usize, usize)>
    where
        A: CloseFriendAction + ?Sized,
    {
        let pacer = Pacer::from_config(config);
        let batch_size = (config.followers_batch_size as usize).max(1);
        let total_batches = pending.len().div_ceil(batch_size);
        let owner = self.store.owner().to_string();
        let mut added = 0;

        for (index, batch) in pending.chunks(batch_size).enumerate() {
            let batch_number = index + 1;
            info!(username, batch = batch_number, total_batches, "Processing batch");

            for follower in batch {
                if let Err(e) = action.apply(follower).await {
                    error!(username, follower = %follower, error = %e, "Failed to add follower");
                    return Err(e);
                }
                self.store.write_checkpoint(username, follower)?;
                added += 1;
                info!(username, follower = %follower, "Added to close friends");
                self.events.emit(Event::FollowerAdded {
                    owner: owner.clone(),
                    username: username.to_string(),
                    follower: follower.clone(),
                });

                let delay = pacer.action_delay();
                lease.renew(delay)?;
                pacer.pause(delay).await;
            }

            self.events.emit(Event::BatchCompleted {
                owner: owner.clone(),
                username: username.to_string(),
                batch: batch_number,
                total_batches,
            });

            // Every full batch cools down, the last one included
            if batch.len() == batch_size {
                let cooldown = pacer.batch_cooldown();
                info!(username, secs = cooldown.as_secs_f64(), "Cooling down");
                lease.renew(cooldown)?;
                pacer.pause(cooldown).await;
            }
        }

        Ok((added, total_batches))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloseFriendsError;
    use crate::platforms::mock::{MockConfig, MockInstagram};
    use crate::platforms::{AuthClient, LoginRequest};
    use crate::types::{Account, JobKind};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const TTL: Duration = Duration::from_secs(900);

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn setup(followers: &[&str]) -> (TempDir, AccountStore, Lease) {
        let temp = TempDir::new().unwrap();
        let store = AccountStore::open(temp.path(), "owner").unwrap();
        let config = AccountConfig {
            followers_batch_size: 2,
            batch_cooldown: 1,
            max_followers: 100,
            action_delay_min: 2,
            action_delay_max: 2,
        };
        store.create(&Account::new("alice", "pw", config)).unwrap();
        store.write_followers("alice", &ids(followers)).unwrap();
        let lease = Lease::acquire(&store, "alice", JobKind::AddToCloseFriends, TTL).unwrap();
        (temp, store, lease)
    }

    async fn logged_in(config: MockConfig) -> MockInstagram {
        let mut client = MockInstagram::new(config);
        client.login(LoginRequest::new("alice", "pw")).await;
        client
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_followers_in_batches_of_two() {
        let (_temp, store, mut lease) = setup(&["a", "b", "c", "d", "e"]);
        let events = EventBus::new(32);
        let mut receiver = events.subscribe();
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        let start = Instant::now();
        let report = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(config.applied(), ids(&["a", "b", "c", "d", "e"]));
        assert_eq!(report.added, 5);
        assert_eq!(report.batches, 3);
        assert_eq!(store.read_checkpoint("alice").unwrap().as_deref(), Some("e"));
        assert!(!store.load("alice").unwrap().adding_to_close_friends);

        // Five 2s action delays plus two cooldowns drawn from [1, 2]
        assert!(elapsed >= Duration::from_secs(12), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(14), "{:?}", elapsed);

        let mut checkpoints = Vec::new();
        let mut batches = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            match event {
                Event::FollowerAdded { follower, .. } => checkpoints.push(follower),
                Event::BatchCompleted { batch, .. } => batches.push(batch),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(checkpoints, ids(&["a", "b", "c", "d", "e"]));
        assert_eq!(batches, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_final_batch_cools_down() {
        let (_temp, store, mut lease) = setup(&["a", "b", "c", "d"]);
        let events = EventBus::new(32);
        let client = logged_in(MockConfig::default()).await;

        let start = Instant::now();
        let report = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(report.batches, 2);
        // Four 2s action delays plus a cooldown after each of the two batches
        assert!(elapsed > Duration::from_secs(10), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_secs(12), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_checkpoint() {
        let (_temp, store, mut lease) = setup(&["a", "b", "c", "d", "e"]);
        store.write_checkpoint("alice", "c").unwrap();
        let events = EventBus::new(32);
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        let report = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap();

        assert_eq!(report.resumed_after, 3);
        assert_eq!(config.applied(), ids(&["d", "e"]));
        assert_eq!(store.read_checkpoint("alice").unwrap().as_deref(), Some("e"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_applies_nothing_again() {
        let (_temp, store, mut lease) = setup(&["a", "b"]);
        store.write_checkpoint("alice", "b").unwrap();
        let events = EventBus::new(32);
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        let report = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap();

        assert_eq!(report.added, 0);
        assert!(config.applied().is_empty());
        assert!(!store.load("alice").unwrap().adding_to_close_friends);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_run_and_keeps_checkpoint() {
        let (_temp, store, mut lease) = setup(&["a", "b", "c", "d", "e"]);
        let events = EventBus::new(32);
        let config = MockConfig {
            fail_on: Some("c".to_string()),
            ..Default::default()
        };
        let client = logged_in(config.clone()).await;

        let err = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap_err();

        assert!(matches!(err, CloseFriendsError::Platform(_)));
        assert_eq!(config.applied(), ids(&["a", "b"]));
        assert_eq!(store.read_checkpoint("alice").unwrap().as_deref(), Some("b"));
        assert!(!store.load("alice").unwrap().adding_to_close_friends);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_followers() {
        let (_temp, store, mut lease) = setup(&[]);
        store.remove_followers("alice");
        let events = EventBus::new(32);
        let client = logged_in(MockConfig::default()).await;

        let err = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CloseFriendsError::Job(JobError::NoFollowersAvailable(_))
        ));
        assert!(!store.load("alice").unwrap().adding_to_close_friends);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_checkpoint_fails_by_default() {
        let (_temp, store, mut lease) = setup(&["a", "b"]);
        store.write_checkpoint("alice", "zz").unwrap();
        let events = EventBus::new(32);
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        let err = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CloseFriendsError::Job(JobError::Inconsistency { ref checkpoint, .. }) if checkpoint == "zz"
        ));
        assert!(config.applied().is_empty());
        assert!(!store.load("alice").unwrap().adding_to_close_friends);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_checkpoint_restart_policy() {
        let (_temp, store, mut lease) = setup(&["a", "b"]);
        store.write_checkpoint("alice", "zz").unwrap();
        let events = EventBus::new(32);
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Restart)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap();

        assert_eq!(config.applied(), ids(&["a", "b"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lease_stops_run() {
        let (_temp, store, mut lease) = setup(&["a", "b", "c"]);
        let events = EventBus::new(32);
        let config = MockConfig::default();
        let client = logged_in(config.clone()).await;

        // Another worker took the lease over
        std::fs::remove_file(store.lease_path("alice")).unwrap();
        let _other = Lease::acquire(&store, "alice", JobKind::AddToCloseFriends, TTL).unwrap();

        let err = BatchProcessor::new(&store, &events, MissingCheckpointPolicy::Fail)
            .run(&client, "alice", &mut lease)
            .await
            .unwrap_err();

        assert!(matches!(err, CloseFriendsError::Job(JobError::InProgress(_))));
        assert_eq!(config.applied(), ids(&["a"]));
        assert!(!store.load("alice").unwrap().adding_to_close_friends);
    }
}
