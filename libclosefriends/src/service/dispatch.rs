//! Handing jobs off the request path
//!
//! The service only needs "run this job later". [`AsyncDispatcher`] is that
//! seam; a deployment with a real task queue implements it by pushing the
//! serialized [`Job`] and calling [`JobRunner::run`] from its worker.
//! [`TokioDispatcher`] runs jobs as tasks on the current tokio runtime.

use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{JobError, Result};
use crate::service::jobs::{Job, JobRunner};

#[async_trait]
pub trait AsyncDispatcher: Send + Sync {
    /// Queue `job` for execution. Returns once the job is accepted, not run.
    async fn enqueue(&self, job: Job) -> Result<()>;
}

/// Runs every job as its own tokio task
///
/// Handles of finished jobs are dropped when the next job is queued or
/// [`TokioDispatcher::pending`] is asked; the runner has already logged and
/// emitted their outcome. [`TokioDispatcher::drain`] collects whatever is
/// still held.
pub struct TokioDispatcher {
    runner: JobRunner,
    running: Mutex<Vec<(Job, JoinHandle<Result<()>>)>>,
}

impl TokioDispatcher {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            running: Mutex::new(Vec::new()),
        }
    }

    /// Wait for every held job and collect the results
    pub async fn drain(&self) -> Vec<(Job, Result<()>)> {
        let running = {
            let mut guard = self.running.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };

        let (jobs, handles): (Vec<_>, Vec<_>) = running.into_iter().unzip();
        let outcomes = join_all(handles).await;

        jobs.into_iter()
            .zip(outcomes)
            .map(|(job, joined)| {
                let result = joined.unwrap_or_else(|e| {
                    Err(JobError::Crashed {
                        username: job.username.clone(),
                        reason: e.to_string(),
                    }
                    .into())
                });
                (job, result)
            })
            .collect()
    }

    /// Number of queued jobs that have not finished yet
    pub fn pending(&self) -> usize {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        prune_finished(&mut running);
        running.len()
    }
}

fn prune_finished(running: &mut Vec<(Job, JoinHandle<Result<()>>)>) {
    let before = running.len();
    running.retain(|(_, handle)| !handle.is_finished());
    let pruned = before - running.len();
    if pruned > 0 {
        debug!(pruned, "Dropped finished jobs");
    }
}

#[async_trait]
impl AsyncDispatcher for TokioDispatcher {
    async fn enqueue(&self, job: Job) -> Result<()> {
        debug!(owner = %job.owner, username = %job.username, kind = %job.kind, "Job queued");
        let runner = self.runner.clone();
        let task_job = job.clone();
        let handle = tokio::spawn(async move { runner.run(&task_job).await });

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        prune_finished(&mut running);
        running.push((job, handle));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStore;
    use crate::config::Config;
    use crate::error::CloseFriendsError;
    use crate::platforms::mock::{MockClientFactory, MockConfig};
    use crate::quota::MemoryQuotaStore;
    use crate::service::events::EventBus;
    use crate::types::{Account, AccountConfig, JobKind};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn runner(temp: &TempDir, mock: MockConfig) -> JobRunner {
        JobRunner::new(
            Arc::new(Config::with_data_dir(temp.path())),
            Arc::new(MockClientFactory::new(mock)),
            Arc::new(MemoryQuotaStore::new()),
            EventBus::new(16),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_runs_and_drains() {
        let temp = TempDir::new().unwrap();
        let config = Arc::new(Config::with_data_dir(temp.path()));
        let mock = MockConfig::with_followers(5);
        let runner = JobRunner::new(
            Arc::clone(&config),
            Arc::new(MockClientFactory::new(mock.clone())),
            Arc::new(MemoryQuotaStore::new()),
            EventBus::new(16),
        );
        let store = AccountStore::open(temp.path(), "owner").unwrap();
        store
            .create(&Account::new("alice", "pw", AccountConfig::default()))
            .unwrap();

        let dispatcher = TokioDispatcher::new(runner);
        dispatcher
            .enqueue(Job::new(JobKind::GetFollowers, "owner", "alice"))
            .await
            .unwrap();
        dispatcher
            .enqueue(Job::new(JobKind::GetFollowers, "owner", "ghost"))
            .await
            .unwrap();
        assert_eq!(dispatcher.pending(), 2);

        let results = dispatcher.drain().await;
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(ref e) if e.is_not_found()));
        assert_eq!(store.read_followers("alice").unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_queued() {
        let temp = TempDir::new().unwrap();
        let runner = runner(&temp, MockConfig::default());
        let results: Vec<(Job, std::result::Result<(), CloseFriendsError>)> =
            TokioDispatcher::new(runner).drain().await;
        assert!(results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_are_not_held() {
        let temp = TempDir::new().unwrap();
        let store = AccountStore::open(temp.path(), "owner").unwrap();
        for name in ["alice", "bob", "carol"] {
            store
                .create(&Account::new(name, "pw", AccountConfig::default()))
                .unwrap();
        }
        let dispatcher = TokioDispatcher::new(runner(&temp, MockConfig::with_followers(3)));

        for name in ["alice", "bob", "carol"] {
            dispatcher
                .enqueue(Job::new(JobKind::GetFollowers, "owner", name))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        dispatcher
            .enqueue(Job::new(JobKind::GetFollowers, "owner", "ghost"))
            .await
            .unwrap();
        assert_eq!(dispatcher.running.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(dispatcher.pending(), 0);
        assert!(dispatcher.drain().await.is_empty());
        assert_eq!(store.read_followers("carol").unwrap().len(), 3);
    }
}
