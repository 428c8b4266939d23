//! Throttling between close-friends actions
//!
//! Every successful add is followed by a random pause in
//! `[action_delay_min, action_delay_max]` seconds and every batch by a random
//! cooldown in `[batch_cooldown, 2 * batch_cooldown]`. The sleeps are real
//! `tokio::time::sleep`s.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::types::AccountConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacer {
    action_delay_min: u64,
    action_delay_max: u64,
    batch_cooldown: u64,
}

impl Pacer {
    pub fn new(action_delay_min: u64, action_delay_max: u64, batch_cooldown: u64) -> Self {
        Self {
            action_delay_min,
            action_delay_max,
            batch_cooldown,
        }
    }

    pub fn from_config(config: &AccountConfig) -> Self {
        Self::new(
            config.action_delay_min,
            config.action_delay_max,
            config.batch_cooldown,
        )
    }

    /// Draw the pause that follows one action
    pub fn action_delay(&self) -> Duration {
        uniform_secs(self.action_delay_min, self.action_delay_max)
    }

    /// Draw the cooldown that follows one batch
    pub fn batch_cooldown(&self) -> Duration {
        uniform_secs(self.batch_cooldown, self.batch_cooldown.saturating_mul(2))
    }

    pub async fn pause(&self, delay: Duration) {
        debug!(secs = delay.as_secs_f64(), "Pausing");
        sleep(delay).await;
    }
}

fn uniform_secs(min: u64, max: u64) -> Duration {
    if min >= max {
        return Duration::from_secs(min);
    }
    let secs = rand::thread_rng().gen_range(min as f64..=max as f64);
    Duration::from_secs_f64(secs)
}
