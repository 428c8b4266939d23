//! Progress events for background jobs
//!
//! Jobs run off the request path, so the only live view into them is this
//! in-process bus built on `tokio::sync::broadcast`. Emitting never blocks:
//! with no subscribers the event is dropped, and a lagging subscriber loses
//! the oldest events rather than slowing the job down.
//!
//! # Example
//!
//! ```no_run
//! use libclosefriends::service::events::{Event, EventBus};
//! use libclosefriends::types::JobKind;
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::JobStarted {
//!     owner: "web-user".to_string(),
//!     username: "alice".to_string(),
//!     job: JobKind::GetFollowers,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::JobKind;

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(100)
    }
}

impl EventBus {
    /// `capacity` is the per-subscriber buffer before old events are dropped
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobStarted {
        owner: String,
        username: String,
        job: JobKind,
    },

    /// Follower list committed to disk
    FollowersSaved {
        owner: String,
        username: String,
        count: usize,
    },

    /// One follower added to close friends and checkpointed
    FollowerAdded {
        owner: String,
        username: String,
        follower: String,
    },

    BatchCompleted {
        owner: String,
        username: String,
        /// 1-based batch number
        batch: usize,
        total_batches: usize,
    },

    JobCompleted {
        owner: String,
        username: String,
        job: JobKind,
    },

    JobFailed {
        owner: String,
        username: String,
        job: JobKind,
        error: String,
    },
}
