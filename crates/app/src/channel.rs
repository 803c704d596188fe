use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;
use tracing::warn;

use fitness_core::types::Activity;
use fitness_storage::{ActivityQueueRepository, Database, LeasedMessage, PublishOutcome, QueueError};

/// A message handed to exactly one consumer until it is acked, nacked,
/// dead-lettered, or its lease runs out.
pub type Delivery = LeasedMessage;

/// Consumer side of the activity channel.
#[async_trait]
pub trait ActivityChannel: Send + Sync {
    /// Leases the next visible message, if any.
    async fn receive(&self) -> Result<Option<Delivery>, ChannelError>;
    /// Removes the message for good. Only call once its effects are persisted.
    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError>;
    /// Returns the message to the channel for redelivery after `retry_after`.
    async fn nack(&self, delivery: &Delivery, retry_after: Duration) -> Result<(), ChannelError>;
    /// Removes the message from the active queue and records it with `reason`.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), ChannelError>;
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("activity queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("failed to encode activity: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Named activity queue stored in SQLite.
#[derive(Clone)]
pub struct SqliteActivityChannel {
    repo: ActivityQueueRepository,
    queue: Arc<str>,
    lease: Duration,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SqliteActivityChannel {
    pub fn new(database: &Database, queue: impl Into<String>, lease: Duration) -> Self {
        Self {
            repo: database.activity_queue(),
            queue: Arc::from(queue.into()),
            lease,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Producer side: serializes the activity and appends it, keyed by activity id.
    pub async fn publish(&self, activity: &Activity) -> Result<PublishOutcome, ChannelError> {
        let payload = activity.encode()?;
        self.publish_raw(&activity.id, &payload).await
    }

    /// Appends an already-serialized payload.
    pub async fn publish_raw(
        &self,
        message_id: &str,
        payload: &str,
    ) -> Result<PublishOutcome, ChannelError> {
        let outcome = self
            .repo
            .publish(&self.queue, message_id, payload, self.now())
            .await?;
        Ok(outcome)
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

#[async_trait]
impl ActivityChannel for SqliteActivityChannel {
    async fn receive(&self) -> Result<Option<Delivery>, ChannelError> {
        let now = self.now();
        let leased = self
            .repo
            .lease(&self.queue, now, now + to_chrono(self.lease))
            .await?;
        Ok(leased)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), ChannelError> {
        if !self.repo.ack(delivery).await? {
            warn!(stage = "listener", message_id = %delivery.message_id, attempts = delivery.attempts, "ack skipped: lease was taken over");
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, retry_after: Duration) -> Result<(), ChannelError> {
        let visible_at = self.now() + to_chrono(retry_after);
        if !self.repo.release(delivery, visible_at).await? {
            warn!(stage = "listener", message_id = %delivery.message_id, attempts = delivery.attempts, "nack skipped: lease was taken over");
        }
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), ChannelError> {
        if !self.repo.dead_letter(delivery, reason, self.now()).await? {
            warn!(stage = "listener", message_id = %delivery.message_id, attempts = delivery.attempts, "dead-letter skipped: lease was taken over");
        }
        Ok(())
    }
}

fn to_chrono(value: Duration) -> ChronoDuration {
    ChronoDuration::from_std(value).unwrap_or_else(|_| ChronoDuration::days(365))
}
