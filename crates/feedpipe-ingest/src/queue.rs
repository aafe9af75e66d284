//! Durable operation queue
//!
//! At-least-once delivery with leases: a dequeued message stays in the
//! queue, invisible until its lease runs out, and is removed only when the
//! worker acknowledges it. Messages of one feed are delivered strictly in
//! order, one at a time; messages of different feeds interleave freely.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use uuid::Uuid;

use crate::executor::Operation;

/// Default delivery attempts before a message is dead-lettered
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// A leased message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub queue: String,
    pub operation: Operation,
    /// Deliveries so far, including this one
    pub attempts: u32,
}

#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue_all(&self, queue: &str, operations: Vec<Operation>) -> Result<()>;

    /// Lease the next deliverable message of `queue`
    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge `delivery` and enqueue its follow-ups in one step
    ///
    /// Follow-ups are dropped when the message was purged meanwhile.
    async fn complete(&self, delivery: &Delivery, follow_ups: Vec<Operation>) -> Result<()>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Return a failed message for redelivery after `retry_after`
    ///
    /// Returns `true` when the message ran out of attempts and was
    /// dead-lettered instead.
    async fn release(
        &self,
        delivery: &Delivery,
        error: &str,
        retry_after: Duration,
        max_attempts: u32,
    ) -> Result<bool>;

    /// Drop every pending message of a feed; returns how many
    async fn purge_feed(&self, feed_id: Uuid) -> Result<u64>;

    /// Pending messages in `queue`
    async fn len(&self, queue: &str) -> Result<u64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Dead,
}

#[derive(Debug, Clone)]
struct Message {
    id: i64,
    queue: String,
    operation: Operation,
    attempts: u32,
    status: Status,
    available_at: DateTime<Utc>,
    leased_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Message {
    fn leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    /// Ordered by id
    messages: Vec<Message>,
}

impl Inner {
    fn push(&mut self, queue: &str, operation: Operation) {
        self.next_id += 1;
        self.messages.push(Message {
            id: self.next_id,
            queue: queue.to_string(),
            operation,
            attempts: 0,
            status: Status::Pending,
            available_at: Utc::now(),
            leased_until: None,
            last_error: None,
        });
    }
}

/// Process-local queue
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dead-lettered messages of `queue` with their last error
    pub fn dead_letters(&self, queue: &str) -> Vec<(Operation, Option<String>)> {
        self.inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.queue == queue && m.status == Status::Dead)
            .map(|m| (m.operation.clone(), m.last_error.clone()))
            .collect()
    }
}

fn lease_end(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::hours(1))
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue_all(&self, queue: &str, operations: Vec<Operation>) -> Result<()> {
        let mut inner = self.inner.lock();
        for operation in operations {
            inner.push(queue, operation);
        }
        Ok(())
    }

    async fn dequeue(&self, queue: &str, lease: Duration) -> Result<Option<Delivery>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();

        // Only the head message of each feed may be delivered
        let mut seen = HashSet::new();
        let mut chosen = None;
        for (index, message) in inner.messages.iter().enumerate() {
            if message.status != Status::Pending || !seen.insert(message.operation.feed_id) {
                continue;
            }
            if message.queue == queue && !message.leased(now) && message.available_at <= now {
                chosen = Some(index);
                break;
            }
        }

        let Some(index) = chosen else {
            return Ok(None);
        };
        let message = &mut inner.messages[index];
        message.attempts += 1;
        message.leased_until = Some(lease_end(now, lease));

        Ok(Some(Delivery {
            id: message.id,
            queue: message.queue.clone(),
            operation: message.operation.clone(),
            attempts: message.attempts,
        }))
    }

    async fn complete(&self, delivery: &Delivery, follow_ups: Vec<Operation>) -> Result<()> {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.id != delivery.id);
        if inner.messages.len() == before {
            return Ok(());
        }
        for operation in follow_ups {
            inner.push(&delivery.queue, operation);
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner.lock().messages.retain(|m| m.id != delivery.id);
        Ok(())
    }

    async fn release(
        &self,
        delivery: &Delivery,
        error: &str,
        retry_after: Duration,
        max_attempts: u32,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let Some(message) = inner.messages.iter_mut().find(|m| m.id == delivery.id) else {
            return Ok(false);
        };

        message.leased_until = None;
        message.last_error = Some(error.to_string());
        if message.attempts >= max_attempts {
            message.status = Status::Dead;
            return Ok(true);
        }
        message.available_at = lease_end(now, retry_after);
        Ok(false)
    }

    async fn purge_feed(&self, feed_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|m| m.status == Status::Dead || m.operation.feed_id != feed_id);
        Ok((before - inner.messages.len()) as u64)
    }

    async fn len(&self, queue: &str) -> Result<u64> {
        Ok(self
            .inner
            .lock()
            .messages
            .iter()
            .filter(|m| m.queue == queue && m.status == Status::Pending)
            .count() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::executor::{Stage, StrategyKind};

    const LEASE: Duration = Duration::from_secs(60);

    fn op(feed_id: Uuid, entity: u128) -> Operation {
        Operation {
            feed_id,
            feed_type: "notes".into(),
            token: None,
            strategy: StrategyKind::Queue,
            stage: Stage::Clean {
                entity_id: Uuid::from_u128(entity),
            },
        }
    }

    fn entity_of(delivery: &Delivery) -> u128 {
        match delivery.operation.stage {
            Stage::Clean { entity_id } => entity_id.as_u128(),
            _ => 0,
        }
    }

    #[tokio::test]
    async fn test_fifo_within_feed_one_at_a_time() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1), op(feed, 2)]).await.unwrap();

        let first = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert_eq!(entity_of(&first), 1);
        // Head of the feed is leased, so the feed is blocked
        assert!(queue.dequeue("q", LEASE).await.unwrap().is_none());

        queue.ack(&first).await.unwrap();
        let second = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert_eq!(entity_of(&second), 2);
    }

    #[tokio::test]
    async fn test_feeds_interleave() {
        let queue = MemoryQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.enqueue_all("q", vec![op(a, 1), op(a, 2), op(b, 3)]).await.unwrap();

        let first = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        let second = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert_eq!(entity_of(&first), 1);
        assert_eq!(entity_of(&second), 3);
    }

    #[tokio::test]
    async fn test_complete_enqueues_follow_ups() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1)]).await.unwrap();

        let delivery = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        queue
            .complete(&delivery, vec![op(feed, 2), op(feed, 3)])
            .await
            .unwrap();
        assert_eq!(queue.len("q").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_complete_after_purge_drops_follow_ups() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1)]).await.unwrap();

        let delivery = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert_eq!(queue.purge_feed(feed).await.unwrap(), 1);
        queue.complete(&delivery, vec![op(feed, 2)]).await.unwrap();
        assert_eq!(queue.len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1)]).await.unwrap();

        let first = queue.dequeue("q", Duration::from_millis(20)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_release_retries_then_dead_letters() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1)]).await.unwrap();

        for attempt in 1..=2 {
            let delivery = queue.dequeue("q", LEASE).await.unwrap().unwrap();
            assert_eq!(delivery.attempts, attempt);
            let dead = queue.release(&delivery, "boom", Duration::ZERO, 3).await.unwrap();
            assert!(!dead);
        }

        let delivery = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        assert!(queue.release(&delivery, "boom", Duration::ZERO, 3).await.unwrap());
        assert_eq!(queue.len("q").await.unwrap(), 0);
        assert!(queue.dequeue("q", LEASE).await.unwrap().is_none());

        let dead = queue.dead_letters("q");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_retry_delay_blocks_feed() {
        let queue = MemoryQueue::new();
        let feed = Uuid::new_v4();
        queue.enqueue_all("q", vec![op(feed, 1), op(feed, 2)]).await.unwrap();

        let delivery = queue.dequeue("q", LEASE).await.unwrap().unwrap();
        queue
            .release(&delivery, "later", Duration::from_secs(30), 3)
            .await
            .unwrap();
        assert!(queue.dequeue("q", LEASE).await.unwrap().is_none());
    }
}
