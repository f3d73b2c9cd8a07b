//! In-memory queue backend for tests and local development.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::calendar::{self, CronExpr};
use crate::error::Result;
use crate::job::JobId;

use super::{Delivery, Envelope, QueueBackend, Repeatable};

struct ReadyEntry {
    envelope: Envelope,
    seq: u64,
}

impl Eq for ReadyEntry {}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first; FIFO within a band.
        self.envelope
            .priority
            .cmp(&other.envelope.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    delivery: Delivery,
    stall_deadline: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BTreeMap<(DateTime<Utc>, u64), Envelope>,
    repeatables: HashMap<JobId, Repeatable>,
    in_flight: HashMap<Uuid, InFlight>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Heap-backed [`QueueBackend`] mirroring the Redis backend's semantics.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    stall_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(stall_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            stall_timeout,
        }
    }

    /// Number of envelopes currently in flight (tests).
    pub async fn in_flight_len(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(120))
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        inner.ready.push(ReadyEntry { envelope, seq });
        Ok(())
    }

    async fn enqueue_delayed(&self, envelope: Envelope, visible_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq();
        inner.delayed.insert((visible_at, seq), envelope);
        Ok(())
    }

    async fn register_repeatable(&self, repeatable: Repeatable) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.repeatables.insert(repeatable.job_id, repeatable);
        Ok(())
    }

    async fn remove_repeatable(&self, job_id: JobId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.repeatables.remove(&job_id);
        Ok(())
    }

    async fn pop(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let mut inner = self.inner.lock().await;

        // Reclaim stalled in-flight envelopes.
        let stalled: Vec<Uuid> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.stall_deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in stalled {
            if let Some(flight) = inner.in_flight.remove(&receipt) {
                let seq = inner.next_seq();
                inner.ready.push(ReadyEntry {
                    envelope: flight.delivery.envelope,
                    seq,
                });
            }
        }

        // Promote due delayed entries.
        let due: Vec<(DateTime<Utc>, u64)> = inner
            .delayed
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in due {
            if let Some(envelope) = inner.delayed.remove(&key) {
                let seq = inner.next_seq();
                inner.ready.push(ReadyEntry { envelope, seq });
            }
        }

        // Materialize due repeatable firings and advance them.
        let due_jobs: Vec<JobId> = inner
            .repeatables
            .values()
            .filter(|r| r.next_fire_at <= now)
            .map(|r| r.job_id)
            .collect();
        for job_id in due_jobs {
            let Some(repeatable) = inner.repeatables.get(&job_id).cloned() else {
                continue;
            };
            let envelope = Envelope {
                job_id,
                attempts_made: 0,
                enqueued_at: now,
                priority: repeatable.priority,
                manual: false,
            };
            let seq = inner.next_seq();
            inner.ready.push(ReadyEntry { envelope, seq });

            let next = CronExpr::parse(&repeatable.cron_expression)
                .ok()
                .zip(calendar::parse_timezone(&repeatable.timezone).ok())
                .and_then(|(expr, tz)| expr.next_after(now, tz));
            match next {
                Some(next_fire_at) => {
                    if let Some(entry) = inner.repeatables.get_mut(&job_id) {
                        entry.next_fire_at = next_fire_at;
                    }
                }
                // Exhausted or unparsable: stop firing.
                None => {
                    inner.repeatables.remove(&job_id);
                }
            }
        }

        let Some(entry) = inner.ready.pop() else {
            return Ok(None);
        };
        let delivery = Delivery {
            envelope: entry.envelope,
            receipt: Uuid::new_v4(),
        };
        let stall_deadline = now
            + chrono::Duration::from_std(self.stall_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
        inner.in_flight.insert(
            delivery.receipt,
            InFlight {
                delivery: delivery.clone(),
                stall_deadline,
            },
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(flight) = inner.in_flight.remove(&delivery.receipt) {
            let visible_at = flight.stall_deadline;
            let seq = inner.next_seq();
            inner.delayed.insert((visible_at, seq), flight.delivery.envelope);
        }
        Ok(())
    }

    async fn remove_job(&self, job_id: JobId) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut removed = 0u64;

        let kept: Vec<ReadyEntry> = inner
            .ready
            .drain()
            .filter(|entry| {
                if entry.envelope.job_id == job_id {
                    removed += 1;
                    false
                } else {
                    true
                }
            })
            .collect();
        inner.ready = kept.into_iter().collect();

        let before = inner.delayed.len();
        inner.delayed.retain(|_, envelope| envelope.job_id != job_id);
        removed += (before - inner.delayed.len()) as u64;

        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let inner = self.inner.lock().await;
        Ok(inner.ready.len() + inner.delayed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn envelope(priority: u8, now: DateTime<Utc>) -> Envelope {
        Envelope {
            job_id: JobId::new(),
            attempts_made: 0,
            enqueued_at: now,
            priority,
            manual: false,
        }
    }

    #[tokio::test]
    async fn priority_order_then_fifo() {
        let queue = MemoryQueue::default();
        let now = Utc::now();

        let low_a = envelope(1, now);
        let low_b = envelope(1, now);
        let high = envelope(8, now);
        queue.enqueue(low_a.clone()).await.unwrap();
        queue.enqueue(low_b.clone()).await.unwrap();
        queue.enqueue(high.clone()).await.unwrap();

        let first = queue.pop(now).await.unwrap().unwrap();
        assert_eq!(first.envelope.job_id, high.job_id);
        let second = queue.pop(now).await.unwrap().unwrap();
        assert_eq!(second.envelope.job_id, low_a.job_id);
        let third = queue.pop(now).await.unwrap().unwrap();
        assert_eq!(third.envelope.job_id, low_b.job_id);
    }

    #[tokio::test]
    async fn delayed_entries_become_visible_on_time() {
        let queue = MemoryQueue::default();
        let now = Utc::now();
        let visible_at = now + ChronoDuration::seconds(30);

        queue
            .enqueue_delayed(envelope(0, now), visible_at)
            .await
            .unwrap();
        assert!(queue.pop(now).await.unwrap().is_none());
        assert!(queue
            .pop(now + ChronoDuration::seconds(29))
            .await
            .unwrap()
            .is_none());
        assert!(queue.pop(visible_at).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stalled_delivery_is_redelivered() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let now = Utc::now();
        queue.enqueue(envelope(0, now)).await.unwrap();

        let first = queue.pop(now).await.unwrap().unwrap();
        // Unacked past the stall deadline: back in the queue.
        let later = now + ChronoDuration::seconds(61);
        let second = queue.pop(later).await.unwrap().unwrap();
        assert_eq!(first.envelope.job_id, second.envelope.job_id);
        assert_ne!(first.receipt, second.receipt);

        queue.ack(&second).await.unwrap();
        assert!(queue
            .pop(later + ChronoDuration::seconds(120))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn repeatable_materializes_per_firing() {
        let queue = MemoryQueue::default();
        let now: DateTime<Utc> = "2024-01-01T00:00:00Z".parse().unwrap();
        let job_id = JobId::new();

        queue
            .register_repeatable(Repeatable {
                job_id,
                cron_expression: "*/5 * * * *".to_string(),
                timezone: "UTC".to_string(),
                priority: 2,
                next_fire_at: "2024-01-01T00:05:00Z".parse().unwrap(),
            })
            .await
            .unwrap();

        assert!(queue.pop(now).await.unwrap().is_none());

        let fire: DateTime<Utc> = "2024-01-01T00:05:00Z".parse().unwrap();
        let delivery = queue.pop(fire).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.job_id, job_id);
        assert_eq!(delivery.envelope.attempts_made, 0);
        queue.ack(&delivery).await.unwrap();

        // Not due again until the next boundary.
        assert!(queue
            .pop("2024-01-01T00:09:00Z".parse().unwrap())
            .await
            .unwrap()
            .is_none());
        assert!(queue
            .pop("2024-01-01T00:10:00Z".parse().unwrap())
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn remove_job_purges_pending_and_delayed() {
        let queue = MemoryQueue::default();
        let now = Utc::now();
        let keep = envelope(0, now);
        let drop_ready = envelope(0, now);
        let drop_delayed = Envelope {
            job_id: drop_ready.job_id,
            ..envelope(0, now)
        };

        queue.enqueue(keep.clone()).await.unwrap();
        queue.enqueue(drop_ready.clone()).await.unwrap();
        queue
            .enqueue_delayed(drop_delayed, now + ChronoDuration::seconds(10))
            .await
            .unwrap();

        let removed = queue.remove_job(drop_ready.job_id).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.len().await.unwrap(), 1);

        let delivery = queue.pop(now).await.unwrap().unwrap();
        assert_eq!(delivery.envelope.job_id, keep.job_id);
    }

    #[tokio::test]
    async fn nack_reappears_after_stall_interval() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let now = Utc::now();
        queue.enqueue(envelope(0, now)).await.unwrap();

        let delivery = queue.pop(now).await.unwrap().unwrap();
        queue.nack(&delivery).await.unwrap();

        assert!(queue.pop(now + ChronoDuration::seconds(1)).await.unwrap().is_none());
        assert!(queue
            .pop(now + ChronoDuration::seconds(61))
            .await
            .unwrap()
            .is_some());
    }
}
