//! Redis queue backend for production use.
//!
//! Layout (all keys under the `chronod:` prefix):
//! - `chronod:ready`: ZSET of entry JSON, scored so ZPOPMIN yields the
//!   highest priority band first and FIFO within a band.
//! - `chronod:delayed`: ZSET scored by absolute visibility time (ms).
//! - `chronod:inflight`: ZSET scored by stall deadline (ms).
//! - `chronod:repeat`: HASH of job id to repeatable registration JSON.
//! - `chronod:seq`: INCR counter for FIFO ordering.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::calendar::{self, CronExpr};
use crate::config::QueueConfig;
use crate::error::{ChronodError, ErrorCode, Result};
use crate::job::JobId;

use super::{Delivery, Envelope, QueueBackend, Repeatable};

const READY_KEY: &str = "chronod:ready";
const DELAYED_KEY: &str = "chronod:delayed";
const INFLIGHT_KEY: &str = "chronod:inflight";
const REPEAT_KEY: &str = "chronod:repeat";
const SEQ_KEY: &str = "chronod:seq";

/// Each ready/in-flight member carries a unique id so identical envelopes
/// (e.g. two manual triggers) stay distinct ZSET members.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueEntry {
    id: Uuid,
    envelope: Envelope,
}

/// Redis-backed [`QueueBackend`].
pub struct RedisQueue {
    client: redis::Client,
    max_retries: u32,
    stall_timeout_ms: i64,
}

impl RedisQueue {
    pub fn connect(config: &QueueConfig) -> Result<Self> {
        let client = redis::Client::open(config.url().as_str())?;
        Ok(Self {
            client,
            max_retries: config.max_retries_per_request,
            stall_timeout_ms: (config.stall_timeout_secs as i64) * 1000,
        })
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ChronodError::with_internal(
                    ErrorCode::QueueUnavailable,
                    "failed to get queue connection",
                    e.to_string(),
                )
            })
    }

    async fn next_seq(&self, conn: &mut redis::aio::MultiplexedConnection) -> Result<i64> {
        let seq: i64 = redis::cmd("INCR").arg(SEQ_KEY).query_async(conn).await?;
        Ok(seq)
    }

    /// ZPOPMIN yields ascending scores, so a higher priority band must map
    /// to a smaller score. The sequence counter breaks ties FIFO.
    fn ready_score(priority: u8, seq: i64) -> f64 {
        let band = (u8::MAX - priority) as f64;
        band * 1e13 + seq as f64
    }

    /// Push an entry onto the ready set, retrying transient failures per the
    /// configured budget.
    async fn push_ready(&self, entry: &QueueEntry) -> Result<()> {
        let member = serde_json::to_string(entry)?;
        let priority = entry.envelope.priority;
        let mut attempt = 0u32;
        loop {
            let result: Result<()> = async {
                let mut conn = self.get_conn().await?;
                let seq = self.next_seq(&mut conn).await?;
                redis::cmd("ZADD")
                    .arg(READY_KEY)
                    .arg(Self::ready_score(priority, seq))
                    .arg(&member)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
                Ok(())
            }
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Promote entries whose score (visibility/stall deadline) has passed
    /// from `from_key` back onto the ready set.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        from_key: &str,
        now_ms: i64,
    ) -> Result<()> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(from_key)
            .arg("-inf")
            .arg(now_ms)
            .query_async(conn)
            .await?;

        for member in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(from_key)
                .arg(&member)
                .query_async(conn)
                .await?;
            // Another consumer may have claimed it between the range scan
            // and the removal.
            if removed == 0 {
                continue;
            }
            let Ok(entry) = serde_json::from_str::<QueueEntry>(&member) else {
                tracing::warn!(key = from_key, "dropping undecodable queue entry");
                continue;
            };
            let seq = self.next_seq(conn).await?;
            redis::cmd("ZADD")
                .arg(READY_KEY)
                .arg(Self::ready_score(entry.envelope.priority, seq))
                .arg(&member)
                .query_async::<_, i64>(conn)
                .await?;
        }
        Ok(())
    }

    /// Fire due repeatable registrations and advance their next instant.
    async fn fire_repeatables(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let registered: std::collections::HashMap<String, String> = redis::cmd("HGETALL")
            .arg(REPEAT_KEY)
            .query_async(conn)
            .await?;

        for (field, value) in registered {
            let Ok(mut repeatable) = serde_json::from_str::<Repeatable>(&value) else {
                tracing::warn!(job_id = %field, "dropping undecodable repeatable registration");
                redis::cmd("HDEL")
                    .arg(REPEAT_KEY)
                    .arg(&field)
                    .query_async::<_, i64>(conn)
                    .await?;
                continue;
            };
            if repeatable.next_fire_at > now {
                continue;
            }

            let entry = QueueEntry {
                id: Uuid::new_v4(),
                envelope: Envelope {
                    job_id: repeatable.job_id,
                    attempts_made: 0,
                    enqueued_at: now,
                    priority: repeatable.priority,
                    manual: false,
                },
            };
            let member = serde_json::to_string(&entry)?;
            let seq = self.next_seq(conn).await?;
            redis::cmd("ZADD")
                .arg(READY_KEY)
                .arg(Self::ready_score(repeatable.priority, seq))
                .arg(&member)
                .query_async::<_, i64>(conn)
                .await?;

            let next = CronExpr::parse(&repeatable.cron_expression)
                .ok()
                .zip(calendar::parse_timezone(&repeatable.timezone).ok())
                .and_then(|(expr, tz)| expr.next_after(now, tz));
            match next {
                Some(next_fire_at) => {
                    repeatable.next_fire_at = next_fire_at;
                    redis::cmd("HSET")
                        .arg(REPEAT_KEY)
                        .arg(&field)
                        .arg(serde_json::to_string(&repeatable)?)
                        .query_async::<_, i64>(conn)
                        .await?;
                }
                None => {
                    redis::cmd("HDEL")
                        .arg(REPEAT_KEY)
                        .arg(&field)
                        .query_async::<_, i64>(conn)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Purge a job's entries from one ZSET. Returns how many were removed.
    async fn purge_key(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
        job_id: JobId,
    ) -> Result<u64> {
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await?;

        let mut removed = 0u64;
        for member in members {
            let Ok(entry) = serde_json::from_str::<QueueEntry>(&member) else {
                continue;
            };
            if entry.envelope.job_id == job_id {
                let gone: i64 = redis::cmd("ZREM")
                    .arg(key)
                    .arg(&member)
                    .query_async(conn)
                    .await?;
                removed += gone as u64;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn enqueue(&self, envelope: Envelope) -> Result<()> {
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            envelope,
        };
        self.push_ready(&entry).await?;
        tracing::debug!(job_id = %entry.envelope.job_id, "envelope enqueued");
        Ok(())
    }

    async fn enqueue_delayed(&self, envelope: Envelope, visible_at: DateTime<Utc>) -> Result<()> {
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            envelope,
        };
        let member = serde_json::to_string(&entry)?;
        let mut conn = self.get_conn().await?;
        redis::cmd("ZADD")
            .arg(DELAYED_KEY)
            .arg(visible_at.timestamp_millis())
            .arg(&member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        tracing::debug!(job_id = %entry.envelope.job_id, visible_at = %visible_at, "delayed envelope enqueued");
        Ok(())
    }

    async fn register_repeatable(&self, repeatable: Repeatable) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HSET")
            .arg(REPEAT_KEY)
            .arg(repeatable.job_id.to_string())
            .arg(serde_json::to_string(&repeatable)?)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_repeatable(&self, job_id: JobId) -> Result<()> {
        let mut conn = self.get_conn().await?;
        redis::cmd("HDEL")
            .arg(REPEAT_KEY)
            .arg(job_id.to_string())
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        let mut conn = self.get_conn().await?;
        let now_ms = now.timestamp_millis();

        self.promote_due(&mut conn, INFLIGHT_KEY, now_ms).await?;
        self.promote_due(&mut conn, DELAYED_KEY, now_ms).await?;
        self.fire_repeatables(&mut conn, now).await?;

        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(READY_KEY)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        let Some((member, _score)) = popped.into_iter().next() else {
            return Ok(None);
        };
        let entry: QueueEntry = serde_json::from_str(&member)?;

        redis::cmd("ZADD")
            .arg(INFLIGHT_KEY)
            .arg(now_ms + self.stall_timeout_ms)
            .arg(&member)
            .query_async::<_, i64>(&mut conn)
            .await?;

        Ok(Some(Delivery {
            envelope: entry.envelope,
            receipt: entry.id,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let entry = QueueEntry {
            id: delivery.receipt,
            envelope: delivery.envelope.clone(),
        };
        let member = serde_json::to_string(&entry)?;
        let mut conn = self.get_conn().await?;
        redis::cmd("ZREM")
            .arg(INFLIGHT_KEY)
            .arg(&member)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let entry = QueueEntry {
            id: delivery.receipt,
            envelope: delivery.envelope.clone(),
        };
        let member = serde_json::to_string(&entry)?;
        let mut conn = self.get_conn().await?;
        // Leave the member under its stall deadline; promote_due will
        // re-materialize it once the interval passes. Only bump the deadline
        // if the entry had somehow lost it.
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(INFLIGHT_KEY)
            .arg(&member)
            .query_async(&mut conn)
            .await?;
        if score.is_none() {
            let visible_at = Utc
                .timestamp_millis_opt(delivery.envelope.enqueued_at.timestamp_millis() + self.stall_timeout_ms)
                .single()
                .unwrap_or(delivery.envelope.enqueued_at);
            redis::cmd("ZADD")
                .arg(DELAYED_KEY)
                .arg(visible_at.timestamp_millis())
                .arg(&member)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn remove_job(&self, job_id: JobId) -> Result<u64> {
        let mut conn = self.get_conn().await?;
        let mut removed = self.purge_key(&mut conn, READY_KEY, job_id).await?;
        removed += self.purge_key(&mut conn, DELAYED_KEY, job_id).await?;
        Ok(removed)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let ready: i64 = redis::cmd("ZCARD").arg(READY_KEY).query_async(&mut conn).await?;
        let delayed: i64 = redis::cmd("ZCARD").arg(DELAYED_KEY).query_async(&mut conn).await?;
        Ok((ready + delayed).max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_score_orders_priority_bands_before_fifo() {
        // Higher priority → strictly smaller score, regardless of sequence.
        let high_late = RedisQueue::ready_score(10, 1_000_000);
        let low_early = RedisQueue::ready_score(0, 1);
        assert!(high_late < low_early);

        // Within a band, earlier sequence wins.
        let first = RedisQueue::ready_score(5, 10);
        let second = RedisQueue::ready_score(5, 11);
        assert!(first < second);
    }

    #[test]
    fn queue_entry_round_trips() {
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            envelope: Envelope {
                job_id: JobId::new(),
                attempts_made: 2,
                enqueued_at: Utc::now(),
                priority: 7,
                manual: true,
            },
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: QueueEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, entry.id);
        assert_eq!(back.envelope, entry.envelope);
    }
}
