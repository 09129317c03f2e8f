//! Webhook idempotency gate.
//!
//! Records "this inbound event id has been processed" with a 24h TTL. Both
//! routers check the gate before dispatch and mark only after successful
//! processing, so a handler failure leaves the event unmarked and safe to
//! reprocess on redelivery.
//!
//! Two near-simultaneous deliveries of the same event may both pass the
//! "not seen" check before either marks it. That bounded duplicate window is
//! accepted: status-guarded order transitions are the correctness backstop.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ShopResult;

/// How long a processed event id stays in the gate.
pub const DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    GitHub,
    Stripe,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::GitHub => "github",
            EventSource::Stripe => "stripe",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait IdempotencyGate: Send + Sync {
    /// Whether this event id has already been processed.
    async fn seen(&self, source: EventSource, event_id: &str) -> ShopResult<bool>;

    /// Record the event as processed. Call only after the handler succeeded.
    async fn mark_processed(&self, source: EventSource, event_id: &str) -> ShopResult<()>;
}

fn gate_key(source: EventSource, event_id: &str) -> String {
    format!("gitshop:webhook:{}:{}", source, event_id)
}

/// In-memory gate for single-instance deployments and tests.
pub struct MemoryGate {
    entries: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl MemoryGate {
    pub fn new() -> Self {
        Self::with_ttl(DEDUPE_TTL)
    }

    /// Custom TTL, used by tests to exercise expiry deterministically.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Drop expired entries. Called opportunistically on writes.
    async fn purge_expired(&self) {
        let ttl = self.ttl;
        let mut entries = self.entries.write().await;
        entries.retain(|_, marked_at| marked_at.elapsed() < ttl);
    }
}

impl Default for MemoryGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyGate for MemoryGate {
    async fn seen(&self, source: EventSource, event_id: &str) -> ShopResult<bool> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(&gate_key(source, event_id))
            .is_some_and(|marked_at| marked_at.elapsed() < self.ttl))
    }

    async fn mark_processed(&self, source: EventSource, event_id: &str) -> ShopResult<()> {
        self.purge_expired().await;
        let mut entries = self.entries.write().await;
        entries.insert(gate_key(source, event_id), Instant::now());
        Ok(())
    }
}

/// Redis-backed gate for multi-instance deployments. TTL is enforced by
/// redis key expiry.
pub struct RedisGate {
    conn: redis::aio::ConnectionManager,
    ttl: Duration,
}

impl RedisGate {
    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self {
            conn,
            ttl: DEDUPE_TTL,
        }
    }
}

#[async_trait]
impl IdempotencyGate for RedisGate {
    async fn seen(&self, source: EventSource, event_id: &str) -> ShopResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(gate_key(source, event_id))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn mark_processed(&self, source: EventSource, event_id: &str) -> ShopResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(gate_key(source, event_id))
            .arg("processed")
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unseen_until_marked() {
        let gate = MemoryGate::new();
        assert!(!gate.seen(EventSource::GitHub, "d-1").await.unwrap());
        gate.mark_processed(EventSource::GitHub, "d-1").await.unwrap();
        assert!(gate.seen(EventSource::GitHub, "d-1").await.unwrap());
    }

    #[tokio::test]
    async fn sources_are_namespaced() {
        let gate = MemoryGate::new();
        gate.mark_processed(EventSource::GitHub, "evt_1").await.unwrap();
        assert!(gate.seen(EventSource::GitHub, "evt_1").await.unwrap());
        assert!(!gate.seen(EventSource::Stripe, "evt_1").await.unwrap());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let gate = MemoryGate::with_ttl(Duration::ZERO);
        gate.mark_processed(EventSource::Stripe, "evt_2").await.unwrap();
        assert!(!gate.seen(EventSource::Stripe, "evt_2").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_purged_on_write() {
        let gate = MemoryGate::with_ttl(Duration::ZERO);
        gate.mark_processed(EventSource::Stripe, "evt_a").await.unwrap();
        gate.mark_processed(EventSource::Stripe, "evt_b").await.unwrap();
        let entries = gate.entries.read().await;
        // evt_a expired instantly and was swept by the second mark.
        assert_eq!(entries.len(), 1);
    }
}
