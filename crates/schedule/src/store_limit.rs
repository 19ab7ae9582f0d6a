//! Versioned per-store rate limits.
//!
//! Limits are token buckets refilled at a per-minute rate, keyed by store
//! and consumption type. Only the v1 scheme accepts dynamic changes through
//! the admin surface; a limit set with a TTL reverts to the default once
//! the TTL lapses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rk_common::config::{ScheduleConfig, StoreLimitVersion};
use rk_common::{Result, RkError};

/// What an operator step consumes from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLimitType {
    /// Adding a peer or learner on the store.
    AddPeer,
    /// Removing a peer from the store.
    RemovePeer,
}

#[derive(Debug)]
struct Bucket {
    rate_per_min: f64,
    available: f64,
    last_refill: Instant,
    expire_at: Option<Instant>,
}

impl Bucket {
    fn new(rate_per_min: f64, ttl: Option<Duration>) -> Self {
        Self {
            rate_per_min,
            available: rate_per_min.max(1.0),
            last_refill: Instant::now(),
            expire_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.available =
            (self.available + elapsed * self.rate_per_min / 60.0).min(self.rate_per_min.max(1.0));
        self.last_refill = Instant::now();
    }

    fn take(&mut self) -> bool {
        self.refill();
        if self.available >= 1.0 {
            self.available -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-store rate limiter shared by the operator controller.
pub struct StoreLimiter {
    version: StoreLimitVersion,
    default_add_peer_per_min: f64,
    default_remove_peer_per_min: f64,
    buckets: Mutex<HashMap<(u64, StoreLimitType), Bucket>>,
}

impl StoreLimiter {
    /// Builds a limiter from the scheduling config.
    pub fn new(config: &ScheduleConfig) -> Self {
        Self {
            version: config.store_limit_version,
            default_add_peer_per_min: config.store_limit_add_peer_per_min,
            default_remove_peer_per_min: config.store_limit_remove_peer_per_min,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn default_rate(&self, limit_type: StoreLimitType) -> f64 {
        match limit_type {
            StoreLimitType::AddPeer => self.default_add_peer_per_min,
            StoreLimitType::RemovePeer => self.default_remove_peer_per_min,
        }
    }

    /// Takes one token for `limit_type` on `store_id`; false means the
    /// operator must wait for the bucket to refill.
    pub fn allow(&self, store_id: u64, limit_type: StoreLimitType) -> bool {
        let mut buckets = self.buckets.lock().expect("store limit lock");
        let key = (store_id, limit_type);
        if let Some(bucket) = buckets.get(&key) {
            if bucket.expire_at.is_some_and(|at| at <= Instant::now()) {
                buckets.remove(&key);
            }
        }
        buckets
            .entry(key)
            .or_insert_with(|| Bucket::new(self.default_rate(limit_type), None))
            .take()
    }

    /// Sets a per-store rate with an optional TTL.
    ///
    /// Rejected unless the configured version supports dynamic changes.
    pub fn set_limit(
        &self,
        store_id: u64,
        limit_type: StoreLimitType,
        rate_per_min: f64,
        ttl: Option<Duration>,
    ) -> Result<()> {
        if !self.version.allows_dynamic_changes() {
            return Err(RkError::InvalidValue(format!(
                "store limit version {:?} does not support dynamic changes",
                self.version
            )));
        }
        if rate_per_min <= 0.0 {
            return Err(RkError::InvalidValue(
                "store limit rate must be positive".to_string(),
            ));
        }
        self.buckets
            .lock()
            .expect("store limit lock")
            .insert((store_id, limit_type), Bucket::new(rate_per_min, ttl));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(version: StoreLimitVersion) -> StoreLimiter {
        StoreLimiter::new(&ScheduleConfig {
            store_limit_version: version,
            store_limit_add_peer_per_min: 2.0,
            store_limit_remove_peer_per_min: 2.0,
            ..ScheduleConfig::default()
        })
    }

    #[test]
    fn bucket_drains_at_the_configured_rate() {
        let limiter = limiter(StoreLimitVersion::V1);
        assert!(limiter.allow(1, StoreLimitType::AddPeer));
        assert!(limiter.allow(1, StoreLimitType::AddPeer));
        // Rate 2/min with a burst of 2: the third take within the minute is
        // denied.
        assert!(!limiter.allow(1, StoreLimitType::AddPeer));
        // Other stores and types are unaffected.
        assert!(limiter.allow(1, StoreLimitType::RemovePeer));
        assert!(limiter.allow(2, StoreLimitType::AddPeer));
    }

    #[test]
    fn dynamic_changes_require_v1() {
        let limiter_v2 = limiter(StoreLimitVersion::V2);
        assert!(limiter_v2
            .set_limit(1, StoreLimitType::AddPeer, 100.0, None)
            .is_err());

        let limiter_v1 = limiter(StoreLimitVersion::V1);
        limiter_v1
            .set_limit(1, StoreLimitType::AddPeer, 100.0, None)
            .unwrap();
        // The raised burst allows many immediate takes.
        for _ in 0..50 {
            assert!(limiter_v1.allow(1, StoreLimitType::AddPeer));
        }
    }

    #[test]
    fn ttl_reverts_to_the_default_rate() {
        let limiter = limiter(StoreLimitVersion::V1);
        limiter
            .set_limit(1, StoreLimitType::AddPeer, 100.0, Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // The expired override is dropped; the default burst of 2 applies.
        assert!(limiter.allow(1, StoreLimitType::AddPeer));
        assert!(limiter.allow(1, StoreLimitType::AddPeer));
        assert!(!limiter.allow(1, StoreLimitType::AddPeer));
    }

    #[test]
    fn invalid_rates_are_rejected() {
        let limiter = limiter(StoreLimitVersion::V1);
        assert!(limiter
            .set_limit(1, StoreLimitType::AddPeer, 0.0, None)
            .is_err());
    }
}
