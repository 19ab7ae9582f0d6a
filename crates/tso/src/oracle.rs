//! The timestamp oracle state machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rk_common::config::PdConfig;
use rk_common::metrics::global_metrics;
use rk_common::{Result, RkError};
use rk_storage::{Election, Storage};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::compose_ts;
use crate::parse_ts;

/// Exclusive upper limit for the logical component. When a reservation
/// reaches it, the physical must advance before new timestamps are issued.
pub const MAX_LOGICAL: u64 = 1 << 18;

/// Minimum interval kept between the in-memory physical and the persisted
/// HWM, milliseconds.
const UPDATE_TIMESTAMP_GUARD_MS: u64 = 1;

/// Jet-lag below this threshold never warns, regardless of the update
/// interval.
const JET_LAG_WARNING_THRESHOLD_MS: u64 = 150;

/// Bounded retries for one generate call waiting out a logical overflow.
const MAX_RETRY_COUNT: usize = 10;

/// One issued timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    /// Milliseconds since the Unix epoch.
    pub physical: u64,
    /// Logical counter within the physical millisecond; this is the end of
    /// the issued range, so a count-N response covers
    /// `logical - N + 1 ..= logical`.
    pub logical: u64,
}

impl Timestamp {
    /// The composed orderable form.
    pub fn compose(&self) -> u64 {
        compose_ts(self.physical, self.logical)
    }
}

#[derive(Debug, Default)]
struct TsoInner {
    /// Physical milliseconds; 0 means uninitialized.
    physical_ms: u64,
    logical: u64,
}

/// Lease-guarded oracle for one keyspace-group.
pub struct TimestampOracle {
    keyspace_group_id: u32,
    member: Arc<Election>,
    storage: Storage,
    save_interval_ms: u64,
    update_physical_interval_ms: u64,
    max_reset_ts_gap_ms: u64,
    tso: Mutex<TsoInner>,
    /// HWM currently persisted, 0 until the first sync.
    last_saved_ms: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TimestampOracle {
    /// Creates an oracle bound to one election member and storage facade.
    pub fn new(
        keyspace_group_id: u32,
        member: Arc<Election>,
        storage: Storage,
        config: &PdConfig,
    ) -> Self {
        Self {
            keyspace_group_id,
            member,
            storage,
            save_interval_ms: config.save_interval_ms,
            update_physical_interval_ms: config.update_physical_interval_ms,
            max_reset_ts_gap_ms: config.max_reset_ts_gap_ms,
            tso: Mutex::new(TsoInner::default()),
            last_saved_ms: AtomicU64::new(0),
        }
    }

    fn current(&self) -> (u64, u64) {
        let inner = self.tso.lock().expect("tso lock");
        (inner.physical_ms, inner.logical)
    }

    fn last_saved(&self) -> u64 {
        self.last_saved_ms.load(Ordering::SeqCst)
    }

    /// Whether a sync has initialized the in-memory pair.
    pub fn is_initialized(&self) -> bool {
        self.current().0 != 0
    }

    fn set_physical(&self, next_ms: u64, force: bool) {
        let mut inner = self.tso.lock().expect("tso lock");
        if inner.physical_ms == 0 && !force {
            return;
        }
        // The pair never falls back.
        if next_ms > inner.physical_ms {
            inner.physical_ms = next_ms;
            inner.logical = 0;
        }
    }

    async fn save_hwm(&self, save_ms: u64) -> Result<()> {
        self.storage
            .save_timestamp(
                self.keyspace_group_id,
                save_ms,
                &self.member.leadership(),
            )
            .await?;
        self.last_saved_ms.store(save_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Loads the persisted HWM and initializes the in-memory pair.
    ///
    /// Called once after this member becomes leader. The chosen physical is
    /// `max(now, last + guard)`, so anything the previous leader could have
    /// issued stays behind us even under bounded clock skew.
    pub async fn sync_timestamp(&self) -> Result<()> {
        info!(
            keyspace_group_id = self.keyspace_group_id,
            operator = "TsoSync",
            "start to sync timestamp"
        );
        global_metrics().inc_tso_event("sync");

        let last = self
            .storage
            .load_timestamp(self.keyspace_group_id)
            .await?
            .unwrap_or(0);
        let last_saved = self.last_saved();
        // Skip when memory is initialized and the persisted HWM matches the
        // copy we already wrote; nothing moved since the last save.
        if self.is_initialized() && last != 0 && last_saved != 0 && last == last_saved {
            info!(
                keyspace_group_id = self.keyspace_group_id,
                last,
                operator = "TsoSync",
                "skip sync timestamp"
            );
            global_metrics().inc_tso_event("skip_sync");
            return Ok(());
        }

        let mut next = now_ms();
        if next < last + UPDATE_TIMESTAMP_GUARD_MS {
            warn!(
                keyspace_group_id = self.keyspace_group_id,
                last,
                next,
                operator = "TsoSync",
                "system time may be incorrect"
            );
            next = last + UPDATE_TIMESTAMP_GUARD_MS;
        }
        let save = next + self.save_interval_ms;
        if let Err(err) = self.save_hwm(save).await {
            global_metrics().inc_tso_event("err_save_sync");
            return Err(err);
        }
        info!(
            keyspace_group_id = self.keyspace_group_id,
            last,
            save,
            next,
            operator = "TsoSync",
            "sync and save timestamp"
        );
        self.set_physical(next, true);
        Ok(())
    }

    /// Advances the physical toward now and extends the persisted window
    /// when it is nearly consumed.
    ///
    /// Constraints: the saved time is monotonically increasing; the physical
    /// is monotonically increasing; the physical always stays below the
    /// saved timestamp.
    pub async fn update_timestamp(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(RkError::Internal(
                "update timestamp: timestamp in memory has not been initialized".to_string(),
            ));
        }
        let (prev_physical, prev_logical) = self.current();
        let now = now_ms();
        let jet_lag_ms = now as i64 - prev_physical as i64;
        global_metrics().inc_tso_event("save");

        let warn_threshold =
            (3 * self.update_physical_interval_ms).max(JET_LAG_WARNING_THRESHOLD_MS);
        if jet_lag_ms > warn_threshold as i64 {
            warn!(
                keyspace_group_id = self.keyspace_group_id,
                jet_lag_ms,
                prev_physical,
                now,
                update_physical_interval_ms = self.update_physical_interval_ms,
                operator = "TsoUpdate",
                "clock offset"
            );
            global_metrics().inc_tso_event("slow_save");
        }
        if jet_lag_ms < 0 {
            global_metrics().inc_tso_event("system_time_slow");
        }

        let next = if jet_lag_ms > UPDATE_TIMESTAMP_GUARD_MS as i64 {
            now
        } else if prev_logical > MAX_LOGICAL / 2 {
            // Half the range is enough headroom between updates; crossing it
            // forces the physical forward early.
            warn!(
                keyspace_group_id = self.keyspace_group_id,
                prev_logical,
                operator = "TsoUpdate",
                "the logical time may be not enough"
            );
            prev_physical + 1
        } else {
            global_metrics().inc_tso_event("skip_save");
            return Ok(());
        };

        // Moving to `next` is only safe while it stays under the persisted
        // window; extend the window first when it does not.
        if self.last_saved() <= next + UPDATE_TIMESTAMP_GUARD_MS {
            let save = next + self.save_interval_ms;
            if let Err(err) = self.save_hwm(save).await {
                warn!(
                    keyspace_group_id = self.keyspace_group_id,
                    error = %err,
                    operator = "TsoUpdate",
                    "save timestamp failed"
                );
                global_metrics().inc_tso_event("err_save_update");
                return Err(err);
            }
        }
        self.set_physical(next, false);
        Ok(())
    }

    /// Issues the next `count` timestamps as one contiguous logical range.
    pub async fn generate(&self, count: u32) -> Result<Timestamp> {
        if count == 0 {
            return Err(RkError::GenerateTimestamp(
                "tso count should be positive".to_string(),
            ));
        }
        for retry in 0..MAX_RETRY_COUNT {
            let (physical, _) = self.current();
            if physical == 0 {
                // A fresh leader may still be syncing; wait it out.
                if self.member.is_serving() {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                global_metrics().inc_tso_event("not_leader");
                return Err(RkError::GenerateTimestamp(
                    "timestamp in memory isn't initialized".to_string(),
                ));
            }
            let ts = {
                let mut inner = self.tso.lock().expect("tso lock");
                if inner.physical_ms == 0 {
                    Timestamp {
                        physical: 0,
                        logical: 0,
                    }
                } else {
                    inner.logical += u64::from(count);
                    Timestamp {
                        physical: inner.physical_ms,
                        logical: inner.logical,
                    }
                }
            };
            if ts.physical == 0 {
                return Err(RkError::GenerateTimestamp(
                    "timestamp in memory has been reset".to_string(),
                ));
            }
            if ts.logical >= MAX_LOGICAL {
                warn!(
                    keyspace_group_id = self.keyspace_group_id,
                    logical = ts.logical,
                    retry,
                    operator = "TsoGenerate",
                    "logical part outside of max logical interval, retrying after physical update"
                );
                global_metrics().inc_tso_event("logical_overflow");
                tokio::time::sleep(Duration::from_millis(self.update_physical_interval_ms)).await;
                continue;
            }
            // The lease may have lapsed after the first check.
            if !self.member.is_serving() {
                return Err(RkError::GenerateTimestamp(
                    "requested pd leader anymore".to_string(),
                ));
            }
            return Ok(ts);
        }
        global_metrics().inc_tso_event("exceeded_max_retry");
        Err(RkError::GenerateTimestamp(
            "generate tso maximum number of retries exceeded".to_string(),
        ))
    }

    /// Sets the in-memory TSO forward to a caller-chosen value.
    ///
    /// Decreases and logical-only decreases are rejected (or ignored when
    /// `ignore_smaller`); forward jumps past `max-reset-ts-gap` are rejected
    /// unless `skip_upper_bound_check`.
    pub async fn reset_user_timestamp(
        &self,
        ts: u64,
        ignore_smaller: bool,
        skip_upper_bound_check: bool,
    ) -> Result<()> {
        if !self.member.is_serving() {
            return Err(RkError::ResetUserTimestamp("not leader".to_string()));
        }
        let (next_physical, next_logical) = parse_ts(ts);
        let need_save = {
            let inner = self.tso.lock().expect("tso lock");
            if inner.physical_ms == 0 {
                return Err(RkError::ResetUserTimestamp(
                    "timestamp in memory has not been initialized".to_string(),
                ));
            }
            let physical_diff = next_physical as i64 - inner.physical_ms as i64;
            let logical_diff = next_logical as i64 - inner.logical as i64;
            if physical_diff < 0 {
                if ignore_smaller {
                    return Ok(());
                }
                return Err(RkError::ResetUserTimestamp(
                    "the specified ts is smaller than now".to_string(),
                ));
            }
            if physical_diff == 0 && logical_diff <= 0 {
                if ignore_smaller {
                    return Ok(());
                }
                return Err(RkError::ResetUserTimestamp(
                    "the specified counter is smaller than now".to_string(),
                ));
            }
            if !skip_upper_bound_check && physical_diff >= self.max_reset_ts_gap_ms as i64 {
                return Err(RkError::ResetUserTimestamp(
                    "the specified ts is too larger than now".to_string(),
                ));
            }
            self.last_saved() <= next_physical + UPDATE_TIMESTAMP_GUARD_MS
        };
        if need_save {
            self.save_hwm(next_physical + self.save_interval_ms)
                .await
                .map_err(|e| RkError::ResetUserTimestamp(e.to_string()))?;
        }
        let mut inner = self.tso.lock().expect("tso lock");
        // Re-checked after the save: only move forward.
        if next_physical > inner.physical_ms
            || (next_physical == inner.physical_ms && next_logical > inner.logical)
        {
            inner.physical_ms = next_physical;
            inner.logical = next_logical;
        }
        Ok(())
    }

    /// Clears the in-memory pair on leadership loss.
    pub fn reset(&self) {
        info!(
            keyspace_group_id = self.keyspace_group_id,
            operator = "TsoReset",
            "reset the timestamp in memory"
        );
        let mut inner = self.tso.lock().expect("tso lock");
        inner.physical_ms = 0;
        inner.logical = 0;
        self.last_saved_ms.store(0, Ordering::SeqCst);
    }

    /// Background physical-update loop ticking at the configured interval
    /// until `shutdown` flips to true. Skips ticks while not serving.
    pub async fn run_update_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.update_physical_interval_ms);
        loop {
            if self.member.is_serving() && self.is_initialized() {
                if let Err(err) = self.update_timestamp().await {
                    warn!(
                        keyspace_group_id = self.keyspace_group_id,
                        error = %err,
                        operator = "TsoUpdateLoop",
                        "update timestamp failed"
                    );
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
