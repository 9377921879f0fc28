//! Per-table refresh state.
//!
//! ```text
//!            lag expired / upstream advanced
//!   FRESH ─────────────────────────────────▶ STALE ◀──────────────┐
//!     ▲                                        │ dispatched        │ retryable error,
//!     │ refresh ok                             ▼                   │ cancelled
//!     └──────────────────────────────────── REFRESHING ────────────┘
//!                                              │ transform error
//!                                              ▼
//!                                            FAILED ── operator reset / force ──▶ STALE
//! ```
//!
//! Only the scheduler mutates these states. Watermarks never move backwards.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tier::ComputeTier;

/// Refresh status of a derived table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableStatus {
    /// Within target lag and caught up with its upstreams.
    Fresh,
    /// Needs a refresh.
    Stale,
    /// A refresh is in flight.
    Refreshing,
    /// The last refresh hit a transform defect; excluded from scheduling.
    Failed,
}

impl TableStatus {
    /// Returns true if the status machine allows moving to `target`.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Fresh, Self::Stale)
                | (Self::Stale, Self::Refreshing)
                | (Self::Refreshing, Self::Fresh | Self::Stale | Self::Failed)
                | (Self::Failed, Self::Stale)
        )
    }

    /// Returns the wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "FRESH",
            Self::Stale => "STALE",
            Self::Refreshing => "REFRESHING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a refresh was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefreshReason {
    /// First-ever full computation.
    InitialBackfill,
    /// Application of new upstream changes (or a lag-expiry no-op).
    Incremental,
    /// Operator-requested full recompute.
    Forced,
}

impl RefreshReason {
    /// Returns the wire name of the reason.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InitialBackfill => "INITIAL_BACKFILL",
            Self::Incremental => "INCREMENTAL",
            Self::Forced => "FORCED",
        }
    }

    /// Returns true if the refresh recomputes the table from full upstream state.
    #[must_use]
    pub const fn is_full_recompute(&self) -> bool {
        matches!(self, Self::InitialBackfill | Self::Forced)
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry backoff for retryable refresh failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on the delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Durable refresh state of one derived table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedTableState {
    /// Table name.
    pub table: String,
    /// Current status.
    pub status: TableStatus,
    /// When the last successful refresh finished.
    pub last_refresh_completed_at: Option<DateTime<Utc>>,
    /// Last consumed sequence (source) or version (derived) per upstream.
    pub watermarks: BTreeMap<String, u64>,
    /// True once the first backfill has committed.
    pub backfilled: bool,
    /// Operator asked for a full recompute.
    #[serde(default)]
    pub force_requested: bool,
    /// Bumped on every recompute request.
    #[serde(default)]
    pub force_generation: u64,
    /// Consecutive retryable failures.
    #[serde(default)]
    pub attempt: u32,
    /// Not dispatchable before this instant.
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// Version of the table data readers currently see.
    #[serde(default)]
    pub published_version: u64,
    /// Reason of the last dispatched refresh.
    #[serde(default)]
    pub last_reason: Option<RefreshReason>,
    /// Tier of the last dispatched refresh.
    #[serde(default)]
    pub last_tier: Option<ComputeTier>,
    /// Message of the last failure, cleared on success.
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DerivedTableState {
    /// Initial state of a newly registered table: STALE and awaiting backfill.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            status: TableStatus::Stale,
            last_refresh_completed_at: None,
            watermarks: BTreeMap::new(),
            backfilled: false,
            force_requested: false,
            force_generation: 0,
            attempt: 0,
            retry_at: None,
            published_version: 0,
            last_reason: None,
            last_tier: None,
            last_error: None,
        }
    }

    /// Moves to `target`, enforcing the status machine.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for a disallowed move.
    pub fn transition(&mut self, target: TableStatus) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                table: self.table.clone(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Asks for a full recompute.
    pub fn request_force(&mut self) {
        self.force_requested = true;
        self.force_generation = self.force_generation.wrapping_add(1);
    }

    /// Clears the recompute request answered by a refresh dispatched at
    /// `generation`. A request made after that dispatch stays pending.
    pub fn clear_force(&mut self, generation: u64) {
        if self.force_generation == generation {
            self.force_requested = false;
        }
    }

    /// Watermark for `upstream` (0 if nothing consumed yet).
    #[must_use]
    pub fn watermark(&self, upstream: &str) -> u64 {
        self.watermarks.get(upstream).copied().unwrap_or(0)
    }

    /// Raises the watermark for `upstream`. Lower values are ignored.
    pub fn advance_watermark(&mut self, upstream: &str, position: u64) {
        let entry = self.watermarks.entry(upstream.to_string()).or_insert(0);
        *entry = (*entry).max(position);
    }

    /// True if more than `target_lag` has passed since the last refresh.
    ///
    /// A table that never refreshed is always past its lag.
    #[must_use]
    pub fn lag_breached(&self, now: DateTime<Utc>, target_lag: Duration) -> bool {
        let Some(done) = self.last_refresh_completed_at else {
            return true;
        };
        let lag = chrono::Duration::from_std(target_lag).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(done) > lag
    }

    /// The reason the next refresh will be dispatched with.
    #[must_use]
    pub const fn next_reason(&self) -> RefreshReason {
        if !self.backfilled {
            RefreshReason::InitialBackfill
        } else if self.force_requested {
            RefreshReason::Forced
        } else {
            RefreshReason::Incremental
        }
    }

    /// True if a retry timer blocks dispatch at `now`.
    #[must_use]
    pub fn backing_off(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.is_some_and(|at| now < at)
    }
}
