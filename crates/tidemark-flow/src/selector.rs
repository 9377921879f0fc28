//! Tier selection policy.
//!
//! Bulk compute is only worth its price when the whole history has to be
//! read: a table's first backfill, or an operator-forced recompute. Every
//! other refresh applies changes on the incremental tier.

use crate::error::Result;
use crate::state::RefreshReason;
use crate::tier::{ComputeTier, TierPool, TierSlot};

/// Chooses the tier for a refresh.
#[must_use]
pub const fn select_tier(reason: RefreshReason) -> ComputeTier {
    match reason {
        RefreshReason::InitialBackfill | RefreshReason::Forced => ComputeTier::Bulk,
        RefreshReason::Incremental => ComputeTier::Incremental,
    }
}

/// Selects the tier for `reason` and reserves a slot on it.
///
/// Fails closed: there is no fallback to the other tier.
///
/// # Errors
///
/// Returns `CapacityExhausted` if the selected tier has no free slot.
pub fn reserve(pool: &TierPool, reason: RefreshReason) -> Result<TierSlot> {
    pool.try_acquire(select_tier(reason))
}
