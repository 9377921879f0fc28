//! Compute tiers and slot accounting.
//!
//! Two compute classes serve refreshes:
//!
//! - **Bulk**: large and short-lived, sized for historical volume; used for
//!   first backfills and forced recomputes
//! - **Incremental**: small and always on, sized for steady per-interval change
//!
//! A [`TierPool`] tracks how many slots of each tier are reserved. Reservation
//! is an atomic check-and-reserve; a refused reservation leaves nothing held,
//! and a granted one is released when its [`TierSlot`] is dropped.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::FlowMetrics;

/// A class of compute capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeTier {
    /// Large, short-lived capacity for full recomputes.
    Bulk,
    /// Small, always-on capacity for change application.
    Incremental,
}

impl ComputeTier {
    /// Both tiers, bulk first.
    pub const ALL: [Self; 2] = [Self::Bulk, Self::Incremental];

    /// Returns the label used in logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Bulk => "bulk",
            Self::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ComputeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity and price of one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierProfile {
    /// Display name of the backing compute (e.g. a warehouse name).
    pub name: String,
    /// Maximum concurrent refreshes.
    pub slots: usize,
    /// Compute units billed per hour of wall time.
    pub units_per_hour: f64,
    /// Price of one compute unit.
    pub cost_per_unit: f64,
}

impl TierProfile {
    /// Default profile for `tier`.
    ///
    /// Bulk is 16 units/hour with a single slot; incremental is 1 unit/hour
    /// with four slots. Both cost 3.0 per unit.
    #[must_use]
    pub fn default_for(tier: ComputeTier) -> Self {
        match tier {
            ComputeTier::Bulk => Self {
                name: "bulk_wh".to_string(),
                slots: 1,
                units_per_hour: 16.0,
                cost_per_unit: 3.0,
            },
            ComputeTier::Incremental => Self {
                name: "incremental_wh".to_string(),
                slots: 4,
                units_per_hour: 1.0,
                cost_per_unit: 3.0,
            },
        }
    }
}

/// Profiles for both tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierProfiles {
    /// Bulk tier profile.
    #[serde(default = "bulk_default")]
    pub bulk: TierProfile,
    /// Incremental tier profile.
    #[serde(default = "incremental_default")]
    pub incremental: TierProfile,
}

fn bulk_default() -> TierProfile {
    TierProfile::default_for(ComputeTier::Bulk)
}

fn incremental_default() -> TierProfile {
    TierProfile::default_for(ComputeTier::Incremental)
}

impl Default for TierProfiles {
    fn default() -> Self {
        Self {
            bulk: bulk_default(),
            incremental: incremental_default(),
        }
    }
}

impl TierProfiles {
    /// Profile of `tier`.
    #[must_use]
    pub const fn get(&self, tier: ComputeTier) -> &TierProfile {
        match tier {
            ComputeTier::Bulk => &self.bulk,
            ComputeTier::Incremental => &self.incremental,
        }
    }
}

#[derive(Debug, Default)]
struct SlotCounts {
    bulk: usize,
    incremental: usize,
}

impl SlotCounts {
    fn get_mut(&mut self, tier: ComputeTier) -> &mut usize {
        match tier {
            ComputeTier::Bulk => &mut self.bulk,
            ComputeTier::Incremental => &mut self.incremental,
        }
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("tier pool lock poisoned")
}

#[derive(Debug)]
struct PoolInner {
    profiles: TierProfiles,
    in_use: Mutex<SlotCounts>,
    metrics: FlowMetrics,
}

impl PoolInner {
    fn release(&self, tier: ComputeTier) {
        if let Ok(mut counts) = self.in_use.lock() {
            let slot = counts.get_mut(tier);
            *slot = slot.saturating_sub(1);
            self.metrics.set_slots_in_use(tier.as_str(), *slot);
        }
    }
}

/// Slot accounting for both tiers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TierPool {
    inner: Arc<PoolInner>,
}

impl TierPool {
    /// Creates a pool with the given profiles and no reservations.
    #[must_use]
    pub fn new(profiles: TierProfiles) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                profiles,
                in_use: Mutex::new(SlotCounts::default()),
                metrics: FlowMetrics::new(),
            }),
        }
    }

    /// Tier profiles.
    #[must_use]
    pub fn profiles(&self) -> &TierProfiles {
        &self.inner.profiles
    }

    /// Reserves one slot on `tier`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExhausted`] if every slot is taken. Nothing
    /// is reserved in that case.
    pub fn try_acquire(&self, tier: ComputeTier) -> Result<TierSlot> {
        let limit = self.inner.profiles.get(tier).slots;
        let mut counts = self.inner.in_use.lock().map_err(poison_err)?;
        let slot = counts.get_mut(tier);
        if *slot >= limit {
            return Err(Error::CapacityExhausted { tier });
        }
        *slot += 1;
        self.inner.metrics.set_slots_in_use(tier.as_str(), *slot);
        drop(counts);

        Ok(TierSlot {
            tier,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Slots currently reserved on `tier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool lock is poisoned.
    pub fn in_use(&self, tier: ComputeTier) -> Result<usize> {
        let mut counts = self.inner.in_use.lock().map_err(poison_err)?;
        Ok(*counts.get_mut(tier))
    }

    /// Slots currently free on `tier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool lock is poisoned.
    pub fn available(&self, tier: ComputeTier) -> Result<usize> {
        let limit = self.inner.profiles.get(tier).slots;
        Ok(limit.saturating_sub(self.in_use(tier)?))
    }
}

/// A reserved execution slot. Released on drop.
#[derive(Debug)]
pub struct TierSlot {
    tier: ComputeTier,
    pool: Arc<PoolInner>,
}

impl TierSlot {
    /// Tier of this slot.
    #[must_use]
    pub const fn tier(&self) -> ComputeTier {
        self.tier
    }

    /// Profile of this slot's tier.
    #[must_use]
    pub fn profile(&self) -> &TierProfile {
        self.pool.profiles.get(self.tier)
    }
}

impl Drop for TierSlot {
    fn drop(&mut self) {
        self.pool.release(self.tier);
    }
}
