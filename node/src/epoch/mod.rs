//! # Epochs
//!
//! Time is divided into global rounds called epochs (or pulses). All nodes advance epochs together.
//! An [Epoch] is a plain unsigned number with a total order, [Epoch::NONE] is reserved and means
//! that no epoch has been set yet.
//!
//! [EpochClock] holds the latest epoch known to this node. It is advanced by the consensus
//! collaborator and read by everything else. Reads never block.
//!
//! The clock doesn't reject regressions. Duplicate notifications are benign and ordering
//! invariants are enforced by [crate::barrier::WriteBarrier], so the clock only logs them.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u32);

impl Epoch {
    /// Reserved value, "no epoch set".
    pub const NONE: Epoch = Epoch(0);

    /// First valid pulse number of the platform. Everything below it is reserved for
    /// special purpose pulses.
    pub const FIRST: Epoch = Epoch(65537);

    pub const fn new(value: u32) -> Self {
        Epoch(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_set(self) -> bool {
        self.0 != Self::NONE.0
    }

    pub fn checked_add(self, step: u32) -> Option<Epoch> {
        self.0.checked_add(step).map(Epoch)
    }
}

impl From<u32> for Epoch {
    fn from(value: u32) -> Self {
        Epoch(value)
    }
}

impl From<Epoch> for u32 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Epoch {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Epoch)
    }
}

/// Process wide current epoch. Single writer, many readers.
#[derive(Debug)]
pub struct EpochClock {
    current: AtomicU32,
}

impl EpochClock {
    pub fn new(initial: Epoch) -> Self {
        Self {
            current: AtomicU32::new(initial.value()),
        }
    }

    /// Clock which hasn't seen any epoch yet.
    pub fn unset() -> Self {
        Self::new(Epoch::NONE)
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    /// Publishes `epoch` as the current epoch.
    ///
    /// Returns `false` if `epoch` isn't ahead of the current value. In that case the clock keeps
    /// its value and only a warning is logged.
    pub fn advance(&self, epoch: Epoch) -> bool {
        let previous = Epoch(self.current.fetch_max(epoch.value(), Ordering::AcqRel));
        if epoch <= previous {
            log::warn!("Ignoring epoch {epoch}, clock is already at {previous}");
            return false;
        }
        log::debug!("Epoch advanced {previous} -> {epoch}");
        true
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new(Epoch::FIRST)
    }
}
