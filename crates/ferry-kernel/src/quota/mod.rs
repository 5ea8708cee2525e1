//! Quota accounting.
//!
//! Key components:
//!
//! - [`QuotaLedger`] - Usage store for users and virtual folders
//! - [`MemoryLedger`] - In-process ledger (DashMap per-key locking)
//! - [`QuotaEnforcer`] - Budget checks and ledger updates for one user
//!
//! A [`QuotaCheck`] is derived fresh for every write request and never
//! stored. Limits of 0 mean "no limit".

mod enforcer;
mod ledger;

pub use enforcer::{QuotaEnforcer, QuotaScope};
pub use ledger::{MemoryLedger, QuotaLedger, Usage};

use thiserror::Error;

/// Quota errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    /// Resuming would need more than the remaining budget.
    #[error("inconsistent quota state: remaining {remaining} bytes, {existing} bytes already stored")]
    InconsistentState { remaining: u64, existing: u64 },

    /// The ledger could not be read or updated.
    #[error("quota ledger: {0}")]
    Ledger(String),
}

/// Maximum additional bytes a transfer may write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteLimit {
    Unlimited,
    Bytes(u64),
}

impl WriteLimit {
    /// Raw form where 0 means unlimited.
    pub fn as_raw(&self) -> u64 {
        match self {
            WriteLimit::Unlimited => 0,
            WriteLimit::Bytes(n) => *n,
        }
    }

    /// Grow a byte limit by `bytes`. Unlimited stays unlimited.
    pub fn extend(self, bytes: u64) -> Self {
        match self {
            WriteLimit::Unlimited => WriteLimit::Unlimited,
            WriteLimit::Bytes(n) => WriteLimit::Bytes(n.saturating_add(bytes)),
        }
    }

    /// Whether writing `total` bytes in all stays within the limit.
    pub fn permits(&self, total: u64) -> bool {
        match self {
            WriteLimit::Unlimited => true,
            WriteLimit::Bytes(n) => total <= *n,
        }
    }
}

/// Outcome of a space check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCheck {
    pub has_space: bool,
    pub quota_size: u64,
    pub quota_files: u64,
    pub used_size: u64,
    pub used_files: u64,
}

impl QuotaCheck {
    /// A check with no limits at all.
    pub fn unlimited() -> Self {
        Self {
            has_space: true,
            quota_size: 0,
            quota_files: 0,
            used_size: 0,
            used_files: 0,
        }
    }

    /// Bytes left under the size limit, `None` without one.
    pub fn remaining_size(&self) -> Option<u64> {
        (self.quota_size > 0).then(|| self.quota_size.saturating_sub(self.used_size))
    }

    /// Budget for a write given the existing file size.
    ///
    /// A resumed write keeps the bytes already stored, so they come out of
    /// the remaining budget. Failing that subtraction means the ledger and
    /// the disk disagree.
    pub fn max_write_size(&self, is_resume: bool, existing: u64) -> Result<WriteLimit, QuotaError> {
        let Some(remaining) = self.remaining_size() else {
            return Ok(WriteLimit::Unlimited);
        };
        if !is_resume {
            return Ok(WriteLimit::Bytes(remaining));
        }
        remaining
            .checked_sub(existing)
            .map(WriteLimit::Bytes)
            .ok_or(QuotaError::InconsistentState {
                remaining,
                existing,
            })
    }
}
