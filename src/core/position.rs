//! Position records and their reward bookkeeping fields.
//!
//! A position's stored debt and collateral go stale whenever a redistribution
//! happens. They are therefore not readable directly: callers obtain a
//! [`Reconciled`] view from the reward engine, which only hands one out after
//! pending rewards have been realized (or added on the fly for read-only use).

use serde::{Deserialize, Serialize};

use crate::utils::crypto::PositionId;
use crate::utils::math::{Decimal18, U256};

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION STATUS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PositionStatus {
    /// Never opened
    #[default]
    NonExistent,
    /// Open and backing debt
    Active,
    /// Repaid and closed by the owner
    ClosedByOwner,
    /// Closed by liquidation
    ClosedByLiquidation,
    /// Closed because a redemption consumed its net debt
    ClosedByRedemption,
}

impl PositionStatus {
    /// Check if status is active
    pub fn is_active(&self) -> bool {
        matches!(self, PositionStatus::Active)
    }

    /// Check if status is one of the closed states
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            PositionStatus::ClosedByOwner
                | PositionStatus::ClosedByLiquidation
                | PositionStatus::ClosedByRedemption
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWARD SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Values of the redistribution accumulators when the position was last touched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RewardSnapshot {
    /// `L_collateral` at snapshot time
    pub collateral: U256,
    /// `L_debt` at snapshot time
    pub debt: U256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// A borrower's collateral and debt account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    owner: PositionId,
    debt: Decimal18,
    collateral: Decimal18,
    stake: Decimal18,
    status: PositionStatus,
    snapshot: RewardSnapshot,
}

impl Position {
    /// Create a new active position with stored values and no stake yet
    pub(crate) fn open(owner: PositionId, collateral: Decimal18, debt: Decimal18) -> Self {
        Self {
            owner,
            debt,
            collateral,
            stake: Decimal18::ZERO,
            status: PositionStatus::Active,
            snapshot: RewardSnapshot::default(),
        }
    }

    /// Owner of the position
    pub fn owner(&self) -> PositionId {
        self.owner
    }

    /// Redistribution weight
    pub fn stake(&self) -> Decimal18 {
        self.stake
    }

    /// Lifecycle status
    pub fn status(&self) -> PositionStatus {
        self.status
    }

    /// Accumulator snapshot taken at the last reconciliation
    pub fn snapshot(&self) -> RewardSnapshot {
        self.snapshot
    }

    /// Check if the position is active
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub(crate) fn stored_debt(&self) -> Decimal18 {
        self.debt
    }

    pub(crate) fn stored_collateral(&self) -> Decimal18 {
        self.collateral
    }

    pub(crate) fn set_stake(&mut self, stake: Decimal18) {
        self.stake = stake;
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: RewardSnapshot) {
        self.snapshot = snapshot;
    }

    pub(crate) fn set_debt_and_collateral(&mut self, debt: Decimal18, collateral: Decimal18) {
        self.debt = debt;
        self.collateral = collateral;
    }

    /// Mark closed and zero every balance and snapshot
    pub(crate) fn close(&mut self, status: PositionStatus) {
        self.status = status;
        self.debt = Decimal18::ZERO;
        self.collateral = Decimal18::ZERO;
        self.stake = Decimal18::ZERO;
        self.snapshot = RewardSnapshot::default();
    }

    /// Reopen a previously closed record for the same owner
    pub(crate) fn reopen(&mut self, collateral: Decimal18, debt: Decimal18) {
        *self = Self::open(self.owner, collateral, debt);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONCILED VIEW
// ═══════════════════════════════════════════════════════════════════════════════

/// Debt and collateral of a position with all pending rewards accounted for.
///
/// Only the reward engine constructs this type, so holding one proves the
/// values include every redistribution up to the moment it was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    owner: PositionId,
    debt: Decimal18,
    collateral: Decimal18,
    pending_debt: Decimal18,
    pending_collateral: Decimal18,
}

impl Reconciled {
    pub(crate) fn new(
        owner: PositionId,
        debt: Decimal18,
        collateral: Decimal18,
        pending_debt: Decimal18,
        pending_collateral: Decimal18,
    ) -> Self {
        Self {
            owner,
            debt,
            collateral,
            pending_debt,
            pending_collateral,
        }
    }

    /// Owner of the position
    pub fn owner(&self) -> PositionId {
        self.owner
    }

    /// Entire debt including realized or pending redistributed debt
    pub fn debt(&self) -> Decimal18 {
        self.debt
    }

    /// Entire collateral including realized or pending redistributed collateral
    pub fn collateral(&self) -> Decimal18 {
        self.collateral
    }

    /// Redistributed debt folded in by this reconciliation
    pub fn pending_debt(&self) -> Decimal18 {
        self.pending_debt
    }

    /// Redistributed collateral folded in by this reconciliation
    pub fn pending_collateral(&self) -> Decimal18 {
        self.pending_collateral
    }
}
