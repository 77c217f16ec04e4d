//! Engine operations - atomic state changes.
//!
//! Operations represent discrete calls that can be executed atomically on the
//! engine. They are plain data so scenarios can be replayed from JSON.

use serde::{Deserialize, Serialize};

use crate::liquidation::sequencer::{LiquidationMode, LiquidationTotals};
use crate::liquidation::stability_pool::DepositChange;
use crate::utils::crypto::{Address, PositionId};
use crate::utils::math::Decimal18;

// ═══════════════════════════════════════════════════════════════════════════════
// OPERATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// A single engine call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Replace the collateral price of the fixed feed
    SetPrice {
        /// New price
        price: Decimal18,
    },
    /// Move the engine clock forward
    AdvanceTime {
        /// Seconds to advance
        seconds: u64,
    },
    /// Move stablecoin between ledger accounts
    TransferStable {
        /// Sender
        from: Address,
        /// Recipient
        to: Address,
        /// Amount
        amount: Decimal18,
    },
    /// Open a position
    OpenPosition {
        /// Owner
        owner: Address,
        /// Collateral supplied
        collateral: Decimal18,
        /// Debt drawn, excluding the gas reserve
        net_debt: Decimal18,
    },
    /// Adjust a position
    AdjustPosition {
        /// Owner
        owner: Address,
        /// Requested changes
        #[serde(flatten)]
        adjustment: PositionAdjustment,
    },
    /// Close a position
    ClosePosition {
        /// Owner
        owner: Address,
    },
    /// Redeem stablecoin against one position
    Redeem {
        /// Redeemer
        redeemer: Address,
        /// Position redeemed against
        position: PositionId,
        /// Stablecoin to redeem
        amount: Decimal18,
    },
    /// Claim surplus collateral
    ClaimCollSurplus {
        /// Owner
        owner: Address,
    },
    /// Liquidate one position
    Liquidate {
        /// Position
        position: PositionId,
        /// Caller receiving gas compensation
        liquidator: Address,
        /// Mode; derived from the system ratio when absent
        #[serde(default)]
        mode: Option<LiquidationMode>,
    },
    /// Liquidate a list of positions
    LiquidateBatch {
        /// Candidates
        positions: Vec<PositionId>,
        /// Caller receiving gas compensation
        liquidator: Address,
        /// Mode; derived from the system ratio when absent
        #[serde(default)]
        mode: Option<LiquidationMode>,
    },
    /// Register a front end
    RegisterFrontEnd {
        /// Front end
        front_end: Address,
        /// Kickback rate
        kickback_rate: Decimal18,
    },
    /// Deposit into the stability pool
    ProvideToPool {
        /// Depositor
        depositor: Address,
        /// Amount
        amount: Decimal18,
        /// Front end tag for a first deposit
        #[serde(default)]
        front_end: Option<Address>,
    },
    /// Withdraw from the stability pool
    WithdrawFromPool {
        /// Depositor
        depositor: Address,
        /// Amount; clamped to the compounded deposit
        amount: Decimal18,
    },
    /// Move a depositor's collateral gain into their position
    WithdrawCollateralGainToPosition {
        /// Depositor owning an active position
        depositor: Address,
    },
}

impl Operation {
    /// Get the operation type name
    pub fn operation_type(&self) -> &'static str {
        match self {
            Self::SetPrice { .. } => "SetPrice",
            Self::AdvanceTime { .. } => "AdvanceTime",
            Self::TransferStable { .. } => "TransferStable",
            Self::OpenPosition { .. } => "OpenPosition",
            Self::AdjustPosition { .. } => "AdjustPosition",
            Self::ClosePosition { .. } => "ClosePosition",
            Self::Redeem { .. } => "Redeem",
            Self::ClaimCollSurplus { .. } => "ClaimCollSurplus",
            Self::Liquidate { .. } => "Liquidate",
            Self::LiquidateBatch { .. } => "LiquidateBatch",
            Self::RegisterFrontEnd { .. } => "RegisterFrontEnd",
            Self::ProvideToPool { .. } => "ProvideToPool",
            Self::WithdrawFromPool { .. } => "WithdrawFromPool",
            Self::WithdrawCollateralGainToPosition { .. } => "WithdrawCollateralGainToPosition",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INPUTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Changes requested by an adjustment; unset fields are zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PositionAdjustment {
    /// Collateral added
    pub collateral_deposit: Decimal18,
    /// Collateral removed
    pub collateral_withdrawal: Decimal18,
    /// Debt drawn
    pub debt_increase: Decimal18,
    /// Debt repaid
    pub debt_repayment: Decimal18,
}

impl PositionAdjustment {
    /// Add collateral
    pub fn deposit(amount: Decimal18) -> Self {
        Self {
            collateral_deposit: amount,
            ..Self::default()
        }
    }

    /// Remove collateral
    pub fn withdraw(amount: Decimal18) -> Self {
        Self {
            collateral_withdrawal: amount,
            ..Self::default()
        }
    }

    /// Draw more debt
    pub fn borrow(amount: Decimal18) -> Self {
        Self {
            debt_increase: amount,
            ..Self::default()
        }
    }

    /// Repay debt
    pub fn repay(amount: Decimal18) -> Self {
        Self {
            debt_repayment: amount,
            ..Self::default()
        }
    }

    /// Check if nothing changes
    pub fn is_empty(&self) -> bool {
        self.collateral_deposit.is_zero()
            && self.collateral_withdrawal.is_zero()
            && self.debt_increase.is_zero()
            && self.debt_repayment.is_zero()
    }

    /// Whether the adjustment can lower the collateral ratio
    pub fn is_risk_increasing(&self) -> bool {
        !self.collateral_withdrawal.is_zero() || !self.debt_increase.is_zero()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RESULTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Position state after a lifecycle operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSummary {
    /// Position
    pub position: PositionId,
    /// Entire debt
    pub debt: Decimal18,
    /// Entire collateral
    pub collateral: Decimal18,
    /// Stake
    pub stake: Decimal18,
    /// Individual collateral ratio at the current price
    pub icr: Decimal18,
}

/// Result of a redemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedemptionOutcome {
    /// Position redeemed against
    pub position: PositionId,
    /// Stablecoin redeemed
    pub debt_redeemed: Decimal18,
    /// Collateral sent to the redeemer
    pub collateral_sent: Decimal18,
    /// Whether the position was closed
    pub closed: bool,
    /// Collateral left to the owner in the surplus pool
    pub coll_surplus: Decimal18,
}

/// Result of any engine operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationResult {
    /// Operation with nothing to report
    Done,
    /// Position opened or adjusted
    Position(PositionSummary),
    /// Position closed; collateral returned
    Closed {
        /// Position
        position: PositionId,
        /// Collateral returned
        collateral: Decimal18,
    },
    /// Redemption result
    Redemption(RedemptionOutcome),
    /// Surplus claimed
    SurplusClaimed(Decimal18),
    /// Liquidation totals
    Liquidation(LiquidationTotals),
    /// Deposit change
    Deposit(DepositChange),
}
