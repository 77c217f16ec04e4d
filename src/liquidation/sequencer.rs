//! Single and batch liquidation.
//!
//! A liquidation call runs in two phases:
//!
//! 1. **Plan** (read-only): evaluate every candidate, decide its offset and
//!    redistribution split, and compute the aggregated stability pool offset
//!    and redistribution updates. All preconditions are checked here.
//! 2. **Apply**: close the liquidated positions, perform one aggregated offset
//!    and one aggregated redistribution, move surpluses, refresh the system
//!    stake snapshots and set the collateral gas compensation aside.
//!
//! If planning fails nothing has changed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::config::EngineConfig;
use crate::core::pools::{move_between, Asset, AssetPool, CollSurplusPool, GasPool};
use crate::core::position::{PositionStatus, Reconciled};
use crate::error::{Error, Result};
use crate::liquidation::rewards::{RedistributionPlan, RewardSnapshotEngine};
use crate::liquidation::stability_pool::{OffsetPlan, StabilityPool};
use crate::utils::crypto::PositionId;
use crate::utils::math::{collateral_gas_compensation, compute_cr, Decimal18};

// ═══════════════════════════════════════════════════════════════════════════════
// MODE AND OUTCOMES
// ═══════════════════════════════════════════════════════════════════════════════

/// Liquidation policy in force, decided by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationMode {
    /// Liquidate positions below MCR
    Normal,
    /// Recovery mode with the system collateral ratio used as the upper threshold
    Recovery {
        /// Total collateral ratio of the system
        tcr: Decimal18,
    },
}

/// How a liquidated position's debt was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidationKind {
    /// Entire debt absorbed by the stability pool
    OffsetOnly,
    /// Entire debt redistributed to other positions
    RedistributeOnly,
    /// Split between the pool and redistribution
    Mixed,
    /// Recovery-mode offset with collateral capped at MCR; the rest is surplus
    CappedOffset,
}

/// Why a candidate was not liquidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Not an active position
    NotActive,
    /// Listed more than once
    Duplicate,
    /// ICR at or above the threshold in force
    AboveThreshold {
        /// Individual collateral ratio
        icr: Decimal18,
        /// Threshold in force
        threshold: Decimal18,
    },
    /// Recovery-mode capped offset not possible with the remaining pool deposits
    InsufficientPoolForCappedOffset,
}

/// A candidate skipped by the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPosition {
    /// Candidate position
    pub position: PositionId,
    /// Reason it was skipped
    pub reason: SkipReason,
}

/// Per-position liquidation values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationValues {
    /// Liquidated position
    pub position: PositionId,
    /// How the debt was absorbed
    pub kind: LiquidationKind,
    /// ICR at liquidation
    pub icr: Decimal18,
    /// Entire debt including pending rewards
    pub entire_debt: Decimal18,
    /// Entire collateral including pending rewards
    pub entire_collateral: Decimal18,
    /// Collateral paid to the caller
    pub coll_gas_compensation: Decimal18,
    /// Debt-token reserve paid to the caller
    pub debt_gas_compensation: Decimal18,
    /// Debt absorbed by the stability pool
    pub debt_to_offset: Decimal18,
    /// Collateral sent to the stability pool
    pub coll_to_offset: Decimal18,
    /// Debt redistributed to other positions
    pub debt_to_redistribute: Decimal18,
    /// Collateral redistributed to other positions
    pub coll_to_redistribute: Decimal18,
    /// Collateral left for the owner to claim
    pub coll_surplus: Decimal18,
}

/// Aggregated totals of a liquidation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LiquidationTotals {
    /// Debt of all liquidated positions
    pub total_debt_in_sequence: Decimal18,
    /// Collateral of all liquidated positions
    pub total_coll_in_sequence: Decimal18,
    /// Debt absorbed by the stability pool
    pub total_debt_offset: Decimal18,
    /// Collateral sent to the stability pool
    pub total_coll_offset: Decimal18,
    /// Debt redistributed
    pub total_debt_redistributed: Decimal18,
    /// Collateral redistributed
    pub total_coll_redistributed: Decimal18,
    /// Collateral paid to the caller
    pub total_coll_gas_compensation: Decimal18,
    /// Debt-token reserve paid to the caller
    pub total_debt_gas_compensation: Decimal18,
    /// Collateral moved to the surplus pool
    pub total_coll_surplus: Decimal18,
    /// Liquidated positions, in order
    pub liquidated: Vec<PositionId>,
}

impl LiquidationTotals {
    fn add(&mut self, values: &LiquidationValues) -> Result<()> {
        self.total_debt_in_sequence = self.total_debt_in_sequence.checked_add(values.entire_debt)?;
        self.total_coll_in_sequence = self
            .total_coll_in_sequence
            .checked_add(values.entire_collateral)?;
        self.total_debt_offset = self.total_debt_offset.checked_add(values.debt_to_offset)?;
        self.total_coll_offset = self.total_coll_offset.checked_add(values.coll_to_offset)?;
        self.total_debt_redistributed = self
            .total_debt_redistributed
            .checked_add(values.debt_to_redistribute)?;
        self.total_coll_redistributed = self
            .total_coll_redistributed
            .checked_add(values.coll_to_redistribute)?;
        self.total_coll_gas_compensation = self
            .total_coll_gas_compensation
            .checked_add(values.coll_gas_compensation)?;
        self.total_debt_gas_compensation = self
            .total_debt_gas_compensation
            .checked_add(values.debt_gas_compensation)?;
        self.total_coll_surplus = self.total_coll_surplus.checked_add(values.coll_surplus)?;
        self.liquidated.push(values.position);
        Ok(())
    }

    /// Collateral that left the liquidated positions for depositors or other positions
    pub fn liquidated_collateral(&self) -> Result<Decimal18> {
        self.total_coll_in_sequence
            .checked_sub(self.total_coll_gas_compensation)?
            .checked_sub(self.total_coll_surplus)
    }

    /// Check if nothing was liquidated
    pub fn is_empty(&self) -> bool {
        self.liquidated.is_empty()
    }
}

/// Everything a liquidation call will change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationPlan {
    members: Vec<(Reconciled, LiquidationValues)>,
    skipped: Vec<SkippedPosition>,
    totals: LiquidationTotals,
    offset: Option<OffsetPlan>,
    redistribution: Option<RedistributionPlan>,
}

impl LiquidationPlan {
    /// Aggregated totals
    pub fn totals(&self) -> &LiquidationTotals {
        &self.totals
    }

    /// Per-position values of liquidated positions
    pub fn values(&self) -> impl Iterator<Item = &LiquidationValues> {
        self.members.iter().map(|(_, values)| values)
    }

    /// Candidates that were skipped
    pub fn skipped(&self) -> &[SkippedPosition] {
        &self.skipped
    }

    /// Aggregated stability pool offset, if any
    pub fn offset(&self) -> Option<&OffsetPlan> {
        self.offset.as_ref()
    }

    /// Aggregated redistribution, if any
    pub fn redistribution(&self) -> Option<&RedistributionPlan> {
        self.redistribution.as_ref()
    }

    /// Error reported when the plan liquidates nothing.
    ///
    /// A single-position call reports why its candidate was ineligible.
    pub(crate) fn nothing_liquidated(&self, single: bool) -> Error {
        match self.skipped.first() {
            Some(SkippedPosition {
                position,
                reason: SkipReason::AboveThreshold { icr, threshold },
            }) if single => Error::NotLiquidatable {
                position: *position,
                icr: *icr,
                threshold: *threshold,
            },
            _ => Error::NothingToLiquidate,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEQUENCER
// ═══════════════════════════════════════════════════════════════════════════════

/// Orchestrates liquidations across the reward engine, stability pool and pools
pub struct LiquidationSequencer<'a> {
    config: &'a EngineConfig,
    rewards: &'a mut RewardSnapshotEngine,
    pool: &'a mut StabilityPool,
    gas_pool: &'a mut GasPool,
    surplus_pool: &'a mut CollSurplusPool,
}

impl<'a> LiquidationSequencer<'a> {
    /// Borrow the components a liquidation touches
    pub fn new(
        config: &'a EngineConfig,
        rewards: &'a mut RewardSnapshotEngine,
        pool: &'a mut StabilityPool,
        gas_pool: &'a mut GasPool,
        surplus_pool: &'a mut CollSurplusPool,
    ) -> Self {
        Self {
            config,
            rewards,
            pool,
            gas_pool,
            surplus_pool,
        }
    }

    fn normal_split(
        &self,
        reconciled: &Reconciled,
        icr: Decimal18,
        remaining_pool: Decimal18,
        redistribute_all: bool,
    ) -> Result<LiquidationValues> {
        let debt = reconciled.debt();
        let collateral = reconciled.collateral();

        let coll_gas_compensation = collateral_gas_compensation(
            collateral,
            self.config.coll_gas_compensation_divisor,
            self.config.coll_gas_compensation_cap,
        )?;
        let coll_to_liquidate = collateral.checked_sub(coll_gas_compensation)?;

        let debt_to_offset = if redistribute_all {
            Decimal18::ZERO
        } else {
            debt.min(remaining_pool)
        };
        let coll_to_offset = if debt_to_offset.is_zero() {
            Decimal18::ZERO
        } else {
            coll_to_liquidate.mul_div(debt_to_offset, debt)?
        };

        let kind = if debt_to_offset.is_zero() {
            LiquidationKind::RedistributeOnly
        } else if debt_to_offset == debt {
            LiquidationKind::OffsetOnly
        } else {
            LiquidationKind::Mixed
        };

        Ok(LiquidationValues {
            position: reconciled.owner(),
            kind,
            icr,
            entire_debt: debt,
            entire_collateral: collateral,
            coll_gas_compensation,
            debt_gas_compensation: self.config.debt_gas_compensation,
            debt_to_offset,
            coll_to_offset,
            debt_to_redistribute: debt.checked_sub(debt_to_offset)?,
            coll_to_redistribute: coll_to_liquidate.checked_sub(coll_to_offset)?,
            coll_surplus: Decimal18::ZERO,
        })
    }

    fn capped_offset(
        &self,
        reconciled: &Reconciled,
        icr: Decimal18,
        price: Decimal18,
    ) -> Result<LiquidationValues> {
        let debt = reconciled.debt();
        let collateral = reconciled.collateral();

        let capped_coll = debt.mul_div(self.config.mcr, price)?.min(collateral);
        let coll_gas_compensation = collateral_gas_compensation(
            capped_coll,
            self.config.coll_gas_compensation_divisor,
            self.config.coll_gas_compensation_cap,
        )?;

        Ok(LiquidationValues {
            position: reconciled.owner(),
            kind: LiquidationKind::CappedOffset,
            icr,
            entire_debt: debt,
            entire_collateral: collateral,
            coll_gas_compensation,
            debt_gas_compensation: self.config.debt_gas_compensation,
            debt_to_offset: debt,
            coll_to_offset: capped_coll.checked_sub(coll_gas_compensation)?,
            debt_to_redistribute: Decimal18::ZERO,
            coll_to_redistribute: Decimal18::ZERO,
            coll_surplus: collateral.checked_sub(capped_coll)?,
        })
    }

    /// Evaluate one candidate; `Ok(None)` means it is skipped for `reason`
    fn evaluate(
        &self,
        reconciled: &Reconciled,
        price: Decimal18,
        mode: LiquidationMode,
        remaining_pool: Decimal18,
    ) -> Result<std::result::Result<LiquidationValues, SkipReason>> {
        let icr = compute_cr(reconciled.collateral(), reconciled.debt(), price)?;
        let mcr = self.config.mcr;

        let values = match mode {
            LiquidationMode::Normal => {
                if icr >= mcr {
                    return Ok(Err(SkipReason::AboveThreshold { icr, threshold: mcr }));
                }
                self.normal_split(reconciled, icr, remaining_pool, false)?
            }
            LiquidationMode::Recovery { tcr } => {
                if icr <= Decimal18::ONE {
                    self.normal_split(reconciled, icr, remaining_pool, true)?
                } else if icr < mcr {
                    self.normal_split(reconciled, icr, remaining_pool, false)?
                } else if icr < tcr {
                    if reconciled.debt() > remaining_pool {
                        return Ok(Err(SkipReason::InsufficientPoolForCappedOffset));
                    }
                    self.capped_offset(reconciled, icr, price)?
                } else {
                    return Ok(Err(SkipReason::AboveThreshold { icr, threshold: tcr }));
                }
            }
        };
        Ok(Ok(values))
    }

    /// Plan the liquidation of `candidates` without changing any state
    pub fn plan(
        &self,
        candidates: &[PositionId],
        price: Decimal18,
        mode: LiquidationMode,
        now: u64,
    ) -> Result<LiquidationPlan> {
        let mut remaining_pool = self.pool.total_deposits();
        let mut active_left = self.rewards.active_count();
        let mut stakes_removed = Decimal18::ZERO;
        let mut seen = BTreeSet::new();

        let mut members = Vec::new();
        let mut skipped = Vec::new();
        let mut totals = LiquidationTotals::default();

        for id in candidates {
            let reason = if !seen.insert(*id) {
                Some(SkipReason::Duplicate)
            } else if !self.rewards.status(id).is_active() {
                Some(SkipReason::NotActive)
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::warn!(position = %id, ?reason, "liquidation candidate skipped");
                skipped.push(SkippedPosition {
                    position: *id,
                    reason,
                });
                continue;
            }

            let reconciled = self.rewards.entire_debt_and_coll(id)?;
            let values = match self.evaluate(&reconciled, price, mode, remaining_pool)? {
                Ok(values) => values,
                Err(reason) => {
                    tracing::warn!(position = %id, ?reason, "liquidation candidate skipped");
                    skipped.push(SkippedPosition {
                        position: *id,
                        reason,
                    });
                    continue;
                }
            };

            if active_left <= 1 {
                return Err(Error::OnlyOnePositionInSystem);
            }
            active_left -= 1;

            remaining_pool = remaining_pool.checked_sub(values.debt_to_offset)?;
            if let Some(position) = self.rewards.position(id) {
                stakes_removed = stakes_removed.checked_add(position.stake())?;
            }
            totals.add(&values)?;
            members.push((reconciled, values));
        }

        let offset = if totals.total_debt_offset.is_zero() {
            None
        } else {
            self.pool
                .plan_offset(totals.total_debt_offset, totals.total_coll_offset, now)?
        };
        let redistribution = self.rewards.plan_redistribution(
            totals.total_debt_redistributed,
            totals.total_coll_redistributed,
            stakes_removed,
        )?;

        let reserve = self.gas_pool.balance(Asset::Debt);
        if reserve < totals.total_debt_gas_compensation {
            return Err(Error::InvariantViolation(format!(
                "gas pool reserve {} below compensation {}",
                reserve, totals.total_debt_gas_compensation
            )));
        }

        Ok(LiquidationPlan {
            members,
            skipped,
            totals,
            offset,
            redistribution,
        })
    }

    /// Apply a plan produced by [`Self::plan`] against unchanged state
    pub fn apply(&mut self, plan: &LiquidationPlan) -> Result<()> {
        for (reconciled, values) in &plan.members {
            self.rewards
                .close_position(reconciled, PositionStatus::ClosedByLiquidation)?;
            tracing::info!(
                position = %values.position,
                kind = ?values.kind,
                icr = %values.icr,
                debt = %values.entire_debt,
                collateral = %values.entire_collateral,
                "position liquidated"
            );
        }

        if let Some(offset) = &plan.offset {
            self.pool.apply_offset(offset, self.rewards.active_pool_mut())?;
        }
        if let Some(redistribution) = &plan.redistribution {
            self.rewards.apply_redistribution(redistribution)?;
        }

        for (_, values) in &plan.members {
            if values.coll_surplus.is_zero() {
                continue;
            }
            move_between(
                self.rewards.active_pool_mut(),
                &mut *self.surplus_pool,
                Asset::Collateral,
                values.coll_surplus,
            )?;
            self.surplus_pool
                .account_surplus(values.position, values.coll_surplus)?;
        }

        let totals = &plan.totals;
        self.rewards
            .update_system_snapshots_exclude_coll_remainder(totals.total_coll_gas_compensation)?;
        move_between(
            self.rewards.active_pool_mut(),
            &mut *self.gas_pool,
            Asset::Collateral,
            totals.total_coll_gas_compensation,
        )?;

        tracing::info!(
            liquidated = totals.liquidated.len(),
            debt_offset = %totals.total_debt_offset,
            debt_redistributed = %totals.total_debt_redistributed,
            coll_gas_compensation = %totals.total_coll_gas_compensation,
            "liquidation sequence applied"
        );
        Ok(())
    }

    /// Liquidate every eligible candidate; ineligible ones are skipped
    pub fn liquidate_batch(
        &mut self,
        candidates: &[PositionId],
        price: Decimal18,
        mode: LiquidationMode,
        now: u64,
    ) -> Result<LiquidationPlan> {
        let plan = self.plan(candidates, price, mode, now)?;
        if plan.totals.is_empty() {
            return Err(plan.nothing_liquidated(false));
        }
        self.apply(&plan)?;
        Ok(plan)
    }

    /// Liquidate a single position
    pub fn liquidate(
        &mut self,
        id: PositionId,
        price: Decimal18,
        mode: LiquidationMode,
        now: u64,
    ) -> Result<LiquidationPlan> {
        if !self.rewards.status(&id).is_active() {
            return Err(Error::NoStakeOrPosition(id));
        }
        let plan = self.plan(&[id], price, mode, now)?;
        if plan.totals.is_empty() {
            return Err(plan.nothing_liquidated(true));
        }
        self.apply(&plan)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::crypto::Address;

    fn d(s: &str) -> Decimal18 {
        s.parse().unwrap()
    }

    fn id(n: u64) -> PositionId {
        Address::from_index(n)
    }

    struct Fixture {
        config: EngineConfig,
        rewards: RewardSnapshotEngine,
        pool: StabilityPool,
        gas_pool: GasPool,
        surplus: CollSurplusPool,
    }

    impl Fixture {
        fn new() -> Self {
            let config = EngineConfig::default();
            let pool = StabilityPool::new(&config);
            Self {
                config,
                rewards: RewardSnapshotEngine::new(),
                pool,
                gas_pool: GasPool::new(),
                surplus: CollSurplusPool::new(),
            }
        }

        fn open(&mut self, n: u64, coll: &str, debt: &str) {
            self.rewards.open_position(id(n), d(coll), d(debt)).unwrap();
            self.gas_pool
                .credit(Asset::Debt, self.config.debt_gas_compensation)
                .unwrap();
        }

        fn deposit(&mut self, n: u64, amount: &str) {
            self.pool.provide(id(n), d(amount), None, 0).unwrap();
        }

        fn sequencer(&mut self) -> LiquidationSequencer<'_> {
            LiquidationSequencer::new(
                &self.config,
                &mut self.rewards,
                &mut self.pool,
                &mut self.gas_pool,
                &mut self.surplus,
            )
        }
    }

    #[test]
    fn test_redistribution_only_with_empty_pool() {
        let mut fx = Fixture::new();
        fx.open(1, "1", "100");
        fx.open(2, "2", "100");

        let plan = fx
            .sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap();
        let totals = plan.totals();

        assert_eq!(totals.total_coll_gas_compensation, d("0.005"));
        assert_eq!(totals.total_debt_redistributed, d("100"));
        assert_eq!(totals.total_coll_redistributed, d("0.995"));
        assert!(totals.total_debt_offset.is_zero());

        assert_eq!(fx.rewards.pending_collateral_reward(&id(2)).unwrap(), d("0.995"));
        assert_eq!(fx.rewards.pending_debt_reward(&id(2)).unwrap(), d("100"));
        assert_eq!(fx.rewards.status(&id(1)), PositionStatus::ClosedByLiquidation);
        assert_eq!(fx.gas_pool.balance(Asset::Collateral), d("0.005"));
    }

    #[test]
    fn test_offset_only_depletes_pool() {
        let mut fx = Fixture::new();
        fx.open(1, "10", "1000");
        fx.open(2, "20", "1000");
        fx.deposit(9, "1000");

        let plan = fx
            .sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap();

        assert_eq!(plan.values().next().unwrap().kind, LiquidationKind::OffsetOnly);
        assert_eq!(plan.totals().total_coll_offset, d("9.95"));
        assert_eq!(fx.pool.current_epoch(), 1);
        assert!(fx.pool.total_deposits().is_zero());
        assert_eq!(fx.pool.depositor_collateral_gain(&id(9)).unwrap(), d("9.95"));
        assert!(fx.rewards.l_debt().is_zero());
    }

    #[test]
    fn test_mixed_split() {
        let mut fx = Fixture::new();
        fx.open(1, "1", "100");
        fx.open(2, "2", "100");
        fx.deposit(9, "50");

        let plan = fx
            .sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap();
        let totals = plan.totals();

        assert_eq!(plan.values().next().unwrap().kind, LiquidationKind::Mixed);
        assert_eq!(totals.total_debt_offset, d("50"));
        assert_eq!(totals.total_coll_offset, d("0.4975"));
        assert_eq!(totals.total_debt_redistributed, d("50"));
        assert_eq!(totals.total_coll_redistributed, d("0.4975"));
    }

    #[test]
    fn test_last_position_cannot_be_liquidated() {
        let mut fx = Fixture::new();
        fx.open(1, "1", "100");
        let before = fx.rewards.clone();

        let err = fx
            .sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap_err();
        assert_eq!(err, Error::OnlyOnePositionInSystem);
        assert_eq!(fx.rewards, before);
    }

    #[test]
    fn test_healthy_position_is_not_liquidatable() {
        let mut fx = Fixture::new();
        fx.open(1, "2", "100");
        fx.open(2, "2", "100");

        let err = fx
            .sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap_err();
        assert!(matches!(err, Error::NotLiquidatable { .. }));

        let err = fx
            .sequencer()
            .liquidate_batch(&[id(1), id(2)], d("100"), LiquidationMode::Normal, 0)
            .unwrap_err();
        assert_eq!(err, Error::NothingToLiquidate);

        let err = fx
            .sequencer()
            .liquidate(id(7), d("100"), LiquidationMode::Normal, 0)
            .unwrap_err();
        assert!(matches!(err, Error::NoStakeOrPosition(_)));
    }

    #[test]
    fn test_batch_skips_ineligible_and_duplicates() {
        let mut fx = Fixture::new();
        fx.open(1, "1", "100");
        fx.open(2, "1.05", "100");
        fx.open(3, "3", "100");

        let plan = fx
            .sequencer()
            .liquidate_batch(
                &[id(1), id(1), id(3), id(2), id(8)],
                d("100"),
                LiquidationMode::Normal,
                0,
            )
            .unwrap();

        assert_eq!(plan.totals().liquidated, vec![id(1), id(2)]);
        assert_eq!(plan.skipped().len(), 3);
        assert_eq!(fx.rewards.active_count(), 1);
        // Only the survivor's stake carries the redistribution
        assert_eq!(fx.rewards.total_stakes(), d("3"));
        let pending = fx.rewards.pending_debt_reward(&id(3)).unwrap();
        assert!(d("200").abs_diff(pending) <= Decimal18::from_wei(10));
    }

    #[test]
    fn test_recovery_mode_capped_offset() {
        let mut fx = Fixture::new();
        fx.open(1, "1.3", "100");
        fx.open(2, "3", "100");
        fx.deposit(9, "1000");

        let mode = LiquidationMode::Recovery { tcr: d("1.5") };
        let plan = fx
            .sequencer()
            .liquidate(id(1), d("100"), mode, 0)
            .unwrap();
        let values = *plan.values().next().unwrap();

        assert_eq!(values.kind, LiquidationKind::CappedOffset);
        assert_eq!(values.coll_gas_compensation, d("0.0055"));
        assert_eq!(values.coll_to_offset, d("1.0945"));
        assert_eq!(values.coll_surplus, d("0.2"));
        assert_eq!(fx.surplus.claimable(&id(1)), d("0.2"));
        assert_eq!(fx.pool.total_deposits(), d("900"));
    }

    #[test]
    fn test_recovery_mode_redistributes_below_hundred_percent() {
        let mut fx = Fixture::new();
        fx.open(1, "0.9", "100");
        fx.open(2, "3", "100");
        fx.deposit(9, "1000");

        let mode = LiquidationMode::Recovery { tcr: d("1.5") };
        let plan = fx
            .sequencer()
            .liquidate(id(1), d("100"), mode, 0)
            .unwrap();

        assert_eq!(plan.values().next().unwrap().kind, LiquidationKind::RedistributeOnly);
        assert_eq!(fx.pool.total_deposits(), d("1000"));
    }

    #[test]
    fn test_recovery_mode_skips_without_pool_cover() {
        let mut fx = Fixture::new();
        fx.open(1, "1.3", "100");
        fx.open(2, "3", "100");
        fx.deposit(9, "50");

        let mode = LiquidationMode::Recovery { tcr: d("1.5") };
        let err = fx
            .sequencer()
            .liquidate_batch(&[id(1)], d("100"), mode, 0)
            .unwrap_err();
        assert_eq!(err, Error::NothingToLiquidate);
    }

    #[test]
    fn test_system_snapshots_exclude_gas_compensation() {
        let mut fx = Fixture::new();
        fx.open(1, "1", "100");
        fx.open(2, "2", "100");

        fx.sequencer()
            .liquidate(id(1), d("100"), LiquidationMode::Normal, 0)
            .unwrap();

        assert_eq!(fx.rewards.total_stakes_snapshot(), d("2"));
        assert_eq!(fx.rewards.total_collateral_snapshot(), d("2.995"));
        assert_eq!(fx.rewards.active_pool().balances().collateral, d("2"));
    }
}
