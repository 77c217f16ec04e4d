//! Redistribution accumulators and per-position reward snapshots.
//!
//! Debt and collateral that the stability pool cannot absorb are spread over
//! all open positions in O(1) by growing two global accumulators:
//!
//! - `L_collateral`: collateral redistributed per unit of stake
//! - `L_debt`: debt redistributed per unit of stake
//!
//! A position owes itself `stake * (L - snapshot) / 1e18` of each. The amounts
//! sit in the default pool until the position is next touched and pulls them
//! into its stored values ([`RewardSnapshotEngine::apply_pending_rewards`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::pools::{move_between, ActivePool, Asset, AssetPool, DefaultPool};
use crate::core::position::{Position, PositionStatus, Reconciled, RewardSnapshot};
use crate::error::{Error, Result};
use crate::utils::crypto::PositionId;
use crate::utils::math::{self, precision, Decimal18, U256};

// ═══════════════════════════════════════════════════════════════════════════════
// REDISTRIBUTION PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulator updates for one redistribution, computed without mutating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistributionPlan {
    /// Debt moved from the active to the default pool
    pub debt: Decimal18,
    /// Collateral moved from the active to the default pool
    pub collateral: Decimal18,
    /// Collateral reward per unit staked added to `L_collateral`
    pub collateral_per_unit_staked: U256,
    /// Debt reward per unit staked added to `L_debt`
    pub debt_per_unit_staked: U256,
    /// Truncation remainder carried into the next collateral redistribution
    pub collateral_error: U256,
    /// Truncation remainder carried into the next debt redistribution
    pub debt_error: U256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// REWARD SNAPSHOT ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Owner of positions, stakes, the `L` accumulators and the active/default pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RewardSnapshotEngine {
    positions: BTreeMap<PositionId, Position>,
    total_stakes: Decimal18,
    total_stakes_snapshot: Decimal18,
    total_collateral_snapshot: Decimal18,
    l_collateral: U256,
    l_debt: U256,
    last_collateral_error_redistribution: U256,
    last_debt_error_redistribution: U256,
    active_pool: ActivePool,
    default_pool: DefaultPool,
}

impl RewardSnapshotEngine {
    /// Create an empty engine
    pub fn new() -> Self {
        Self::default()
    }

    // ═══ Accessors ═══

    /// Position record, whatever its status
    pub fn position(&self, id: &PositionId) -> Option<&Position> {
        self.positions.get(id)
    }

    /// Status of a position (`NonExistent` when unknown)
    pub fn status(&self, id: &PositionId) -> PositionStatus {
        self.positions
            .get(id)
            .map(|p| p.status())
            .unwrap_or_default()
    }

    /// All active positions
    pub fn active_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_active())
    }

    /// Number of active positions
    pub fn active_count(&self) -> usize {
        self.active_positions().count()
    }

    /// Sum of all stakes
    pub fn total_stakes(&self) -> Decimal18 {
        self.total_stakes
    }

    /// `totalStakes` at the last liquidation
    pub fn total_stakes_snapshot(&self) -> Decimal18 {
        self.total_stakes_snapshot
    }

    /// Active plus default collateral (minus gas compensation) at the last liquidation
    pub fn total_collateral_snapshot(&self) -> Decimal18 {
        self.total_collateral_snapshot
    }

    /// `L_collateral` accumulator
    pub fn l_collateral(&self) -> U256 {
        self.l_collateral
    }

    /// `L_debt` accumulator
    pub fn l_debt(&self) -> U256 {
        self.l_debt
    }

    /// Truncation remainders `(collateral, debt)` carried to the next redistribution
    pub fn redistribution_errors(&self) -> (U256, U256) {
        (
            self.last_collateral_error_redistribution,
            self.last_debt_error_redistribution,
        )
    }

    /// Active pool
    pub fn active_pool(&self) -> &ActivePool {
        &self.active_pool
    }

    /// Default pool
    pub fn default_pool(&self) -> &DefaultPool {
        &self.default_pool
    }

    pub(crate) fn active_pool_mut(&mut self) -> &mut ActivePool {
        &mut self.active_pool
    }

    /// Number of positions ever opened, closed ones included
    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    fn require_active(&self, id: &PositionId) -> Result<&Position> {
        match self.positions.get(id) {
            Some(position) if position.is_active() => Ok(position),
            _ => Err(Error::NoStakeOrPosition(*id)),
        }
    }

    // ═══ Pending rewards ═══

    fn pending_reward(stake: Decimal18, accumulator: U256, snapshot: U256) -> Result<Decimal18> {
        let per_unit = math::checked_sub(accumulator, snapshot, "pending reward")?;
        if per_unit.is_zero() {
            return Ok(Decimal18::ZERO);
        }
        let reward = math::mul_div(stake.raw(), per_unit, precision(), "pending reward")?;
        Ok(Decimal18::from_raw(reward))
    }

    /// Redistributed collateral owed to a position; zero unless active
    pub fn pending_collateral_reward(&self, id: &PositionId) -> Result<Decimal18> {
        match self.positions.get(id) {
            Some(p) if p.is_active() => {
                Self::pending_reward(p.stake(), self.l_collateral, p.snapshot().collateral)
            }
            _ => Ok(Decimal18::ZERO),
        }
    }

    /// Redistributed debt owed to a position; zero unless active
    pub fn pending_debt_reward(&self, id: &PositionId) -> Result<Decimal18> {
        match self.positions.get(id) {
            Some(p) if p.is_active() => Self::pending_reward(p.stake(), self.l_debt, p.snapshot().debt),
            _ => Ok(Decimal18::ZERO),
        }
    }

    /// Whether a redistribution happened since the position's last snapshot
    pub fn has_pending_rewards(&self, id: &PositionId) -> bool {
        match self.positions.get(id) {
            Some(p) if p.is_active() => {
                p.snapshot().collateral < self.l_collateral || p.snapshot().debt < self.l_debt
            }
            _ => false,
        }
    }

    /// Entire debt and collateral with pending rewards added, without mutating anything
    pub fn entire_debt_and_coll(&self, id: &PositionId) -> Result<Reconciled> {
        let position = self.require_active(id)?;
        let pending_debt = self.pending_debt_reward(id)?;
        let pending_collateral = self.pending_collateral_reward(id)?;

        Ok(Reconciled::new(
            *id,
            position.stored_debt().checked_add(pending_debt)?,
            position.stored_collateral().checked_add(pending_collateral)?,
            pending_debt,
            pending_collateral,
        ))
    }

    fn check_available(pool: &dyn AssetPool, asset: Asset, amount: Decimal18) -> Result<()> {
        if pool.balance(asset) < amount {
            return Err(Error::Underflow {
                operation: format!("{} {:?} below {}", pool.name(), asset, amount),
            });
        }
        Ok(())
    }

    fn move_pending_to_active(&mut self, debt: Decimal18, collateral: Decimal18) -> Result<()> {
        Self::check_available(&self.default_pool, Asset::Debt, debt)?;
        Self::check_available(&self.default_pool, Asset::Collateral, collateral)?;
        move_between(&mut self.default_pool, &mut self.active_pool, Asset::Debt, debt)?;
        move_between(&mut self.default_pool, &mut self.active_pool, Asset::Collateral, collateral)
    }

    /// Realize pending rewards into the position's stored values.
    ///
    /// Moves the rewards from the default pool to the active pool and resets the
    /// position's snapshots to the current accumulators.
    pub fn apply_pending_rewards(&mut self, id: &PositionId) -> Result<Reconciled> {
        let reconciled = self.entire_debt_and_coll(id)?;
        if !self.has_pending_rewards(id) {
            return Ok(reconciled);
        }

        self.move_pending_to_active(reconciled.pending_debt(), reconciled.pending_collateral())?;

        let snapshot = self.current_snapshot();
        if let Some(position) = self.positions.get_mut(id) {
            position.set_debt_and_collateral(reconciled.debt(), reconciled.collateral());
            position.set_snapshot(snapshot);
        }

        tracing::debug!(
            position = %id,
            pending_debt = %reconciled.pending_debt(),
            pending_collateral = %reconciled.pending_collateral(),
            "applied pending rewards"
        );
        Ok(reconciled)
    }

    fn current_snapshot(&self) -> RewardSnapshot {
        RewardSnapshot {
            collateral: self.l_collateral,
            debt: self.l_debt,
        }
    }

    /// Set a position's reward snapshots to the current accumulators
    pub fn update_reward_snapshots(&mut self, id: &PositionId) -> Result<()> {
        self.require_active(id)?;
        let snapshot = self.current_snapshot();
        if let Some(position) = self.positions.get_mut(id) {
            position.set_snapshot(snapshot);
        }
        Ok(())
    }

    // ═══ Stakes ═══

    /// Stake a position holding `collateral` would receive right now
    pub fn compute_new_stake(&self, collateral: Decimal18) -> Result<Decimal18> {
        if self.total_collateral_snapshot.is_zero() {
            return Ok(collateral);
        }
        if self.total_stakes_snapshot.is_zero() {
            return Err(Error::InvariantViolation(
                "total stakes snapshot is zero while collateral snapshot is not".into(),
            ));
        }
        collateral.mul_div(self.total_stakes_snapshot, self.total_collateral_snapshot)
    }

    /// Recompute the position's stake from its stored collateral and refresh `totalStakes`
    pub fn update_stake_and_total_stakes(&mut self, id: &PositionId) -> Result<Decimal18> {
        let position = self.require_active(id)?;
        let old_stake = position.stake();
        let new_stake = self.compute_new_stake(position.stored_collateral())?;

        let total = self
            .total_stakes
            .checked_sub(old_stake)
            .map_err(|_| Error::InvariantViolation("stake exceeds total stakes".into()))?
            .checked_add(new_stake)?;

        self.total_stakes = total;
        if let Some(position) = self.positions.get_mut(id) {
            position.set_stake(new_stake);
        }

        tracing::debug!(position = %id, stake = %new_stake, total_stakes = %total, "stake updated");
        Ok(new_stake)
    }

    /// Remove the position's stake from `totalStakes` and zero it
    pub fn remove_stake(&mut self, id: &PositionId) -> Result<()> {
        let stake = self.require_active(id)?.stake();
        self.total_stakes = self
            .total_stakes
            .checked_sub(stake)
            .map_err(|_| Error::InvariantViolation("stake exceeds total stakes".into()))?;
        if let Some(position) = self.positions.get_mut(id) {
            position.set_stake(Decimal18::ZERO);
        }
        Ok(())
    }

    /// Refresh the stake baseline after a liquidation.
    ///
    /// `coll_remainder` is collateral still in the active pool that is about to
    /// leave the system (gas compensation).
    pub fn update_system_snapshots_exclude_coll_remainder(
        &mut self,
        coll_remainder: Decimal18,
    ) -> Result<()> {
        let active = self.active_pool.balance(Asset::Collateral);
        let liquidated = self.default_pool.balance(Asset::Collateral);

        self.total_stakes_snapshot = self.total_stakes;
        self.total_collateral_snapshot = active.checked_sub(coll_remainder)?.checked_add(liquidated)?;

        tracing::debug!(
            total_stakes_snapshot = %self.total_stakes_snapshot,
            total_collateral_snapshot = %self.total_collateral_snapshot,
            "system snapshots updated"
        );
        Ok(())
    }

    // ═══ Redistribution ═══

    /// Compute the accumulator update for redistributing `debt` and `collateral`.
    ///
    /// `stakes_removed` is stake that will have been removed from `totalStakes`
    /// by the time the plan is applied (positions closed in the same batch).
    /// Returns `None` when there is no debt to redistribute.
    pub fn plan_redistribution(
        &self,
        debt: Decimal18,
        collateral: Decimal18,
        stakes_removed: Decimal18,
    ) -> Result<Option<RedistributionPlan>> {
        if debt.is_zero() {
            return Ok(None);
        }

        let total_stakes = self.total_stakes.checked_sub(stakes_removed)?.raw();
        if total_stakes.is_zero() {
            return Err(Error::DivisionByZero {
                operation: "redistribution over zero total stakes".into(),
            });
        }

        let coll_numerator = math::checked_add(
            math::checked_mul(collateral.raw(), precision(), "redistribution")?,
            self.last_collateral_error_redistribution,
            "redistribution",
        )?;
        let debt_numerator = math::checked_add(
            math::checked_mul(debt.raw(), precision(), "redistribution")?,
            self.last_debt_error_redistribution,
            "redistribution",
        )?;

        let collateral_per_unit_staked = coll_numerator / total_stakes;
        let debt_per_unit_staked = debt_numerator / total_stakes;

        Ok(Some(RedistributionPlan {
            debt,
            collateral,
            collateral_per_unit_staked,
            debt_per_unit_staked,
            collateral_error: coll_numerator - collateral_per_unit_staked * total_stakes,
            debt_error: debt_numerator - debt_per_unit_staked * total_stakes,
        }))
    }

    /// Apply a previously computed redistribution plan
    pub fn apply_redistribution(&mut self, plan: &RedistributionPlan) -> Result<()> {
        Self::check_available(&self.active_pool, Asset::Debt, plan.debt)?;
        Self::check_available(&self.active_pool, Asset::Collateral, plan.collateral)?;
        let l_collateral = math::checked_add(
            self.l_collateral,
            plan.collateral_per_unit_staked,
            "L_collateral",
        )?;
        let l_debt = math::checked_add(self.l_debt, plan.debt_per_unit_staked, "L_debt")?;

        move_between(&mut self.active_pool, &mut self.default_pool, Asset::Debt, plan.debt)?;
        move_between(
            &mut self.active_pool,
            &mut self.default_pool,
            Asset::Collateral,
            plan.collateral,
        )?;

        self.l_collateral = l_collateral;
        self.l_debt = l_debt;
        self.last_collateral_error_redistribution = plan.collateral_error;
        self.last_debt_error_redistribution = plan.debt_error;

        tracing::debug!(
            l_collateral = %self.l_collateral,
            l_debt = %self.l_debt,
            debt = %plan.debt,
            collateral = %plan.collateral,
            "L terms updated"
        );
        Ok(())
    }

    /// Spread `debt` and `collateral` over all stakes
    pub fn redistribute_debt_and_collateral(
        &mut self,
        debt: Decimal18,
        collateral: Decimal18,
    ) -> Result<()> {
        match self.plan_redistribution(debt, collateral, Decimal18::ZERO)? {
            Some(plan) => self.apply_redistribution(&plan),
            None => Ok(()),
        }
    }

    // ═══ Position lifecycle ═══

    /// Open (or reopen) a position, crediting the active pool and setting stake and snapshots
    pub(crate) fn open_position(
        &mut self,
        owner: PositionId,
        collateral: Decimal18,
        debt: Decimal18,
    ) -> Result<Decimal18> {
        if self.status(&owner).is_active() {
            return Err(Error::PositionAlreadyActive(owner));
        }
        self.active_pool.balance(Asset::Collateral).checked_add(collateral)?;
        self.active_pool.balance(Asset::Debt).checked_add(debt)?;

        match self.positions.get_mut(&owner) {
            Some(position) => position.reopen(collateral, debt),
            None => {
                self.positions
                    .insert(owner, Position::open(owner, collateral, debt));
            }
        }
        self.active_pool.credit(Asset::Collateral, collateral)?;
        self.active_pool.credit(Asset::Debt, debt)?;

        self.update_reward_snapshots(&owner)?;
        self.update_stake_and_total_stakes(&owner)
    }

    /// Overwrite a reconciled position's stored values, settling the difference with the active pool
    pub(crate) fn set_position_balances(
        &mut self,
        reconciled: &Reconciled,
        collateral: Decimal18,
        debt: Decimal18,
    ) -> Result<()> {
        let id = reconciled.owner();
        let position = self.require_active(&id)?;
        if position.stored_collateral() != reconciled.collateral()
            || position.stored_debt() != reconciled.debt()
        {
            return Err(Error::InvariantViolation(format!(
                "position {} changed since reconciliation",
                id
            )));
        }

        let mut active = self.active_pool.clone();
        if collateral >= reconciled.collateral() {
            active.credit(Asset::Collateral, collateral.checked_sub(reconciled.collateral())?)?;
        } else {
            active.debit(Asset::Collateral, reconciled.collateral().checked_sub(collateral)?)?;
        }
        if debt >= reconciled.debt() {
            active.credit(Asset::Debt, debt.checked_sub(reconciled.debt())?)?;
        } else {
            active.debit(Asset::Debt, reconciled.debt().checked_sub(debt)?)?;
        }

        self.active_pool = active;
        if let Some(position) = self.positions.get_mut(&id) {
            position.set_debt_and_collateral(debt, collateral);
        }
        Ok(())
    }

    /// Close a position whose pending rewards are realized in `reconciled`.
    ///
    /// Pending rewards are moved into the active pool so the active pool holds
    /// the position's entire debt and collateral; the caller decides where they go.
    pub(crate) fn close_position(
        &mut self,
        reconciled: &Reconciled,
        status: PositionStatus,
    ) -> Result<()> {
        let id = reconciled.owner();
        self.require_active(&id)?;
        if reconciled.pending_debt() > Decimal18::ZERO
            || reconciled.pending_collateral() > Decimal18::ZERO
        {
            self.move_pending_to_active(reconciled.pending_debt(), reconciled.pending_collateral())?;
        }
        self.remove_stake(&id)?;
        if let Some(position) = self.positions.get_mut(&id) {
            position.close(status);
        }
        Ok(())
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

    /// Opens A (coll 1, debt 100) and B (coll 2, debt 100), then closes A and
    /// redistributes its debt and collateral net of 0.5% gas compensation.
    fn liquidated_setup() -> RewardSnapshotEngine {
        let mut engine = RewardSnapshotEngine::new();
        engine.open_position(id(1), d("1"), d("100")).unwrap();
        engine.open_position(id(2), d("2"), d("100")).unwrap();

        let reconciled = engine.apply_pending_rewards(&id(1)).unwrap();
        engine
            .close_position(&reconciled, PositionStatus::ClosedByLiquidation)
            .unwrap();
        engine
            .redistribute_debt_and_collateral(d("100"), d("0.995"))
            .unwrap();
        engine
            .update_system_snapshots_exclude_coll_remainder(d("0.005"))
            .unwrap();
        engine
    }

    #[test]
    fn test_initial_stake_equals_collateral() {
        let mut engine = RewardSnapshotEngine::new();
        let stake = engine.open_position(id(1), d("2"), d("100")).unwrap();
        assert_eq!(stake, d("2"));
        assert_eq!(engine.total_stakes(), d("2"));
        assert!(matches!(
            engine.open_position(id(1), d("1"), d("1")),
            Err(Error::PositionAlreadyActive(_))
        ));
    }

    #[test]
    fn test_redistribution_to_survivor() {
        let mut engine = liquidated_setup();

        assert_eq!(engine.pending_collateral_reward(&id(2)).unwrap(), d("0.995"));
        assert_eq!(engine.pending_debt_reward(&id(2)).unwrap(), d("100"));
        assert!(engine.has_pending_rewards(&id(2)));
        assert_eq!(engine.default_pool().balances().collateral, d("0.995"));

        let reconciled = engine.apply_pending_rewards(&id(2)).unwrap();
        assert_eq!(reconciled.collateral(), d("2.995"));
        assert_eq!(reconciled.debt(), d("200"));
        assert!(!engine.has_pending_rewards(&id(2)));
        assert!(engine.default_pool().balances().collateral.is_zero());
        assert!(engine.default_pool().balances().debt.is_zero());
    }

    #[test]
    fn test_pending_rewards_zero_for_closed_positions() {
        let engine = liquidated_setup();
        assert!(engine.pending_collateral_reward(&id(1)).unwrap().is_zero());
        assert!(engine.pending_debt_reward(&id(1)).unwrap().is_zero());
        assert!(engine.pending_debt_reward(&id(99)).unwrap().is_zero());
        assert!(matches!(
            engine.entire_debt_and_coll(&id(1)),
            Err(Error::NoStakeOrPosition(_))
        ));
    }

    #[test]
    fn test_stake_after_liquidation_uses_snapshot_ratio() {
        let mut engine = liquidated_setup();
        // Snapshot: stakes 2 against collateral 2 + 0.995
        assert_eq!(engine.total_stakes_snapshot(), d("2"));
        assert_eq!(engine.total_collateral_snapshot(), d("2.995"));

        let stake = engine.open_position(id(3), d("2.995"), d("100")).unwrap();
        assert_eq!(stake, d("2"));
    }

    #[test]
    fn test_redistribution_error_carried_forward() {
        let mut engine = RewardSnapshotEngine::new();
        for n in 1..=3 {
            engine.open_position(id(n), d("1"), d("10")).unwrap();
        }

        // 1 wei of each over 3e18 stakes truncates; the remainder is carried
        for _ in 0..3 {
            engine
                .redistribute_debt_and_collateral(Decimal18::from_wei(1), Decimal18::from_wei(1))
                .unwrap();
        }

        let (coll_error, debt_error) = engine.redistribution_errors();
        assert!(coll_error < U256::from(3_000_000_000_000_000_000u64));
        assert!(debt_error < U256::from(3_000_000_000_000_000_000u64));
        // 3 wei redistributed over 3 equal stakes: exactly 1 wei each
        assert_eq!(engine.l_collateral(), U256::one());
        assert_eq!(
            engine.pending_collateral_reward(&id(1)).unwrap(),
            Decimal18::from_wei(1)
        );
    }

    #[test]
    fn test_redistribution_requires_stakes() {
        let mut engine = RewardSnapshotEngine::new();
        let err = engine
            .redistribute_debt_and_collateral(d("1"), d("1"))
            .unwrap_err();
        assert!(matches!(err, Error::DivisionByZero { .. }));
        // Zero debt is a no-op even without stakes
        engine
            .redistribute_debt_and_collateral(Decimal18::ZERO, Decimal18::ZERO)
            .unwrap();
    }

    #[test]
    fn test_set_position_balances() {
        let mut engine = RewardSnapshotEngine::new();
        engine.open_position(id(1), d("5"), d("300")).unwrap();

        let reconciled = engine.apply_pending_rewards(&id(1)).unwrap();
        engine
            .set_position_balances(&reconciled, d("4"), d("350"))
            .unwrap();

        assert_eq!(engine.active_pool().balances().collateral, d("4"));
        assert_eq!(engine.active_pool().balances().debt, d("350"));

        // A stale reconciled view is rejected
        assert!(engine
            .set_position_balances(&reconciled, d("1"), d("1"))
            .is_err());
    }
}
