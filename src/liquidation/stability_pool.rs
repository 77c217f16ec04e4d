//! Stability pool accounting (product/sum scheme).
//!
//! Depositors' stablecoin absorbs liquidated debt in exchange for the
//! liquidated collateral. Per-depositor values are derived in O(1) from:
//!
//! - `P`: running product of `(1 - loss per unit)` over all offsets
//! - `S[epoch][scale]`: collateral gained per unit deposited, weighted by `P`
//! - `G[epoch][scale]`: secondary tokens gained per unit deposited, weighted by `P`
//!
//! When `P` would drop below 1e9 it is multiplied by 1e9 and the scale index
//! increments. When an offset empties the pool the epoch increments and `P`
//! restarts at 1e18; deposits snapshotted in an older epoch are worth zero.
//!
//! Front ends register a kickback rate; depositors tagged with a front end
//! receive that share of their secondary gains and the front end the rest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::config::EngineConfig;
use crate::core::pools::{move_between, ActivePool, Asset, AssetPool, StabilityPoolHoldings};
use crate::error::{Error, Result};
use crate::liquidation::issuance::{CommunityIssuance, IssuancePlan};
use crate::utils::constants::SCALE_FACTOR;
use crate::utils::crypto::Address;
use crate::utils::math::{self, precision, Decimal18, U256};

/// `(epoch, scale)` index into the S and G accumulators
pub type EpochScale = (u64, u64);

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOTS AND RECORDS
// ═══════════════════════════════════════════════════════════════════════════════

/// Accumulator values captured when a deposit or front-end stake last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSnapshot {
    /// Product `P`
    pub p: U256,
    /// Sum `S` at the snapshot's epoch and scale
    pub s: U256,
    /// Sum `G` at the snapshot's epoch and scale
    pub g: U256,
    /// Scale index
    pub scale: u64,
    /// Epoch index
    pub epoch: u64,
}

/// A depositor's position in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Value at the last deposit change, before any later offsets
    pub initial_value: Decimal18,
    /// Front end the deposit was made through, fixed on first deposit
    pub front_end_tag: Option<Address>,
    /// Accumulators at the last deposit change
    pub snapshot: DepositSnapshot,
}

/// A registered front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontEnd {
    /// Share of secondary gains passed through to tagged depositors
    pub kickback_rate: Decimal18,
    /// Sum of tagged deposits at the last stake change
    pub stake: Decimal18,
    /// Accumulators at the last stake change (`s` unused)
    pub snapshot: Option<DepositSnapshot>,
}

/// Effects of a provide, withdraw or gain-to-position call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositChange {
    /// Depositor
    pub depositor: Address,
    /// Front end tag of the deposit
    pub front_end: Option<Address>,
    /// Compounded deposit before the change
    pub compounded_before: Decimal18,
    /// Deposit after the change
    pub deposit_after: Decimal18,
    /// Stablecoin added to the pool
    pub deposited: Decimal18,
    /// Stablecoin returned to the depositor
    pub withdrawn: Decimal18,
    /// Collateral gain released from the pool
    pub collateral_gain: Decimal18,
    /// Secondary tokens owed to the depositor
    pub depositor_secondary_gain: Decimal18,
    /// Secondary tokens owed to the front end
    pub front_end_secondary_gain: Decimal18,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLANS
// ═══════════════════════════════════════════════════════════════════════════════

/// Issuance trigger plus the resulting `G` update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryUpdate {
    /// Issuance to commit
    pub issuance: IssuancePlan,
    /// New `G` value at `key`, when the issuance is distributed
    pub g: Option<(EpochScale, U256)>,
    /// Truncation remainder carried into the next distribution
    pub g_error: U256,
}

/// Accumulator updates for one offset, computed without mutating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetPlan {
    /// Debt absorbed (and burned) by the pool
    pub debt: Decimal18,
    /// Collateral added to the pool
    pub collateral: Decimal18,
    /// Issuance triggered before the offset
    pub secondary: SecondaryUpdate,
    /// Collateral gain per unit deposited
    pub collateral_gain_per_unit: U256,
    /// Debt loss per unit deposited (rounded up)
    pub debt_loss_per_unit: U256,
    /// Index whose `S` value changes
    pub s_key: EpochScale,
    /// New `S` value at `s_key`
    pub s: U256,
    /// New product `P`
    pub p: U256,
    /// New scale
    pub scale: u64,
    /// New epoch
    pub epoch: u64,
    /// Collateral truncation remainder
    pub collateral_error: U256,
    /// Debt loss rounding remainder
    pub debt_loss_error: U256,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Stability pool state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilityPool {
    deposits: BTreeMap<Address, Deposit>,
    front_ends: BTreeMap<Address, FrontEnd>,
    p: U256,
    current_scale: u64,
    current_epoch: u64,
    /// epoch -> scale -> S
    epoch_to_scale_to_sum: BTreeMap<u64, BTreeMap<u64, U256>>,
    /// epoch -> scale -> G
    epoch_to_scale_to_g: BTreeMap<u64, BTreeMap<u64, U256>>,
    last_collateral_error_offset: U256,
    last_debt_loss_error_offset: U256,
    last_secondary_error: U256,
    holdings: StabilityPoolHoldings,
    issuance: CommunityIssuance,
    dust_divisor: u64,
}

fn lookup(map: &BTreeMap<u64, BTreeMap<u64, U256>>, (epoch, scale): EpochScale) -> U256 {
    map.get(&epoch)
        .and_then(|scales| scales.get(&scale))
        .copied()
        .unwrap_or_default()
}

fn store(map: &mut BTreeMap<u64, BTreeMap<u64, U256>>, (epoch, scale): EpochScale, value: U256) {
    map.entry(epoch).or_default().insert(scale, value);
}

impl StabilityPool {
    /// Create an empty pool
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            deposits: BTreeMap::new(),
            front_ends: BTreeMap::new(),
            p: precision(),
            current_scale: 0,
            current_epoch: 0,
            epoch_to_scale_to_sum: BTreeMap::new(),
            epoch_to_scale_to_g: BTreeMap::new(),
            last_collateral_error_offset: U256::zero(),
            last_debt_loss_error_offset: U256::zero(),
            last_secondary_error: U256::zero(),
            holdings: StabilityPoolHoldings::new(),
            issuance: CommunityIssuance::new(config),
            dust_divisor: config.deposit_dust_divisor,
        }
    }

    // ═══ Accessors ═══

    /// Total stablecoin deposited
    pub fn total_deposits(&self) -> Decimal18 {
        self.holdings.balance(Asset::Debt)
    }

    /// Collateral held for depositors
    pub fn collateral_balance(&self) -> Decimal18 {
        self.holdings.balance(Asset::Collateral)
    }

    /// Pool holdings
    pub fn holdings(&self) -> &StabilityPoolHoldings {
        &self.holdings
    }

    /// Product accumulator `P`
    pub fn p(&self) -> U256 {
        self.p
    }

    /// Current scale index
    pub fn current_scale(&self) -> u64 {
        self.current_scale
    }

    /// Current epoch index
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    /// `S` at an epoch and scale
    pub fn sum_at(&self, epoch: u64, scale: u64) -> U256 {
        lookup(&self.epoch_to_scale_to_sum, (epoch, scale))
    }

    /// `G` at an epoch and scale
    pub fn g_at(&self, epoch: u64, scale: u64) -> U256 {
        lookup(&self.epoch_to_scale_to_g, (epoch, scale))
    }

    /// Offset error terms `(collateral, debt loss)`
    pub fn offset_errors(&self) -> (U256, U256) {
        (self.last_collateral_error_offset, self.last_debt_loss_error_offset)
    }

    /// Deposit record
    pub fn deposit(&self, depositor: &Address) -> Option<&Deposit> {
        self.deposits.get(depositor)
    }

    /// Number of depositors with a recorded deposit
    pub fn depositor_count(&self) -> usize {
        self.deposits.len()
    }

    /// Front end record
    pub fn front_end(&self, front_end: &Address) -> Option<&FrontEnd> {
        self.front_ends.get(front_end)
    }

    /// Issuance schedule
    pub fn issuance(&self) -> &CommunityIssuance {
        &self.issuance
    }

    fn current_key(&self) -> EpochScale {
        (self.current_epoch, self.current_scale)
    }

    fn g_with(&self, key: EpochScale, pending: Option<&SecondaryUpdate>) -> U256 {
        match pending.and_then(|update| update.g) {
            Some((pending_key, value)) if pending_key == key => value,
            _ => lookup(&self.epoch_to_scale_to_g, key),
        }
    }

    fn snapshot_now(&self, pending: Option<&SecondaryUpdate>) -> DepositSnapshot {
        let key = self.current_key();
        DepositSnapshot {
            p: self.p,
            s: lookup(&self.epoch_to_scale_to_sum, key),
            g: self.g_with(key, pending),
            scale: self.current_scale,
            epoch: self.current_epoch,
        }
    }

    // ═══ Compounding ═══

    fn compounded_from_snapshot(
        &self,
        initial: Decimal18,
        snapshot: &DepositSnapshot,
    ) -> Result<Decimal18> {
        // Pool was emptied since the snapshot
        if snapshot.epoch < self.current_epoch {
            return Ok(Decimal18::ZERO);
        }

        let scale_diff = self.current_scale.saturating_sub(snapshot.scale);
        let compounded = match scale_diff {
            0 => math::mul_div(initial.raw(), self.p, snapshot.p, "compounded deposit")?,
            1 => {
                math::mul_div(initial.raw(), self.p, snapshot.p, "compounded deposit")?
                    / U256::from(SCALE_FACTOR)
            }
            _ => U256::zero(),
        };

        // Anything below a billionth of the initial value is rounding residue
        let dust = initial.raw() / U256::from(self.dust_divisor);
        if compounded < dust {
            return Ok(Decimal18::ZERO);
        }
        Ok(Decimal18::from_raw(compounded))
    }

    fn gain_from_snapshots(
        &self,
        initial: Decimal18,
        snapshot: &DepositSnapshot,
        snapshot_value: U256,
        current: impl Fn(EpochScale) -> U256,
    ) -> Result<U256> {
        let first_portion = math::checked_sub(
            current((snapshot.epoch, snapshot.scale)),
            snapshot_value,
            "gain first portion",
        )?;
        let second_portion =
            current((snapshot.epoch, snapshot.scale + 1)) / U256::from(SCALE_FACTOR);
        let per_unit = math::checked_add(first_portion, second_portion, "gain portions")?;

        let gain = math::mul_div(initial.raw(), per_unit, snapshot.p, "gain from snapshots")?;
        Ok(gain / precision())
    }

    /// Current value of a deposit after all offsets
    pub fn compounded_deposit(&self, depositor: &Address) -> Result<Decimal18> {
        match self.deposits.get(depositor) {
            Some(deposit) => self.compounded_from_snapshot(deposit.initial_value, &deposit.snapshot),
            None => Ok(Decimal18::ZERO),
        }
    }

    /// Current value of a front end's stake after all offsets
    pub fn compounded_front_end_stake(&self, front_end: &Address) -> Result<Decimal18> {
        match self.front_ends.get(front_end) {
            Some(FrontEnd {
                stake,
                snapshot: Some(snapshot),
                ..
            }) if !stake.is_zero() => self.compounded_from_snapshot(*stake, snapshot),
            _ => Ok(Decimal18::ZERO),
        }
    }

    /// Collateral gained by a depositor since the last deposit change
    pub fn depositor_collateral_gain(&self, depositor: &Address) -> Result<Decimal18> {
        let deposit = match self.deposits.get(depositor) {
            Some(deposit) if !deposit.initial_value.is_zero() => deposit,
            _ => return Ok(Decimal18::ZERO),
        };
        let gain = self.gain_from_snapshots(
            deposit.initial_value,
            &deposit.snapshot,
            deposit.snapshot.s,
            |key| lookup(&self.epoch_to_scale_to_sum, key),
        )?;
        Ok(Decimal18::from_raw(gain))
    }

    fn kickback_rate(&self, tag: Option<Address>) -> Decimal18 {
        tag.and_then(|fe| self.front_ends.get(&fe))
            .map(|fe| fe.kickback_rate)
            .unwrap_or(Decimal18::ONE)
    }

    fn depositor_secondary_gain_with(
        &self,
        depositor: &Address,
        pending: Option<&SecondaryUpdate>,
    ) -> Result<Decimal18> {
        let deposit = match self.deposits.get(depositor) {
            Some(deposit) if !deposit.initial_value.is_zero() => deposit,
            _ => return Ok(Decimal18::ZERO),
        };
        let kickback = self.kickback_rate(deposit.front_end_tag);
        let gain = self.gain_from_snapshots(
            deposit.initial_value,
            &deposit.snapshot,
            deposit.snapshot.g,
            |key| self.g_with(key, pending),
        )?;
        let gain = math::mul_div(kickback.raw(), gain, precision(), "depositor secondary gain")?;
        Ok(Decimal18::from_raw(gain))
    }

    fn front_end_secondary_gain_with(
        &self,
        front_end: &Address,
        pending: Option<&SecondaryUpdate>,
    ) -> Result<Decimal18> {
        let (fe, snapshot) = match self.front_ends.get(front_end) {
            Some(fe) if !fe.stake.is_zero() => match &fe.snapshot {
                Some(snapshot) => (fe, snapshot),
                None => return Ok(Decimal18::ZERO),
            },
            _ => return Ok(Decimal18::ZERO),
        };
        let share = Decimal18::ONE.checked_sub(fe.kickback_rate)?;
        let gain = self.gain_from_snapshots(fe.stake, snapshot, snapshot.g, |key| {
            self.g_with(key, pending)
        })?;
        let gain = math::mul_div(share.raw(), gain, precision(), "front end secondary gain")?;
        Ok(Decimal18::from_raw(gain))
    }

    /// Secondary tokens gained by a depositor (after the front-end kickback)
    pub fn depositor_secondary_gain(&self, depositor: &Address) -> Result<Decimal18> {
        self.depositor_secondary_gain_with(depositor, None)
    }

    /// Secondary tokens gained by a front end from its tagged deposits
    pub fn front_end_secondary_gain(&self, front_end: &Address) -> Result<Decimal18> {
        self.front_end_secondary_gain_with(front_end, None)
    }

    // ═══ Secondary issuance ═══

    /// Trigger issuance at `now` and compute the resulting `G` update
    pub fn plan_secondary_update(&self, now: u64) -> Result<SecondaryUpdate> {
        let issuance = self.issuance.plan_issue(now)?;
        let total = self.total_deposits().raw();

        // Issuance while the pool is empty is not distributed
        if total.is_zero() || issuance.issuance.is_zero() {
            return Ok(SecondaryUpdate {
                issuance,
                g: None,
                g_error: self.last_secondary_error,
            });
        }

        let numerator = math::checked_add(
            math::checked_mul(issuance.issuance.raw(), precision(), "G update")?,
            self.last_secondary_error,
            "G update",
        )?;
        let per_unit = numerator / total;
        let g_error = numerator - per_unit * total;

        let key = self.current_key();
        let marginal = math::checked_mul(per_unit, self.p, "G update")?;
        let g = math::checked_add(lookup(&self.epoch_to_scale_to_g, key), marginal, "G update")?;

        Ok(SecondaryUpdate {
            issuance,
            g: Some((key, g)),
            g_error,
        })
    }

    fn apply_secondary_update(&mut self, update: &SecondaryUpdate) {
        self.issuance.apply_issue(&update.issuance);
        self.last_secondary_error = update.g_error;
        if let Some((key, g)) = update.g {
            store(&mut self.epoch_to_scale_to_g, key, g);
            tracing::debug!(epoch = key.0, scale = key.1, g = %g, "G updated");
        }
    }

    /// Distribute newly issued secondary tokens over current deposits
    pub fn trigger_issuance(&mut self, now: u64) -> Result<Decimal18> {
        let update = self.plan_secondary_update(now)?;
        self.apply_secondary_update(&update);
        Ok(update.issuance.issuance)
    }

    // ═══ Offset ═══

    /// Compute the effect of absorbing `debt` and receiving `collateral`.
    ///
    /// Returns `None` when `debt` is zero. Offsetting against an empty pool is
    /// an error.
    pub fn plan_offset(
        &self,
        debt: Decimal18,
        collateral: Decimal18,
        now: u64,
    ) -> Result<Option<OffsetPlan>> {
        let total_deposits = self.total_deposits();
        if total_deposits.is_zero() {
            return Err(Error::PoolEmptyForOffset);
        }
        if debt.is_zero() {
            return Ok(None);
        }
        if debt > total_deposits {
            return Err(Error::InsufficientBalance {
                account: "stability_pool".into(),
                requested: debt,
                available: total_deposits,
            });
        }

        let secondary = self.plan_secondary_update(now)?;
        let total = total_deposits.raw();

        let coll_numerator = math::checked_add(
            math::checked_mul(collateral.raw(), precision(), "offset")?,
            self.last_collateral_error_offset,
            "offset",
        )?;

        let (debt_loss_per_unit, debt_loss_error) = if debt == total_deposits {
            // Full depletion: loss is exactly one and the error resets
            (precision(), U256::zero())
        } else {
            let loss_numerator = math::checked_sub(
                math::checked_mul(debt.raw(), precision(), "offset")?,
                self.last_debt_loss_error_offset,
                "offset",
            )?;
            // Round up so the pool never under-reports its loss
            let loss = loss_numerator / total + U256::one();
            (loss, loss * total - loss_numerator)
        };

        let collateral_gain_per_unit = coll_numerator / total;
        let collateral_error = coll_numerator - collateral_gain_per_unit * total;

        let new_product_factor = math::checked_sub(precision(), debt_loss_per_unit, "offset")?;

        let s_key = self.current_key();
        let marginal = math::checked_mul(collateral_gain_per_unit, self.p, "S update")?;
        let s = math::checked_add(lookup(&self.epoch_to_scale_to_sum, s_key), marginal, "S update")?;

        let scale_factor = U256::from(SCALE_FACTOR);
        let (p, scale, epoch) = if new_product_factor.is_zero() {
            (precision(), 0, self.current_epoch + 1)
        } else {
            let product = math::checked_mul(self.p, new_product_factor, "P update")?;
            if product / precision() < scale_factor {
                (
                    math::checked_mul(product, scale_factor, "P update")? / precision(),
                    self.current_scale + 1,
                    self.current_epoch,
                )
            } else {
                (product / precision(), self.current_scale, self.current_epoch)
            }
        };

        if p.is_zero() {
            return Err(Error::InvariantViolation("P would become zero".into()));
        }

        Ok(Some(OffsetPlan {
            debt,
            collateral,
            secondary,
            collateral_gain_per_unit,
            debt_loss_per_unit,
            s_key,
            s,
            p,
            scale,
            epoch,
            collateral_error,
            debt_loss_error,
        }))
    }

    /// Apply an offset: update accumulators, burn the absorbed debt from the
    /// pool and the active pool, and move the collateral into the pool.
    pub fn apply_offset(&mut self, plan: &OffsetPlan, active: &mut ActivePool) -> Result<()> {
        if active.balance(Asset::Debt) < plan.debt
            || active.balance(Asset::Collateral) < plan.collateral
            || self.holdings.balance(Asset::Debt) < plan.debt
        {
            return Err(Error::Underflow {
                operation: "offset balances".into(),
            });
        }

        self.apply_secondary_update(&plan.secondary);

        store(&mut self.epoch_to_scale_to_sum, plan.s_key, plan.s);
        tracing::debug!(
            epoch = plan.s_key.0,
            scale = plan.s_key.1,
            s = %plan.s,
            "S updated"
        );

        if plan.epoch != self.current_epoch {
            tracing::info!(epoch = plan.epoch, "stability pool emptied, epoch incremented");
        } else if plan.scale != self.current_scale {
            tracing::info!(scale = plan.scale, "P scaled up, scale incremented");
        }

        self.p = plan.p;
        self.current_scale = plan.scale;
        self.current_epoch = plan.epoch;
        self.last_collateral_error_offset = plan.collateral_error;
        self.last_debt_loss_error_offset = plan.debt_loss_error;
        tracing::debug!(p = %self.p, "P updated");

        active.debit(Asset::Debt, plan.debt)?;
        self.holdings.debit(Asset::Debt, plan.debt)?;
        move_between(active, &mut self.holdings, Asset::Collateral, plan.collateral)
    }

    /// Offset `debt` against the pool in exchange for `collateral` from `active`
    pub fn offset(
        &mut self,
        debt: Decimal18,
        collateral: Decimal18,
        active: &mut ActivePool,
        now: u64,
    ) -> Result<()> {
        match self.plan_offset(debt, collateral, now)? {
            Some(plan) => self.apply_offset(&plan, active),
            None => Ok(()),
        }
    }

    // ═══ Front ends ═══

    /// Register a front end with its kickback rate
    pub fn register_front_end(&mut self, front_end: Address, kickback_rate: Decimal18) -> Result<()> {
        if self.front_ends.contains_key(&front_end) {
            return Err(Error::FrontEndAlreadyRegistered(front_end));
        }
        if self.deposits.contains_key(&front_end) {
            return Err(Error::InvalidParameter {
                name: "front_end".into(),
                reason: format!("{} has an active deposit", front_end),
            });
        }
        if kickback_rate > Decimal18::ONE {
            return Err(Error::InvalidKickbackRate(kickback_rate));
        }

        self.front_ends.insert(
            front_end,
            FrontEnd {
                kickback_rate,
                stake: Decimal18::ZERO,
                snapshot: None,
            },
        );
        tracing::info!(front_end = %front_end, kickback_rate = %kickback_rate, "front end registered");
        Ok(())
    }

    fn set_front_end_stake(
        &mut self,
        front_end: Option<Address>,
        stake: Decimal18,
        snapshot: DepositSnapshot,
    ) {
        if let Some(fe) = front_end.and_then(|fe| self.front_ends.get_mut(&fe)) {
            fe.stake = stake;
            fe.snapshot = if stake.is_zero() { None } else { Some(snapshot) };
        }
    }

    fn set_deposit(
        &mut self,
        depositor: Address,
        value: Decimal18,
        front_end_tag: Option<Address>,
        snapshot: DepositSnapshot,
    ) {
        if value.is_zero() {
            self.deposits.remove(&depositor);
            return;
        }
        self.deposits.insert(
            depositor,
            Deposit {
                initial_value: value,
                front_end_tag,
                snapshot,
            },
        );
    }

    fn release_collateral_gain(&self, gain: Decimal18) -> Decimal18 {
        let available = self.collateral_balance();
        if gain > available {
            tracing::warn!(gain = %gain, available = %available, "collateral gain clamped to pool balance");
            return available;
        }
        gain
    }

    // ═══ Deposits ═══

    /// Add `amount` to a deposit, paying out accumulated gains
    pub fn provide(
        &mut self,
        depositor: Address,
        amount: Decimal18,
        front_end_tag: Option<Address>,
        now: u64,
    ) -> Result<DepositChange> {
        if let Some(tag) = front_end_tag {
            if !self.front_ends.contains_key(&tag) {
                return Err(Error::FrontEndNotRegistered(tag));
            }
        }
        if self.front_ends.contains_key(&depositor) {
            return Err(Error::FrontEndCannotDeposit(depositor));
        }
        if amount.is_zero() {
            return Err(Error::invalid_amount("stability pool deposit", amount));
        }

        let pending = self.plan_secondary_update(now)?;
        let existing = self.deposits.get(&depositor).copied();
        let front_end = match existing {
            Some(deposit) => deposit.front_end_tag,
            None => front_end_tag,
        };

        let collateral_gain = self.release_collateral_gain(self.depositor_collateral_gain(&depositor)?);
        let compounded = self.compounded_deposit(&depositor)?;
        let depositor_secondary_gain = self.depositor_secondary_gain_with(&depositor, Some(&pending))?;
        let front_end_secondary_gain = match front_end {
            Some(fe) => self.front_end_secondary_gain_with(&fe, Some(&pending))?,
            None => Decimal18::ZERO,
        };

        let front_end_stake = match front_end {
            Some(fe) => self.compounded_front_end_stake(&fe)?.checked_add(amount)?,
            None => Decimal18::ZERO,
        };
        let new_deposit = compounded.checked_add(amount)?;
        self.holdings.balance(Asset::Debt).checked_add(amount)?;

        // Effects
        self.apply_secondary_update(&pending);
        let snapshot = self.snapshot_now(None);
        self.set_front_end_stake(front_end, front_end_stake, snapshot);
        self.holdings.credit(Asset::Debt, amount)?;
        self.holdings.debit(Asset::Collateral, collateral_gain)?;
        self.set_deposit(depositor, new_deposit, front_end, snapshot);

        tracing::info!(
            depositor = %depositor,
            amount = %amount,
            deposit = %new_deposit,
            collateral_gain = %collateral_gain,
            "stability pool deposit"
        );

        Ok(DepositChange {
            depositor,
            front_end,
            compounded_before: compounded,
            deposit_after: new_deposit,
            deposited: amount,
            withdrawn: Decimal18::ZERO,
            collateral_gain,
            depositor_secondary_gain,
            front_end_secondary_gain,
        })
    }

    /// Withdraw up to `amount` of a compounded deposit, paying out accumulated gains.
    ///
    /// Requests above the compounded deposit are clamped. A non-zero withdrawal
    /// is refused while the caller reports undercollateralized positions.
    pub fn withdraw(
        &mut self,
        depositor: Address,
        amount: Decimal18,
        now: u64,
        has_undercollateralized_positions: bool,
    ) -> Result<DepositChange> {
        if !amount.is_zero() && has_undercollateralized_positions {
            return Err(Error::UndercollateralizedPositionsExist);
        }
        let deposit = match self.deposits.get(&depositor) {
            Some(deposit) if !deposit.initial_value.is_zero() => *deposit,
            _ => return Err(Error::NoDeposit(depositor)),
        };

        let pending = self.plan_secondary_update(now)?;
        let front_end = deposit.front_end_tag;

        let collateral_gain = self.release_collateral_gain(self.depositor_collateral_gain(&depositor)?);
        let compounded = self.compounded_deposit(&depositor)?;
        let to_withdraw = amount.min(compounded);
        if amount > compounded {
            tracing::warn!(
                depositor = %depositor,
                requested = %amount,
                available = %compounded,
                "withdrawal clamped to compounded deposit"
            );
        }

        let depositor_secondary_gain = self.depositor_secondary_gain_with(&depositor, Some(&pending))?;
        let front_end_secondary_gain = match front_end {
            Some(fe) => self.front_end_secondary_gain_with(&fe, Some(&pending))?,
            None => Decimal18::ZERO,
        };
        let front_end_stake = match front_end {
            Some(fe) => self.compounded_front_end_stake(&fe)?.saturating_sub(to_withdraw),
            None => Decimal18::ZERO,
        };
        let new_deposit = compounded.checked_sub(to_withdraw)?;
        if self.holdings.balance(Asset::Debt) < to_withdraw {
            return Err(Error::InsufficientBalance {
                account: "stability_pool".into(),
                requested: to_withdraw,
                available: self.holdings.balance(Asset::Debt),
            });
        }

        // Effects
        self.apply_secondary_update(&pending);
        let snapshot = self.snapshot_now(None);
        self.set_front_end_stake(front_end, front_end_stake, snapshot);
        self.holdings.debit(Asset::Debt, to_withdraw)?;
        self.holdings.debit(Asset::Collateral, collateral_gain)?;
        self.set_deposit(depositor, new_deposit, front_end, snapshot);

        tracing::info!(
            depositor = %depositor,
            withdrawn = %to_withdraw,
            deposit = %new_deposit,
            collateral_gain = %collateral_gain,
            "stability pool withdrawal"
        );

        Ok(DepositChange {
            depositor,
            front_end,
            compounded_before: compounded,
            deposit_after: new_deposit,
            deposited: Decimal18::ZERO,
            withdrawn: to_withdraw,
            collateral_gain,
            depositor_secondary_gain,
            front_end_secondary_gain,
        })
    }

    /// Release a depositor's collateral gain without changing the deposit value.
    ///
    /// The gain leaves the pool holdings; the caller credits it elsewhere.
    pub fn withdraw_collateral_gain(&mut self, depositor: Address, now: u64) -> Result<DepositChange> {
        let deposit = match self.deposits.get(&depositor) {
            Some(deposit) if !deposit.initial_value.is_zero() => *deposit,
            _ => return Err(Error::NoDeposit(depositor)),
        };

        let collateral_gain = self.release_collateral_gain(self.depositor_collateral_gain(&depositor)?);
        if collateral_gain.is_zero() {
            return Err(Error::invalid_amount("collateral gain", collateral_gain));
        }

        let pending = self.plan_secondary_update(now)?;
        let front_end = deposit.front_end_tag;
        let compounded = self.compounded_deposit(&depositor)?;
        let depositor_secondary_gain = self.depositor_secondary_gain_with(&depositor, Some(&pending))?;
        let front_end_secondary_gain = match front_end {
            Some(fe) => self.front_end_secondary_gain_with(&fe, Some(&pending))?,
            None => Decimal18::ZERO,
        };
        let front_end_stake = match front_end {
            Some(fe) => self.compounded_front_end_stake(&fe)?,
            None => Decimal18::ZERO,
        };

        // Effects
        self.apply_secondary_update(&pending);
        let snapshot = self.snapshot_now(None);
        self.set_front_end_stake(front_end, front_end_stake, snapshot);
        self.holdings.debit(Asset::Collateral, collateral_gain)?;
        self.set_deposit(depositor, compounded, front_end, snapshot);

        Ok(DepositChange {
            depositor,
            front_end,
            compounded_before: compounded,
            deposit_after: compounded,
            deposited: Decimal18::ZERO,
            withdrawn: Decimal18::ZERO,
            collateral_gain,
            depositor_secondary_gain,
            front_end_secondary_gain,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal18 {
        s.parse().unwrap()
    }

    fn addr(n: u64) -> Address {
        Address::from_index(n)
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn funded_active(coll: &str, debt: &str) -> ActivePool {
        let mut active = ActivePool::new();
        active.credit(Asset::Collateral, d(coll)).unwrap();
        active.credit(Asset::Debt, d(debt)).unwrap();
        active
    }

    #[test]
    fn test_deposit_then_withdraw_returns_deposit() {
        let mut pool = StabilityPool::new(&config());
        pool.provide(addr(1), d("1000"), None, 0).unwrap();
        assert_eq!(pool.compounded_deposit(&addr(1)).unwrap(), d("1000"));

        let change = pool.withdraw(addr(1), d("1000"), 0, false).unwrap();
        assert_eq!(change.withdrawn, d("1000"));
        assert!(pool.deposit(&addr(1)).is_none());
        assert!(pool.total_deposits().is_zero());
    }

    #[test]
    fn test_full_depletion_starts_new_epoch() {
        let mut pool = StabilityPool::new(&config());
        let mut active = funded_active("10", "1000");
        pool.provide(addr(1), d("1000"), None, 0).unwrap();

        pool.offset(d("1000"), d("9.95"), &mut active, 0).unwrap();

        assert_eq!(pool.current_epoch(), 1);
        assert_eq!(pool.current_scale(), 0);
        assert_eq!(pool.p(), precision());
        assert!(pool.total_deposits().is_zero());
        assert!(pool.compounded_deposit(&addr(1)).unwrap().is_zero());
        assert_eq!(pool.depositor_collateral_gain(&addr(1)).unwrap(), d("9.95"));

        let change = pool.withdraw(addr(1), Decimal18::ZERO, 0, true).unwrap();
        assert_eq!(change.collateral_gain, d("9.95"));
        assert!(pool.collateral_balance().is_zero());
    }

    #[test]
    fn test_partial_offset_shares_pro_rata() {
        let mut pool = StabilityPool::new(&config());
        let mut active = funded_active("10", "1000");
        pool.provide(addr(1), d("1000"), None, 0).unwrap();
        pool.provide(addr(2), d("3000"), None, 0).unwrap();

        pool.offset(d("400"), d("4"), &mut active, 0).unwrap();

        let a = pool.compounded_deposit(&addr(1)).unwrap();
        let b = pool.compounded_deposit(&addr(2)).unwrap();
        // Loss per unit rounds up, so deposits may be a few wei short
        assert!(d("900").abs_diff(a) < Decimal18::from_wei(10_000));
        assert!(d("2700").abs_diff(b) < Decimal18::from_wei(10_000));
        assert!(a.checked_add(b).unwrap() <= pool.total_deposits());

        let gain_a = pool.depositor_collateral_gain(&addr(1)).unwrap();
        let gain_b = pool.depositor_collateral_gain(&addr(2)).unwrap();
        assert!(d("1").abs_diff(gain_a) < Decimal18::from_wei(10_000));
        assert!(d("3").abs_diff(gain_b) < Decimal18::from_wei(10_000));
    }

    #[test]
    fn test_scale_change_keeps_precision() {
        let mut pool = StabilityPool::new(&config());
        let mut active = funded_active("100", "2000000");
        pool.provide(addr(1), d("1000000"), None, 0).unwrap();

        // Leave 1e-5 of the pool twice: P ~ 1e13, then ~1e8 which shifts the scale
        pool.offset(d("999990"), d("1"), &mut active, 0).unwrap();
        assert_eq!(pool.current_scale(), 0);
        assert!(pool.p() < U256::exp10(13));
        assert!(pool.p() > U256::exp10(13) - U256::from(10u64));

        pool.provide(addr(2), d("10"), None, 0).unwrap();
        let remaining = pool.total_deposits();
        let offset = remaining.checked_sub(remaining.div_int(100_000).unwrap()).unwrap();
        pool.offset(offset, d("1"), &mut active, 0).unwrap();
        assert_eq!(pool.current_scale(), 1);

        // The second depositor spans exactly one scale change
        let compounded = pool.compounded_deposit(&addr(2)).unwrap();
        assert!(d("0.0001").abs_diff(compounded) < Decimal18::from_wei(10_000_000));
    }

    #[test]
    fn test_front_end_kickback() {
        let mut config = config();
        config.supply_cap = d("1000000");
        let mut pool = StabilityPool::new(&config);
        let front_end = addr(50);

        pool.register_front_end(front_end, d("0.8")).unwrap();
        assert!(matches!(
            pool.register_front_end(front_end, d("0.5")),
            Err(Error::FrontEndAlreadyRegistered(_))
        ));
        assert!(matches!(
            pool.register_front_end(addr(51), d("1.1")),
            Err(Error::InvalidKickbackRate(_))
        ));
        assert!(matches!(
            pool.provide(front_end, d("1"), None, 0),
            Err(Error::FrontEndCannotDeposit(_))
        ));
        assert!(matches!(
            pool.provide(addr(1), d("1"), Some(addr(52)), 0),
            Err(Error::FrontEndNotRegistered(_))
        ));

        pool.provide(addr(1), d("1000"), Some(front_end), 0).unwrap();
        assert_eq!(pool.compounded_front_end_stake(&front_end).unwrap(), d("1000"));

        pool.trigger_issuance(86_400).unwrap();
        let depositor_gain = pool.depositor_secondary_gain(&addr(1)).unwrap();
        let front_end_gain = pool.front_end_secondary_gain(&front_end).unwrap();
        let issued = pool.issuance().total_issued();

        assert!(!depositor_gain.is_zero());
        // 80% to the depositor, 20% to the front end
        let four_times = front_end_gain.checked_add(front_end_gain).unwrap();
        let four_times = four_times.checked_add(four_times).unwrap();
        assert!(four_times.abs_diff(depositor_gain) < Decimal18::from_wei(1_000_000));
        assert!(depositor_gain.checked_add(front_end_gain).unwrap() <= issued);
    }

    #[test]
    fn test_withdraw_rules() {
        let mut pool = StabilityPool::new(&config());
        assert!(matches!(
            pool.withdraw(addr(1), d("1"), 0, false),
            Err(Error::NoDeposit(_))
        ));
        pool.provide(addr(1), d("100"), None, 0).unwrap();
        assert!(matches!(
            pool.withdraw(addr(1), d("1"), 0, true),
            Err(Error::UndercollateralizedPositionsExist)
        ));

        let change = pool.withdraw(addr(1), d("150"), 0, false).unwrap();
        assert_eq!(change.withdrawn, d("100"));
        assert!(matches!(
            pool.provide(addr(1), Decimal18::ZERO, None, 0),
            Err(Error::InvalidAmount { .. })
        ));
    }

    #[test]
    fn test_offset_on_empty_pool() {
        let pool = StabilityPool::new(&config());
        assert!(matches!(
            pool.plan_offset(d("1"), d("1"), 0),
            Err(Error::PoolEmptyForOffset)
        ));
    }

    #[test]
    fn test_failed_offset_leaves_state_untouched() {
        let mut pool = StabilityPool::new(&config());
        let mut active = funded_active("1", "10");
        pool.provide(addr(1), d("100"), None, 0).unwrap();
        let before = pool.clone();

        assert!(pool.offset(d("200"), d("1"), &mut active, 0).is_err());
        // Active pool lacks the collateral
        assert!(pool.offset(d("10"), d("5"), &mut active, 0).is_err());
        assert_eq!(pool, before);
    }
}
