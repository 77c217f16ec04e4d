//! CDP engine - core orchestration.
//!
//! The engine owns all accounting state and coordinates the reward snapshot
//! engine, the stability pool and the liquidation sequencer. Every public
//! operation is one atomic transition:
//!
//! 1. Checks: read-only validation against current state and collaborators
//! 2. Effects: internal accounting updates
//! 3. Interactions: ordering updates and token movements, after state is final

use serde::{Deserialize, Serialize};

use crate::core::config::EngineConfig;
use crate::core::interfaces::{
    PriceFeed, SortedPositions, TokenLedger, GAS_POOL_ACCOUNT, STABILITY_POOL_ACCOUNT,
};
use crate::core::pools::{move_between, Asset, AssetPool, CollSurplusPool, GasPool};
use crate::core::position::{PositionStatus, Reconciled};
use crate::error::{Error, Result};
use crate::liquidation::rewards::RewardSnapshotEngine;
use crate::liquidation::sequencer::{LiquidationMode, LiquidationSequencer, LiquidationTotals};
use crate::liquidation::stability_pool::{DepositChange, StabilityPool};
use crate::protocol::events::{EngineEvent, EventLog, PositionOperation};
use crate::protocol::operations::{
    Operation, OperationResult, PositionAdjustment, PositionSummary, RedemptionOutcome,
};
use crate::utils::crypto::{Address, Hash, PositionId};
use crate::utils::math::{compute_cr, compute_nominal_cr, Decimal18, U256};

// ═══════════════════════════════════════════════════════════════════════════════
// STATISTICS
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of the system-wide accumulators and balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatistics {
    /// Active positions
    pub active_positions: usize,
    /// Sum of active stakes
    pub total_stakes: Decimal18,
    /// Total stakes at the last liquidation
    pub total_stakes_snapshot: Decimal18,
    /// Total collateral at the last liquidation
    pub total_collateral_snapshot: Decimal18,
    /// Active plus default pool collateral
    pub entire_system_collateral: Decimal18,
    /// Active plus default pool debt
    pub entire_system_debt: Decimal18,
    /// Redistributed collateral per unit staked
    pub l_collateral: U256,
    /// Redistributed debt per unit staked
    pub l_debt: U256,
    /// Depositors with a recorded deposit
    pub depositors: usize,
    /// Stability pool deposits
    pub pool_deposits: Decimal18,
    /// Stability pool collateral gains held
    pub pool_collateral: Decimal18,
    /// Stability pool product
    pub p: U256,
    /// Stability pool scale
    pub scale: u64,
    /// Stability pool epoch
    pub epoch: u64,
    /// Secondary tokens issued
    pub secondary_issued: Decimal18,
    /// Collateral waiting in the gas pool
    pub gas_pool_collateral: Decimal18,
    /// Debt-token reserves held for gas compensation
    pub gas_pool_reserve: Decimal18,
    /// Unclaimed surplus collateral
    pub coll_surplus: Decimal18,
}

#[derive(Serialize)]
struct StateRef<'a> {
    config: &'a EngineConfig,
    rewards: &'a RewardSnapshotEngine,
    pool: &'a StabilityPool,
    gas_pool: &'a GasPool,
    surplus: &'a CollSurplusPool,
    events: &'a EventLog,
    now: u64,
}

#[derive(Deserialize)]
struct State {
    config: EngineConfig,
    rewards: RewardSnapshotEngine,
    pool: StabilityPool,
    gas_pool: GasPool,
    surplus: CollSurplusPool,
    events: EventLog,
    now: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Liquidation and redistribution accounting engine
pub struct CdpEngine<P: PriceFeed, S: SortedPositions, T: TokenLedger> {
    /// Policy parameters
    config: EngineConfig,
    /// Stakes, L terms, active and default pools
    rewards: RewardSnapshotEngine,
    /// Stability pool accounting
    pool: StabilityPool,
    /// Gas compensation holdings
    gas_pool: GasPool,
    /// Claimable surplus collateral
    surplus: CollSurplusPool,
    /// Bounded event log
    events: EventLog,
    /// Current time in seconds
    now: u64,
    price_feed: P,
    sorted: S,
    ledger: T,
}

impl<P: PriceFeed, S: SortedPositions, T: TokenLedger> CdpEngine<P, S, T> {
    /// Create an engine with fresh state
    pub fn new(config: EngineConfig, price_feed: P, sorted: S, ledger: T) -> Result<Self> {
        config.validate()?;
        let pool = StabilityPool::new(&config);
        let events = EventLog::new(config.max_events);
        let now = config.deployment_time;

        tracing::info!(mcr = %config.mcr, ccr = %config.ccr, "engine created");

        Ok(Self {
            config,
            rewards: RewardSnapshotEngine::new(),
            pool,
            gas_pool: GasPool::new(),
            surplus: CollSurplusPool::new(),
            events,
            now,
            price_feed,
            sorted,
            ledger,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // ACCESSORS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Policy parameters
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Reward snapshot engine
    pub fn rewards(&self) -> &RewardSnapshotEngine {
        &self.rewards
    }

    /// Stability pool
    pub fn stability_pool(&self) -> &StabilityPool {
        &self.pool
    }

    /// Gas pool
    pub fn gas_pool(&self) -> &GasPool {
        &self.gas_pool
    }

    /// Collateral surplus pool
    pub fn surplus_pool(&self) -> &CollSurplusPool {
        &self.surplus
    }

    /// Event log
    pub fn events(&self) -> &EventLog {
        &self.events
    }

    /// Price feed
    pub fn price_feed(&self) -> &P {
        &self.price_feed
    }

    /// Mutable price feed
    pub fn price_feed_mut(&mut self) -> &mut P {
        &mut self.price_feed
    }

    /// Sorted positions
    pub fn sorted_positions(&self) -> &S {
        &self.sorted
    }

    /// Token ledger
    pub fn ledger(&self) -> &T {
        &self.ledger
    }

    /// Mutable token ledger
    pub fn ledger_mut(&mut self) -> &mut T {
        &mut self.ledger
    }

    /// Current time in seconds
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Set the clock; it never moves backwards
    pub fn set_time(&mut self, now: u64) {
        self.now = self.now.max(now);
    }

    /// Advance the clock
    pub fn advance_time(&mut self, seconds: u64) {
        self.now = self.now.saturating_add(seconds);
    }

    /// Current collateral price
    pub fn price(&self) -> Result<Decimal18> {
        self.price_feed.get_price()
    }

    fn record(&mut self, event: EngineEvent) {
        self.events.push(self.now, event);
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // REWARDS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Fold pending redistribution rewards into a position
    pub fn apply_pending_rewards(&mut self, id: &PositionId) -> Result<Reconciled> {
        let had_pending = self.rewards.has_pending_rewards(id);
        let reconciled = self.rewards.apply_pending_rewards(id)?;
        if had_pending {
            self.record_position(id, &reconciled, PositionOperation::ApplyPendingRewards);
        }
        Ok(reconciled)
    }

    /// Recompute a position's stake from its collateral
    pub fn update_stake_and_total_stakes(&mut self, id: &PositionId) -> Result<Decimal18> {
        self.rewards.update_stake_and_total_stakes(id)
    }

    /// Redistributed collateral owed to a position
    pub fn pending_collateral_reward(&self, id: &PositionId) -> Result<Decimal18> {
        self.rewards.pending_collateral_reward(id)
    }

    /// Redistributed debt owed to a position
    pub fn pending_debt_reward(&self, id: &PositionId) -> Result<Decimal18> {
        self.rewards.pending_debt_reward(id)
    }

    /// Whether a position has unrealized rewards
    pub fn has_pending_rewards(&self, id: &PositionId) -> bool {
        self.rewards.has_pending_rewards(id)
    }

    /// Entire debt and collateral including pending rewards
    pub fn entire_debt_and_coll(&self, id: &PositionId) -> Result<Reconciled> {
        self.rewards.entire_debt_and_coll(id)
    }

    fn record_position(&mut self, id: &PositionId, view: &Reconciled, operation: PositionOperation) {
        let stake = self
            .rewards
            .position(id)
            .map(|p| p.stake())
            .unwrap_or_default();
        self.record(EngineEvent::PositionUpdated {
            position: *id,
            debt: view.debt(),
            collateral: view.collateral(),
            stake,
            operation,
        });
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Collateral in the active and default pools
    pub fn entire_system_collateral(&self) -> Result<Decimal18> {
        self.rewards
            .active_pool()
            .balance(Asset::Collateral)
            .checked_add(self.rewards.default_pool().balance(Asset::Collateral))
    }

    /// Debt in the active and default pools
    pub fn entire_system_debt(&self) -> Result<Decimal18> {
        self.rewards
            .active_pool()
            .balance(Asset::Debt)
            .checked_add(self.rewards.default_pool().balance(Asset::Debt))
    }

    /// Total collateral ratio at `price`
    pub fn tcr(&self, price: Decimal18) -> Result<Decimal18> {
        compute_cr(
            self.entire_system_collateral()?,
            self.entire_system_debt()?,
            price,
        )
    }

    /// Whether the system ratio is below CCR at `price`
    pub fn is_recovery_mode(&self, price: Decimal18) -> Result<bool> {
        Ok(self.tcr(price)? < self.config.ccr)
    }

    /// Liquidation mode implied by the system ratio at `price`
    pub fn current_mode(&self, price: Decimal18) -> Result<LiquidationMode> {
        let tcr = self.tcr(price)?;
        Ok(if tcr < self.config.ccr {
            LiquidationMode::Recovery { tcr }
        } else {
            LiquidationMode::Normal
        })
    }

    /// Individual collateral ratio including pending rewards
    pub fn icr(&self, id: &PositionId, price: Decimal18) -> Result<Decimal18> {
        let view = self.rewards.entire_debt_and_coll(id)?;
        compute_cr(view.collateral(), view.debt(), price)
    }

    /// Whether any active position is below MCR at `price`.
    ///
    /// Redistribution preserves the nominal ordering, so only the lowest
    /// position needs checking.
    pub fn has_undercollateralized_positions(&self, price: Decimal18) -> Result<bool> {
        match self.sorted.lowest() {
            Some(lowest) => Ok(self.icr(&lowest, price)? < self.config.mcr),
            None => Ok(false),
        }
    }

    /// Compounded stability pool deposit
    pub fn compounded_deposit(&self, depositor: &Address) -> Result<Decimal18> {
        self.pool.compounded_deposit(depositor)
    }

    /// Compounded front-end stake
    pub fn compounded_front_end_stake(&self, front_end: &Address) -> Result<Decimal18> {
        self.pool.compounded_front_end_stake(front_end)
    }

    /// Collateral gain of a depositor
    pub fn depositor_collateral_gain(&self, depositor: &Address) -> Result<Decimal18> {
        self.pool.depositor_collateral_gain(depositor)
    }

    /// Secondary gain of a depositor
    pub fn depositor_secondary_gain(&self, depositor: &Address) -> Result<Decimal18> {
        self.pool.depositor_secondary_gain(depositor)
    }

    /// Secondary gain of a front end
    pub fn front_end_secondary_gain(&self, front_end: &Address) -> Result<Decimal18> {
        self.pool.front_end_secondary_gain(front_end)
    }

    /// Accumulators and balances in one struct
    pub fn statistics(&self) -> Result<EngineStatistics> {
        let (scale, epoch) = (self.pool.current_scale(), self.pool.current_epoch());
        Ok(EngineStatistics {
            active_positions: self.rewards.active_count(),
            total_stakes: self.rewards.total_stakes(),
            total_stakes_snapshot: self.rewards.total_stakes_snapshot(),
            total_collateral_snapshot: self.rewards.total_collateral_snapshot(),
            entire_system_collateral: self.entire_system_collateral()?,
            entire_system_debt: self.entire_system_debt()?,
            l_collateral: self.rewards.l_collateral(),
            l_debt: self.rewards.l_debt(),
            depositors: self.pool.depositor_count(),
            pool_deposits: self.pool.total_deposits(),
            pool_collateral: self.pool.collateral_balance(),
            p: self.pool.p(),
            scale,
            epoch,
            secondary_issued: self.pool.issuance().total_issued(),
            gas_pool_collateral: self.gas_pool.balance(Asset::Collateral),
            gas_pool_reserve: self.gas_pool.balance(Asset::Debt),
            coll_surplus: self.surplus.balance(Asset::Collateral),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITION LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════════

    fn require_min_net_debt(&self, net_debt: Decimal18) -> Result<()> {
        if net_debt < self.config.min_net_debt {
            return Err(Error::DebtBelowMinimum {
                amount: net_debt,
                minimum: self.config.min_net_debt,
            });
        }
        Ok(())
    }

    fn require_icr(&self, collateral: Decimal18, debt: Decimal18, price: Decimal18) -> Result<Decimal18> {
        let icr = compute_cr(collateral, debt, price)?;
        let minimum = if self.is_recovery_mode(price)? {
            self.config.ccr
        } else {
            self.config.mcr
        };
        if icr < minimum {
            return Err(Error::CollateralizationRatioTooLow {
                current: icr,
                minimum,
            });
        }
        Ok(icr)
    }

    fn require_stable(&self, account: &Address, amount: Decimal18) -> Result<()> {
        Self::require_ledger_balance(&self.ledger, account, amount)
    }

    /// Ledger balance check usable while other engine fields are borrowed
    fn require_ledger_balance(ledger: &T, account: &Address, amount: Decimal18) -> Result<()> {
        let available = ledger.stable_balance(account);
        if available < amount {
            return Err(Error::InsufficientBalance {
                account: account.to_hex(),
                requested: amount,
                available,
            });
        }
        Ok(())
    }

    fn require_reserve(&self) -> Result<()> {
        let reserve = self.gas_pool.balance(Asset::Debt);
        if reserve < self.config.debt_gas_compensation {
            return Err(Error::InvariantViolation(format!(
                "gas pool reserve {} below compensation {}",
                reserve, self.config.debt_gas_compensation
            )));
        }
        self.require_stable(&GAS_POOL_ACCOUNT, self.config.debt_gas_compensation)
    }

    fn summary(&self, id: &PositionId, price: Decimal18) -> Result<PositionSummary> {
        let view = self.rewards.entire_debt_and_coll(id)?;
        let stake = self
            .rewards
            .position(id)
            .map(|p| p.stake())
            .unwrap_or_default();
        Ok(PositionSummary {
            position: *id,
            debt: view.debt(),
            collateral: view.collateral(),
            stake,
            icr: compute_cr(view.collateral(), view.debt(), price)?,
        })
    }

    /// Open a position; its debt is `net_debt` plus the gas reserve
    pub fn open_position(
        &mut self,
        owner: Address,
        collateral: Decimal18,
        net_debt: Decimal18,
    ) -> Result<PositionSummary> {
        let price = self.price()?;
        if collateral.is_zero() {
            return Err(Error::invalid_amount("collateral", collateral));
        }
        if self.rewards.status(&owner).is_active() || self.sorted.contains(&owner) {
            return Err(Error::PositionAlreadyActive(owner));
        }
        self.require_min_net_debt(net_debt)?;
        let reserve = self.config.debt_gas_compensation;
        let debt = net_debt.checked_add(reserve)?;
        self.require_icr(collateral, debt, price)?;
        let nicr = compute_nominal_cr(collateral, debt)?;

        // Effects
        self.rewards.open_position(owner, collateral, debt)?;
        self.gas_pool.credit(Asset::Debt, reserve)?;
        let summary = self.summary(&owner, price)?;
        self.record(EngineEvent::PositionUpdated {
            position: owner,
            debt,
            collateral,
            stake: summary.stake,
            operation: PositionOperation::Open,
        });
        tracing::info!(owner = %owner, collateral = %collateral, debt = %debt, "position opened");

        // Interactions
        self.sorted.insert(owner, nicr)?;
        self.ledger.mint_stable(&owner, net_debt)?;
        self.ledger.mint_stable(&GAS_POOL_ACCOUNT, reserve)?;
        Ok(summary)
    }

    /// Adjust collateral and debt of a position
    pub fn adjust_position(
        &mut self,
        owner: Address,
        adjustment: PositionAdjustment,
    ) -> Result<PositionSummary> {
        let price = self.price()?;
        if adjustment.is_empty() {
            return Err(Error::InvalidParameter {
                name: "adjustment".into(),
                reason: "no change requested".into(),
            });
        }
        if !adjustment.collateral_deposit.is_zero() && !adjustment.collateral_withdrawal.is_zero() {
            return Err(Error::InvalidParameter {
                name: "adjustment".into(),
                reason: "cannot add and withdraw collateral at once".into(),
            });
        }
        if !adjustment.debt_increase.is_zero() && !adjustment.debt_repayment.is_zero() {
            return Err(Error::InvalidParameter {
                name: "adjustment".into(),
                reason: "cannot borrow and repay at once".into(),
            });
        }
        if !self.sorted.contains(&owner) {
            return Err(Error::NoStakeOrPosition(owner));
        }

        let view = self.rewards.entire_debt_and_coll(&owner)?;
        let collateral = view
            .collateral()
            .checked_add(adjustment.collateral_deposit)?
            .checked_sub(adjustment.collateral_withdrawal)
            .map_err(|_| Error::invalid_amount("collateral withdrawal", adjustment.collateral_withdrawal))?;
        let debt = view
            .debt()
            .checked_add(adjustment.debt_increase)?
            .checked_sub(adjustment.debt_repayment)
            .map_err(|_| Error::invalid_amount("debt repayment", adjustment.debt_repayment))?;
        let reserve = self.config.debt_gas_compensation;
        let net_debt = debt
            .checked_sub(reserve)
            .map_err(|_| Error::DebtBelowGasCompensation)?;
        if collateral.is_zero() {
            return Err(Error::invalid_amount("collateral", collateral));
        }
        self.require_min_net_debt(net_debt)?;
        if adjustment.is_risk_increasing() {
            self.require_icr(collateral, debt, price)?;
        }
        self.require_stable(&owner, adjustment.debt_repayment)?;
        let nicr = compute_nominal_cr(collateral, debt)?;

        // Effects
        let reconciled = self.apply_pending_rewards(&owner)?;
        self.rewards
            .set_position_balances(&reconciled, collateral, debt)?;
        self.rewards.update_stake_and_total_stakes(&owner)?;
        let summary = self.summary(&owner, price)?;
        self.record(EngineEvent::PositionUpdated {
            position: owner,
            debt,
            collateral,
            stake: summary.stake,
            operation: PositionOperation::Adjust,
        });
        tracing::info!(owner = %owner, collateral = %collateral, debt = %debt, "position adjusted");

        // Interactions
        self.sorted.re_insert(owner, nicr)?;
        if !adjustment.debt_increase.is_zero() {
            self.ledger.mint_stable(&owner, adjustment.debt_increase)?;
        }
        if !adjustment.debt_repayment.is_zero() {
            self.ledger.burn_stable(&owner, adjustment.debt_repayment)?;
        }
        if !adjustment.collateral_withdrawal.is_zero() {
            self.ledger
                .send_collateral(&owner, adjustment.collateral_withdrawal)?;
        }
        Ok(summary)
    }

    /// Close a position, repaying its debt and returning its collateral
    pub fn close_position(&mut self, owner: Address) -> Result<Decimal18> {
        if !self.sorted.contains(&owner) {
            return Err(Error::NoStakeOrPosition(owner));
        }
        if self.rewards.active_count() <= 1 {
            return Err(Error::OnlyOnePositionInSystem);
        }
        let view = self.rewards.entire_debt_and_coll(&owner)?;
        let reserve = self.config.debt_gas_compensation;
        let net_debt = view
            .debt()
            .checked_sub(reserve)
            .map_err(|_| Error::DebtBelowGasCompensation)?;
        self.require_stable(&owner, net_debt)?;
        self.require_reserve()?;

        // Effects
        let reconciled = self.apply_pending_rewards(&owner)?;
        self.rewards
            .close_position(&reconciled, PositionStatus::ClosedByOwner)?;
        let active = self.rewards.active_pool_mut();
        active.debit(Asset::Debt, reconciled.debt())?;
        active.debit(Asset::Collateral, reconciled.collateral())?;
        self.gas_pool.debit(Asset::Debt, reserve)?;
        self.record(EngineEvent::PositionUpdated {
            position: owner,
            debt: Decimal18::ZERO,
            collateral: Decimal18::ZERO,
            stake: Decimal18::ZERO,
            operation: PositionOperation::Close,
        });
        tracing::info!(owner = %owner, collateral = %reconciled.collateral(), "position closed");

        // Interactions
        self.sorted.remove(&owner)?;
        self.ledger.burn_stable(&owner, net_debt)?;
        self.ledger.burn_stable(&GAS_POOL_ACCOUNT, reserve)?;
        self.ledger.send_collateral(&owner, reconciled.collateral())?;
        Ok(reconciled.collateral())
    }

    /// Redeem stablecoin for collateral at face value against one position.
    ///
    /// A redemption that leaves only the gas reserve closes the position and
    /// moves the remaining collateral to the owner's surplus.
    pub fn redeem_from_position(
        &mut self,
        redeemer: Address,
        position: PositionId,
        amount: Decimal18,
    ) -> Result<RedemptionOutcome> {
        let price = self.price()?;
        if amount.is_zero() {
            return Err(Error::invalid_amount("redemption", amount));
        }
        if !self.sorted.contains(&position) {
            return Err(Error::NoStakeOrPosition(position));
        }
        let view = self.rewards.entire_debt_and_coll(&position)?;
        let icr = compute_cr(view.collateral(), view.debt(), price)?;
        if icr < Decimal18::ONE {
            return Err(Error::CollateralizationRatioTooLow {
                current: icr,
                minimum: Decimal18::ONE,
            });
        }

        let reserve = self.config.debt_gas_compensation;
        let net_debt = view
            .debt()
            .checked_sub(reserve)
            .map_err(|_| Error::DebtBelowGasCompensation)?;
        let debt_redeemed = amount.min(net_debt);
        let collateral_sent = debt_redeemed.div(price)?.min(view.collateral());
        let debt = view.debt().checked_sub(debt_redeemed)?;
        let collateral = view.collateral().checked_sub(collateral_sent)?;
        let closes = debt == reserve;

        if closes {
            if self.rewards.active_count() <= 1 {
                return Err(Error::OnlyOnePositionInSystem);
            }
            self.require_reserve()?;
        } else {
            self.require_min_net_debt(debt.checked_sub(reserve)?)?;
        }
        self.require_stable(&redeemer, debt_redeemed)?;

        // Effects
        let reconciled = self.apply_pending_rewards(&position)?;
        let coll_surplus = if closes {
            self.rewards
                .close_position(&reconciled, PositionStatus::ClosedByRedemption)?;
            let active = self.rewards.active_pool_mut();
            active.debit(Asset::Debt, reconciled.debt())?;
            active.debit(Asset::Collateral, collateral_sent)?;
            move_between(active, &mut self.surplus, Asset::Collateral, collateral)?;
            self.surplus.account_surplus(position, collateral)?;
            self.gas_pool.debit(Asset::Debt, reserve)?;
            collateral
        } else {
            self.rewards
                .set_position_balances(&reconciled, collateral, debt)?;
            self.rewards.update_stake_and_total_stakes(&position)?;
            Decimal18::ZERO
        };
        let outcome = RedemptionOutcome {
            position,
            debt_redeemed,
            collateral_sent,
            closed: closes,
            coll_surplus,
        };
        self.record(EngineEvent::Redemption {
            position,
            redeemer,
            debt: debt_redeemed,
            collateral: collateral_sent,
        });
        tracing::info!(
            position = %position,
            debt = %debt_redeemed,
            collateral = %collateral_sent,
            closed = closes,
            "redemption"
        );

        // Interactions
        if closes {
            self.sorted.remove(&position)?;
            self.ledger.burn_stable(&GAS_POOL_ACCOUNT, reserve)?;
        } else {
            self.sorted
                .re_insert(position, compute_nominal_cr(collateral, debt)?)?;
        }
        self.ledger.burn_stable(&redeemer, debt_redeemed)?;
        self.ledger.send_collateral(&redeemer, collateral_sent)?;
        Ok(outcome)
    }

    /// Claim collateral left over from a capped liquidation or a closing redemption
    pub fn claim_coll_surplus(&mut self, owner: Address) -> Result<Decimal18> {
        let amount = self.surplus.take_surplus(&owner)?;
        self.record(EngineEvent::CollSurplusClaimed { owner, amount });
        self.ledger.send_collateral(&owner, amount)?;
        Ok(amount)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // LIQUIDATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// Liquidate a single position
    pub fn liquidate(
        &mut self,
        id: PositionId,
        mode: LiquidationMode,
        liquidator: Address,
    ) -> Result<LiquidationTotals> {
        if !self.rewards.status(&id).is_active() {
            return Err(Error::NoStakeOrPosition(id));
        }
        self.liquidate_positions(&[id], mode, liquidator, true)
    }

    /// Liquidate every eligible position in `ids`; ineligible ones are skipped
    pub fn liquidate_batch(
        &mut self,
        ids: &[PositionId],
        mode: LiquidationMode,
        liquidator: Address,
    ) -> Result<LiquidationTotals> {
        self.liquidate_positions(ids, mode, liquidator, false)
    }

    fn liquidate_positions(
        &mut self,
        ids: &[PositionId],
        mode: LiquidationMode,
        liquidator: Address,
        single: bool,
    ) -> Result<LiquidationTotals> {
        let price = self.price()?;
        let now = self.now;

        let mut sequencer = LiquidationSequencer::new(
            &self.config,
            &mut self.rewards,
            &mut self.pool,
            &mut self.gas_pool,
            &mut self.surplus,
        );
        let plan = sequencer.plan(ids, price, mode, now)?;
        if plan.totals().is_empty() {
            return Err(plan.nothing_liquidated(single));
        }
        if let Some(missing) = plan
            .totals()
            .liquidated
            .iter()
            .find(|id| !self.sorted.contains(id))
        {
            return Err(Error::InvariantViolation(format!(
                "position {} missing from sorted positions",
                missing
            )));
        }
        let totals = plan.totals().clone();
        let coll_gas = totals.total_coll_gas_compensation;
        let debt_gas = totals.total_debt_gas_compensation;
        Self::require_ledger_balance(&self.ledger, &STABILITY_POOL_ACCOUNT, totals.total_debt_offset)?;
        Self::require_ledger_balance(&self.ledger, &GAS_POOL_ACCOUNT, debt_gas)?;

        // Effects
        sequencer.apply(&plan)?;
        self.gas_pool.debit(Asset::Collateral, coll_gas)?;
        self.gas_pool.debit(Asset::Debt, debt_gas)?;

        for values in plan.values() {
            self.events.push(
                now,
                EngineEvent::PositionLiquidated {
                    position: values.position,
                    kind: values.kind,
                    debt: values.entire_debt,
                    collateral: values.entire_collateral,
                },
            );
        }
        if plan.redistribution().is_some() {
            self.record(EngineEvent::LTermsUpdated {
                l_collateral: self.rewards.l_collateral(),
                l_debt: self.rewards.l_debt(),
            });
        }
        if let Some(offset) = plan.offset() {
            self.record(EngineEvent::SumUpdated {
                epoch: offset.s_key.0,
                scale: offset.s_key.1,
                s: offset.s,
            });
            self.record(EngineEvent::ProductUpdated {
                p: offset.p,
                scale: offset.scale,
                epoch: offset.epoch,
            });
            if let Some(((epoch, scale), g)) = offset.secondary.g {
                self.record(EngineEvent::SecondarySumUpdated { epoch, scale, g });
            }
        }
        self.record(EngineEvent::SystemSnapshotsUpdated {
            total_stakes_snapshot: self.rewards.total_stakes_snapshot(),
            total_collateral_snapshot: self.rewards.total_collateral_snapshot(),
        });
        self.record(EngineEvent::Liquidation {
            liquidator,
            liquidated: totals.liquidated.len(),
            debt_offset: totals.total_debt_offset,
            debt_redistributed: totals.total_debt_redistributed,
            coll_gas_compensation: coll_gas,
            debt_gas_compensation: debt_gas,
        });

        // Interactions
        for id in &totals.liquidated {
            self.sorted.remove(id)?;
        }
        if !totals.total_debt_offset.is_zero() {
            self.ledger
                .burn_stable(&STABILITY_POOL_ACCOUNT, totals.total_debt_offset)?;
        }
        if !coll_gas.is_zero() {
            self.ledger.send_collateral(&liquidator, coll_gas)?;
        }
        if !debt_gas.is_zero() {
            self.ledger
                .transfer_stable(&GAS_POOL_ACCOUNT, &liquidator, debt_gas)?;
        }
        Ok(totals)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STABILITY POOL
    // ═══════════════════════════════════════════════════════════════════════════

    /// Register a front end with its kickback rate
    pub fn register_front_end(&mut self, front_end: Address, kickback_rate: Decimal18) -> Result<()> {
        self.pool.register_front_end(front_end, kickback_rate)?;
        self.record(EngineEvent::FrontEndRegistered {
            front_end,
            kickback_rate,
        });
        Ok(())
    }

    fn record_deposit_change(&mut self, change: &DepositChange) {
        self.record(EngineEvent::DepositUpdated {
            depositor: change.depositor,
            front_end: change.front_end,
            deposit: change.deposit_after,
        });
        if !change.collateral_gain.is_zero() {
            self.record(EngineEvent::CollateralGainWithdrawn {
                depositor: change.depositor,
                amount: change.collateral_gain,
            });
        }
        if !change.depositor_secondary_gain.is_zero() {
            self.record(EngineEvent::SecondaryGainPaid {
                recipient: change.depositor,
                amount: change.depositor_secondary_gain,
            });
        }
        if let Some(front_end) = change.front_end {
            if !change.front_end_secondary_gain.is_zero() {
                self.record(EngineEvent::SecondaryGainPaid {
                    recipient: front_end,
                    amount: change.front_end_secondary_gain,
                });
            }
        }
    }

    fn pay_secondary_gains(&mut self, change: &DepositChange) -> Result<()> {
        if !change.depositor_secondary_gain.is_zero() {
            self.ledger
                .send_secondary(&change.depositor, change.depositor_secondary_gain)?;
        }
        if let Some(front_end) = change.front_end {
            if !change.front_end_secondary_gain.is_zero() {
                self.ledger
                    .send_secondary(&front_end, change.front_end_secondary_gain)?;
            }
        }
        Ok(())
    }

    /// Deposit stablecoin into the stability pool, paying out accumulated gains
    pub fn provide_to_pool(
        &mut self,
        depositor: Address,
        amount: Decimal18,
        front_end: Option<Address>,
    ) -> Result<DepositChange> {
        self.require_stable(&depositor, amount)?;

        let change = self.pool.provide(depositor, amount, front_end, self.now)?;
        self.record_deposit_change(&change);

        self.ledger
            .transfer_stable(&depositor, &STABILITY_POOL_ACCOUNT, amount)?;
        if !change.collateral_gain.is_zero() {
            self.ledger
                .send_collateral(&depositor, change.collateral_gain)?;
        }
        self.pay_secondary_gains(&change)?;
        Ok(change)
    }

    /// Withdraw from the stability pool, paying out accumulated gains
    pub fn withdraw_from_pool(&mut self, depositor: Address, amount: Decimal18) -> Result<DepositChange> {
        let undercollateralized = if amount.is_zero() {
            false
        } else {
            let price = self.price()?;
            self.has_undercollateralized_positions(price)?
        };
        if !undercollateralized && !amount.is_zero() {
            let withdrawable = amount.min(self.pool.compounded_deposit(&depositor)?);
            self.require_stable(&STABILITY_POOL_ACCOUNT, withdrawable)?;
        }

        let change = self
            .pool
            .withdraw(depositor, amount, self.now, undercollateralized)?;
        self.record_deposit_change(&change);

        if !change.withdrawn.is_zero() {
            self.ledger
                .transfer_stable(&STABILITY_POOL_ACCOUNT, &depositor, change.withdrawn)?;
        }
        if !change.collateral_gain.is_zero() {
            self.ledger
                .send_collateral(&depositor, change.collateral_gain)?;
        }
        self.pay_secondary_gains(&change)?;
        Ok(change)
    }

    /// Move a depositor's collateral gain into their own active position
    pub fn withdraw_collateral_gain_to_position(&mut self, depositor: Address) -> Result<DepositChange> {
        if !self.sorted.contains(&depositor) {
            return Err(Error::NoStakeOrPosition(depositor));
        }
        let view = self.rewards.entire_debt_and_coll(&depositor)?;
        let gain = self.pool.depositor_collateral_gain(&depositor)?;
        view.collateral().checked_add(gain)?;

        let change = self.pool.withdraw_collateral_gain(depositor, self.now)?;
        self.record_deposit_change(&change);

        let reconciled = self.apply_pending_rewards(&depositor)?;
        let collateral = reconciled.collateral().checked_add(change.collateral_gain)?;
        let debt = reconciled.debt();
        self.rewards
            .set_position_balances(&reconciled, collateral, debt)?;
        self.rewards.update_stake_and_total_stakes(&depositor)?;
        let stake = self
            .rewards
            .position(&depositor)
            .map(|p| p.stake())
            .unwrap_or_default();
        self.record(EngineEvent::PositionUpdated {
            position: depositor,
            debt,
            collateral,
            stake,
            operation: PositionOperation::CollateralGainToPosition,
        });

        self.sorted
            .re_insert(depositor, compute_nominal_cr(collateral, debt)?)?;
        self.pay_secondary_gains(&change)?;
        Ok(change)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // OPERATION DISPATCH
    // ═══════════════════════════════════════════════════════════════════════════

    fn mode_or_current(&self, mode: Option<LiquidationMode>) -> Result<LiquidationMode> {
        match mode {
            Some(mode) => Ok(mode),
            None => self.current_mode(self.price()?),
        }
    }

    /// Execute an engine operation.
    ///
    /// `SetPrice` is handled by the caller since the feed type is generic.
    pub fn execute(&mut self, op: Operation) -> Result<OperationResult> {
        tracing::debug!(op = op.operation_type(), now = self.now, "executing operation");
        match op {
            Operation::SetPrice { .. } => Err(Error::InvalidParameter {
                name: "operation".into(),
                reason: "price updates go through the price feed".into(),
            }),
            Operation::AdvanceTime { seconds } => {
                self.advance_time(seconds);
                Ok(OperationResult::Done)
            }
            Operation::TransferStable { from, to, amount } => {
                if from == STABILITY_POOL_ACCOUNT || from == GAS_POOL_ACCOUNT {
                    return Err(Error::InvalidParameter {
                        name: "from".into(),
                        reason: format!("{} is an engine-held account", from),
                    });
                }
                self.ledger.transfer_stable(&from, &to, amount)?;
                Ok(OperationResult::Done)
            }
            Operation::OpenPosition {
                owner,
                collateral,
                net_debt,
            } => self
                .open_position(owner, collateral, net_debt)
                .map(OperationResult::Position),
            Operation::AdjustPosition { owner, adjustment } => self
                .adjust_position(owner, adjustment)
                .map(OperationResult::Position),
            Operation::ClosePosition { owner } => {
                let collateral = self.close_position(owner)?;
                Ok(OperationResult::Closed {
                    position: owner,
                    collateral,
                })
            }
            Operation::Redeem {
                redeemer,
                position,
                amount,
            } => self
                .redeem_from_position(redeemer, position, amount)
                .map(OperationResult::Redemption),
            Operation::ClaimCollSurplus { owner } => self
                .claim_coll_surplus(owner)
                .map(OperationResult::SurplusClaimed),
            Operation::Liquidate {
                position,
                liquidator,
                mode,
            } => {
                let mode = self.mode_or_current(mode)?;
                self.liquidate(position, mode, liquidator)
                    .map(OperationResult::Liquidation)
            }
            Operation::LiquidateBatch {
                positions,
                liquidator,
                mode,
            } => {
                let mode = self.mode_or_current(mode)?;
                self.liquidate_batch(&positions, mode, liquidator)
                    .map(OperationResult::Liquidation)
            }
            Operation::RegisterFrontEnd {
                front_end,
                kickback_rate,
            } => {
                self.register_front_end(front_end, kickback_rate)?;
                Ok(OperationResult::Done)
            }
            Operation::ProvideToPool {
                depositor,
                amount,
                front_end,
            } => self
                .provide_to_pool(depositor, amount, front_end)
                .map(OperationResult::Deposit),
            Operation::WithdrawFromPool { depositor, amount } => self
                .withdraw_from_pool(depositor, amount)
                .map(OperationResult::Deposit),
            Operation::WithdrawCollateralGainToPosition { depositor } => self
                .withdraw_collateral_gain_to_position(depositor)
                .map(OperationResult::Deposit),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SERIALIZATION
    // ═══════════════════════════════════════════════════════════════════════════

    /// SHA-256 over the canonical accumulators and balances
    pub fn state_hash(&self) -> Result<Hash> {
        let stats = self.statistics()?;
        let data =
            bincode::serialize(&stats).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Hash::sha256(&data))
    }

    /// Serialize the accounting state (collaborators excluded)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let state = StateRef {
            config: &self.config,
            rewards: &self.rewards,
            pool: &self.pool,
            gas_pool: &self.gas_pool,
            surplus: &self.surplus,
            events: &self.events,
            now: self.now,
        };
        bincode::serialize(&state).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Restore accounting state produced by [`Self::to_bytes`]
    pub fn from_bytes(bytes: &[u8], price_feed: P, sorted: S, ledger: T) -> Result<Self> {
        let state: State =
            bincode::deserialize(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
        state.config.validate()?;
        Ok(Self {
            config: state.config,
            rewards: state.rewards,
            pool: state.pool,
            gas_pool: state.gas_pool,
            surplus: state.surplus,
            events: state.events,
            now: state.now,
            price_feed,
            sorted,
            ledger,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
