//! Collateral and debt accounting pools.
//!
//! Every pool exposes the same capability, [`AssetPool`], and balances only
//! flow between pools through [`move_between`]:
//! - `ActivePool`: collateral and debt backing open positions
//! - `DefaultPool`: redistributed amounts not yet pulled by positions
//! - `StabilityPoolHoldings`: deposited stablecoin and collateral gains
//! - `GasPool`: liquidation compensation held for callers
//! - `CollSurplusPool`: per-owner collateral left over after capped liquidations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::utils::crypto::Address;
use crate::utils::math::Decimal18;

// ═══════════════════════════════════════════════════════════════════════════════
// ASSET POOL CAPABILITY
// ═══════════════════════════════════════════════════════════════════════════════

/// Asset tracked by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Asset {
    /// Collateral
    Collateral,
    /// Debt (or stablecoin, for pools that hold the token itself)
    Debt,
}

/// Shared shape of all accounting pools
pub trait AssetPool {
    /// Pool name used in errors and logs
    fn name(&self) -> &'static str;

    /// Current balance of an asset
    fn balance(&self, asset: Asset) -> Decimal18;

    /// Increase an asset balance
    fn credit(&mut self, asset: Asset, amount: Decimal18) -> Result<()>;

    /// Decrease an asset balance; going below zero is an error
    fn debit(&mut self, asset: Asset, amount: Decimal18) -> Result<()>;
}

/// Move `amount` of `asset` from one pool to another.
///
/// Either both sides change or neither does.
pub fn move_between(
    from: &mut dyn AssetPool,
    to: &mut dyn AssetPool,
    asset: Asset,
    amount: Decimal18,
) -> Result<()> {
    if amount.is_zero() {
        return Ok(());
    }
    // Destination overflow is checked before the source is touched
    to.balance(asset).checked_add(amount)?;
    from.debit(asset, amount)?;
    to.credit(asset, amount)
}

// ═══════════════════════════════════════════════════════════════════════════════
// POOL BALANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral and debt pair held by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PoolBalance {
    /// Collateral balance
    pub collateral: Decimal18,
    /// Debt balance
    pub debt: Decimal18,
}

impl PoolBalance {
    fn slot(&mut self, asset: Asset) -> &mut Decimal18 {
        match asset {
            Asset::Collateral => &mut self.collateral,
            Asset::Debt => &mut self.debt,
        }
    }

    fn get(&self, asset: Asset) -> Decimal18 {
        match asset {
            Asset::Collateral => self.collateral,
            Asset::Debt => self.debt,
        }
    }

    fn credit(&mut self, pool: &str, asset: Asset, amount: Decimal18) -> Result<()> {
        let slot = self.slot(asset);
        *slot = slot.checked_add(amount).map_err(|_| Error::Overflow {
            operation: format!("{} credit {:?}", pool, asset),
        })?;
        Ok(())
    }

    fn debit(&mut self, pool: &str, asset: Asset, amount: Decimal18) -> Result<()> {
        let slot = self.slot(asset);
        *slot = slot.checked_sub(amount).map_err(|_| Error::Underflow {
            operation: format!("{} debit {:?}", pool, asset),
        })?;
        Ok(())
    }
}

macro_rules! balance_pool {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
        pub struct $name {
            balance: PoolBalance,
        }

        impl $name {
            /// Create an empty pool
            pub fn new() -> Self {
                Self::default()
            }

            /// Both balances
            pub fn balances(&self) -> PoolBalance {
                self.balance
            }
        }

        impl AssetPool for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn balance(&self, asset: Asset) -> Decimal18 {
                self.balance.get(asset)
            }

            fn credit(&mut self, asset: Asset, amount: Decimal18) -> Result<()> {
                self.balance.credit($label, asset, amount)
            }

            fn debit(&mut self, asset: Asset, amount: Decimal18) -> Result<()> {
                self.balance.debit($label, asset, amount)
            }
        }
    };
}

balance_pool!(
    /// Collateral and debt of all active positions (stored values)
    ActivePool,
    "active_pool"
);

balance_pool!(
    /// Redistributed collateral and debt awaiting reconciliation by positions
    DefaultPool,
    "default_pool"
);

balance_pool!(
    /// Stability pool holdings: `Debt` is deposited stablecoin, `Collateral` is unclaimed gains
    StabilityPoolHoldings,
    "stability_pool"
);

balance_pool!(
    /// Liquidation compensation: collateral for callers and the debt-token reserve
    GasPool,
    "gas_pool"
);

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERAL SURPLUS POOL
// ═══════════════════════════════════════════════════════════════════════════════

/// Collateral owed back to owners after capped liquidations or redemptions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CollSurplusPool {
    collateral: Decimal18,
    claimable: BTreeMap<Address, Decimal18>,
}

impl CollSurplusPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Claimable surplus for an owner
    pub fn claimable(&self, owner: &Address) -> Decimal18 {
        self.claimable.get(owner).copied().unwrap_or_default()
    }

    /// Record a surplus for `owner` (collateral must be credited separately)
    pub fn account_surplus(&mut self, owner: Address, amount: Decimal18) -> Result<()> {
        let current = self.claimable(&owner);
        self.claimable.insert(owner, current.checked_add(amount)?);
        Ok(())
    }

    /// Remove and return the owner's surplus, debiting the collateral balance
    pub fn take_surplus(&mut self, owner: &Address) -> Result<Decimal18> {
        let amount = self.claimable(owner);
        if amount.is_zero() {
            return Err(Error::NoCollateralSurplus(*owner));
        }
        self.debit(Asset::Collateral, amount)?;
        self.claimable.remove(owner);
        Ok(amount)
    }
}

impl AssetPool for CollSurplusPool {
    fn name(&self) -> &'static str {
        "coll_surplus_pool"
    }

    fn balance(&self, asset: Asset) -> Decimal18 {
        match asset {
            Asset::Collateral => self.collateral,
            Asset::Debt => Decimal18::ZERO,
        }
    }

    fn credit(&mut self, asset: Asset, amount: Decimal18) -> Result<()> {
        match asset {
            Asset::Collateral => {
                self.collateral = self.collateral.checked_add(amount)?;
                Ok(())
            }
            Asset::Debt => Err(Error::InvalidParameter {
                name: "asset".into(),
                reason: "coll_surplus_pool holds collateral only".into(),
            }),
        }
    }

    fn debit(&mut self, asset: Asset, amount: Decimal18) -> Result<()> {
        match asset {
            Asset::Collateral => {
                self.collateral = self.collateral.checked_sub(amount).map_err(|_| {
                    Error::Underflow {
                        operation: "coll_surplus_pool debit Collateral".into(),
                    }
                })?;
                Ok(())
            }
            Asset::Debt => Err(Error::InvalidParameter {
                name: "asset".into(),
                reason: "coll_surplus_pool holds collateral only".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn amount(units: u64) -> Decimal18 {
        Decimal18::from_integer(units)
    }

    #[test]
    fn test_credit_and_debit() {
        let mut pool = ActivePool::new();
        pool.credit(Asset::Collateral, amount(10)).unwrap();
        pool.credit(Asset::Debt, amount(500)).unwrap();
        pool.debit(Asset::Collateral, amount(4)).unwrap();

        assert_eq!(pool.balance(Asset::Collateral), amount(6));
        assert_eq!(pool.balance(Asset::Debt), amount(500));
    }

    #[test]
    fn test_debit_below_zero_fails() {
        let mut pool = DefaultPool::new();
        pool.credit(Asset::Debt, amount(1)).unwrap();
        let err = pool.debit(Asset::Debt, amount(2)).unwrap_err();
        assert!(matches!(err, Error::Underflow { .. }));
        assert_eq!(pool.balance(Asset::Debt), amount(1));
    }

    #[test]
    fn test_move_between() {
        let mut active = ActivePool::new();
        let mut default = DefaultPool::new();
        active.credit(Asset::Collateral, amount(3)).unwrap();

        move_between(&mut active, &mut default, Asset::Collateral, amount(2)).unwrap();
        assert_eq!(active.balance(Asset::Collateral), amount(1));
        assert_eq!(default.balance(Asset::Collateral), amount(2));

        // Failed move leaves both sides untouched
        assert!(move_between(&mut active, &mut default, Asset::Collateral, amount(5)).is_err());
        assert_eq!(active.balance(Asset::Collateral), amount(1));
        assert_eq!(default.balance(Asset::Collateral), amount(2));
    }

    #[test]
    fn test_surplus_pool() {
        let owner = Address::from_index(1);
        let mut active = ActivePool::new();
        let mut surplus = CollSurplusPool::new();
        active.credit(Asset::Collateral, amount(5)).unwrap();

        move_between(&mut active, &mut surplus, Asset::Collateral, amount(2)).unwrap();
        surplus.account_surplus(owner, amount(2)).unwrap();

        assert_eq!(surplus.claimable(&owner), amount(2));
        assert_eq!(surplus.take_surplus(&owner).unwrap(), amount(2));
        assert!(surplus.balance(Asset::Collateral).is_zero());
        assert!(matches!(
            surplus.take_surplus(&owner),
            Err(Error::NoCollateralSurplus(_))
        ));
        assert!(surplus.credit(Asset::Debt, amount(1)).is_err());
    }
}
