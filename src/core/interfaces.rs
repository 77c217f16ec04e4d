//! External collaborators consumed by the engine.
//!
//! The engine never owns price discovery, position ordering or token balances.
//! It talks to them through these traits; in-memory implementations back the
//! tests and the simulator.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::utils::crypto::{Address, PositionId};
use crate::utils::math::{Decimal18, U256};

/// Ledger account holding stablecoin deposited in the stability pool
pub const STABILITY_POOL_ACCOUNT: Address = Address::new([0x51; 20]);

/// Ledger account holding the debt-token gas reserve
pub const GAS_POOL_ACCOUNT: Address = Address::new([0x6a; 20]);

// ═══════════════════════════════════════════════════════════════════════════════
// TRAITS
// ═══════════════════════════════════════════════════════════════════════════════

/// Source of the collateral price (in debt-token units, 18 decimals)
pub trait PriceFeed {
    /// Current price
    fn get_price(&self) -> Result<Decimal18>;
}

/// Ordered set of active positions keyed by nominal collateral ratio
pub trait SortedPositions {
    /// Insert a new position
    fn insert(&mut self, id: PositionId, nicr: U256) -> Result<()>;

    /// Move an existing position to its new key
    fn re_insert(&mut self, id: PositionId, nicr: U256) -> Result<()>;

    /// Remove a position
    fn remove(&mut self, id: &PositionId) -> Result<()>;

    /// Check membership
    fn contains(&self, id: &PositionId) -> bool;

    /// Number of positions
    fn size(&self) -> usize;

    /// Position with the lowest nominal ratio, if any
    fn lowest(&self) -> Option<PositionId>;
}

/// Token movements performed once accounting is final.
///
/// The engine checks every stablecoin balance it draws on before touching its
/// own state, so implementations should fail only on insufficient balance.
pub trait TokenLedger {
    /// Stablecoin balance of an account
    fn stable_balance(&self, account: &Address) -> Decimal18;

    /// Mint stablecoin
    fn mint_stable(&mut self, to: &Address, amount: Decimal18) -> Result<()>;

    /// Burn stablecoin
    fn burn_stable(&mut self, from: &Address, amount: Decimal18) -> Result<()>;

    /// Move stablecoin between accounts
    fn transfer_stable(&mut self, from: &Address, to: &Address, amount: Decimal18) -> Result<()>;

    /// Pay collateral out of the system
    fn send_collateral(&mut self, to: &Address, amount: Decimal18) -> Result<()>;

    /// Pay secondary reward tokens
    fn send_secondary(&mut self, to: &Address, amount: Decimal18) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED PRICE FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// Price feed returning a settable constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPriceFeed {
    price: Decimal18,
}

impl FixedPriceFeed {
    /// Create a feed with an initial price
    pub fn new(price: Decimal18) -> Self {
        Self { price }
    }

    /// Replace the price
    pub fn set_price(&mut self, price: Decimal18) {
        self.price = price;
    }
}

impl PriceFeed for FixedPriceFeed {
    fn get_price(&self) -> Result<Decimal18> {
        if self.price.is_zero() {
            return Err(Error::InvalidParameter {
                name: "price".into(),
                reason: "price feed returned zero".into(),
            });
        }
        Ok(self.price)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY SORTED POSITIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Sorted positions kept in a map plus an ordered index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemorySortedPositions {
    keys: BTreeMap<PositionId, U256>,
    ordered: BTreeSet<(U256, PositionId)>,
}

impl InMemorySortedPositions {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Positions ordered from lowest to highest nominal ratio
    pub fn ascending(&self) -> Vec<PositionId> {
        self.ordered.iter().map(|(_, id)| *id).collect()
    }

    /// Key currently stored for a position
    pub fn key_of(&self, id: &PositionId) -> Option<U256> {
        self.keys.get(id).copied()
    }
}

impl SortedPositions for InMemorySortedPositions {
    fn insert(&mut self, id: PositionId, nicr: U256) -> Result<()> {
        if self.keys.contains_key(&id) {
            return Err(Error::PositionAlreadyActive(id));
        }
        self.keys.insert(id, nicr);
        self.ordered.insert((nicr, id));
        Ok(())
    }

    fn re_insert(&mut self, id: PositionId, nicr: U256) -> Result<()> {
        match self.keys.get_mut(&id) {
            Some(key) => {
                self.ordered.remove(&(*key, id));
                self.ordered.insert((nicr, id));
                *key = nicr;
                Ok(())
            }
            None => Err(Error::NoStakeOrPosition(id)),
        }
    }

    fn remove(&mut self, id: &PositionId) -> Result<()> {
        let nicr = self.keys.remove(id).ok_or(Error::NoStakeOrPosition(*id))?;
        self.ordered.remove(&(nicr, *id));
        Ok(())
    }

    fn contains(&self, id: &PositionId) -> bool {
        self.keys.contains_key(id)
    }

    fn size(&self) -> usize {
        self.keys.len()
    }

    fn lowest(&self) -> Option<PositionId> {
        self.ordered.iter().next().map(|(_, id)| *id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IN-MEMORY TOKEN LEDGER
// ═══════════════════════════════════════════════════════════════════════════════

/// Token balances kept in memory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InMemoryTokenLedger {
    stable: BTreeMap<Address, Decimal18>,
    collateral_paid: BTreeMap<Address, Decimal18>,
    secondary_paid: BTreeMap<Address, Decimal18>,
    stable_supply: Decimal18,
}

impl InMemoryTokenLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Total collateral paid out to an account
    pub fn collateral_balance(&self, account: &Address) -> Decimal18 {
        self.collateral_paid.get(account).copied().unwrap_or_default()
    }

    /// Total secondary tokens paid to an account
    pub fn secondary_balance(&self, account: &Address) -> Decimal18 {
        self.secondary_paid.get(account).copied().unwrap_or_default()
    }

    /// Outstanding stablecoin supply
    pub fn total_stable_supply(&self) -> Decimal18 {
        self.stable_supply
    }

    fn add(map: &mut BTreeMap<Address, Decimal18>, account: &Address, amount: Decimal18) -> Result<()> {
        let entry = map.entry(*account).or_default();
        *entry = entry.checked_add(amount)?;
        Ok(())
    }

    fn debit_stable(&mut self, account: &Address, amount: Decimal18) -> Result<()> {
        let available = self.stable_balance(account);
        if available < amount {
            return Err(Error::InsufficientBalance {
                account: account.to_hex(),
                requested: amount,
                available,
            });
        }
        self.stable.insert(*account, available.saturating_sub(amount));
        Ok(())
    }
}

impl TokenLedger for InMemoryTokenLedger {
    fn stable_balance(&self, account: &Address) -> Decimal18 {
        self.stable.get(account).copied().unwrap_or_default()
    }

    fn mint_stable(&mut self, to: &Address, amount: Decimal18) -> Result<()> {
        self.stable_supply = self.stable_supply.checked_add(amount)?;
        Self::add(&mut self.stable, to, amount)
    }

    fn burn_stable(&mut self, from: &Address, amount: Decimal18) -> Result<()> {
        self.debit_stable(from, amount)?;
        self.stable_supply = self.stable_supply.saturating_sub(amount);
        Ok(())
    }

    fn transfer_stable(&mut self, from: &Address, to: &Address, amount: Decimal18) -> Result<()> {
        self.debit_stable(from, amount)?;
        Self::add(&mut self.stable, to, amount)
    }

    fn send_collateral(&mut self, to: &Address, amount: Decimal18) -> Result<()> {
        Self::add(&mut self.collateral_paid, to, amount)
    }

    fn send_secondary(&mut self, to: &Address, amount: Decimal18) -> Result<()> {
        Self::add(&mut self.secondary_paid, to, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_positions_order() {
        let mut sorted = InMemorySortedPositions::new();
        assert_eq!(sorted.lowest(), None);
        let a = Address::from_index(1);
        let b = Address::from_index(2);
        sorted.insert(a, U256::from(300u64)).unwrap();
        sorted.insert(b, U256::from(200u64)).unwrap();
        assert_eq!(sorted.ascending(), vec![b, a]);
        assert_eq!(sorted.lowest(), Some(b));

        sorted.re_insert(b, U256::from(400u64)).unwrap();
        assert_eq!(sorted.ascending(), vec![a, b]);
        assert_eq!(sorted.lowest(), Some(a));
        assert_eq!(sorted.key_of(&b), Some(U256::from(400u64)));

        sorted.remove(&a).unwrap();
        assert!(!sorted.contains(&a));
        assert_eq!(sorted.size(), 1);
        assert_eq!(sorted.lowest(), Some(b));
        assert!(sorted.remove(&a).is_err());
        assert!(sorted.insert(b, U256::one()).is_err());
    }

    #[test]
    fn test_ledger_transfers() {
        let mut ledger = InMemoryTokenLedger::new();
        let alice = Address::from_index(1);
        let bob = Address::from_index(2);

        ledger.mint_stable(&alice, Decimal18::from_integer(100)).unwrap();
        ledger.transfer_stable(&alice, &bob, Decimal18::from_integer(30)).unwrap();
        ledger.burn_stable(&bob, Decimal18::from_integer(10)).unwrap();

        assert_eq!(ledger.stable_balance(&alice), Decimal18::from_integer(70));
        assert_eq!(ledger.stable_balance(&bob), Decimal18::from_integer(20));
        assert_eq!(ledger.total_stable_supply(), Decimal18::from_integer(90));

        let err = ledger
            .transfer_stable(&bob, &alice, Decimal18::from_integer(21))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
    }

    #[test]
    fn test_fixed_price_feed() {
        let mut feed = FixedPriceFeed::new(Decimal18::from_integer(200));
        assert_eq!(feed.get_price().unwrap(), Decimal18::from_integer(200));
        feed.set_price(Decimal18::ZERO);
        assert!(feed.get_price().is_err());
    }
}
