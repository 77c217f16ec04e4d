//! Engine configuration and policy parameters.
//!
//! Every policy constant the accounting core depends on lives in
//! [`EngineConfig`]. Values can be:
//! - Taken from defaults
//! - Loaded from a JSON file
//! - Overridden through `CDP_*` environment variables

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::utils::constants::*;
use crate::utils::math::{Decimal18, U256};

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Policy parameters for liquidation, stability pool and issuance accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Minimum collateralization ratio (MCR)
    /// Below this, positions can be liquidated
    pub mcr: Decimal18,

    /// Critical collateralization ratio (CCR)
    /// When the system TCR falls below this, the caller may liquidate in recovery mode
    pub ccr: Decimal18,

    /// Divisor applied to a liquidated position's collateral for the caller's compensation
    pub coll_gas_compensation_divisor: u64,

    /// Optional absolute cap on collateral gas compensation
    pub coll_gas_compensation_cap: Option<Decimal18>,

    /// Debt-token reserve added to every position's debt and paid to liquidators
    pub debt_gas_compensation: Decimal18,

    /// Minimum net debt (excluding the gas reserve) of a position
    pub min_net_debt: Decimal18,

    /// Compounded deposits below `initial / deposit_dust_divisor` count as zero
    pub deposit_dust_divisor: u64,

    /// Total secondary-token supply distributed to stability pool depositors
    pub supply_cap: Decimal18,

    /// Per-minute issuance decay factor
    pub issuance_factor: Decimal18,

    /// Issuance schedule start, in seconds
    pub deployment_time: u64,

    /// Maximum number of events kept in the engine log
    pub max_events: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mcr: Decimal18::from_raw(U256::from(DEFAULT_MCR)),
            ccr: Decimal18::from_raw(U256::from(DEFAULT_CCR)),
            coll_gas_compensation_divisor: DEFAULT_COLL_GAS_COMPENSATION_DIVISOR,
            coll_gas_compensation_cap: None,
            debt_gas_compensation: Decimal18::from_integer(DEFAULT_DEBT_GAS_COMPENSATION_TOKENS),
            min_net_debt: Decimal18::from_integer(DEFAULT_MIN_NET_DEBT_TOKENS),
            deposit_dust_divisor: DEFAULT_DEPOSIT_DUST_DIVISOR,
            supply_cap: Decimal18::from_integer(DEFAULT_ISSUANCE_SUPPLY_CAP_TOKENS),
            issuance_factor: Decimal18::from_raw(U256::from(ISSUANCE_FACTOR)),
            deployment_time: 0,
            max_events: MAX_EVENT_LOG,
        }
    }
}

impl EngineConfig {
    /// Set the minimum collateralization ratio
    pub fn with_mcr(mut self, mcr: Decimal18) -> Self {
        self.mcr = mcr;
        self
    }

    /// Set the critical collateralization ratio
    pub fn with_ccr(mut self, ccr: Decimal18) -> Self {
        self.ccr = ccr;
        self
    }

    /// Set collateral gas compensation divisor and optional cap
    pub fn with_coll_gas_compensation(mut self, divisor: u64, cap: Option<Decimal18>) -> Self {
        self.coll_gas_compensation_divisor = divisor;
        self.coll_gas_compensation_cap = cap;
        self
    }

    /// Set the debt gas compensation reserve
    pub fn with_debt_gas_compensation(mut self, reserve: Decimal18) -> Self {
        self.debt_gas_compensation = reserve;
        self
    }

    /// Set the minimum net debt
    pub fn with_min_net_debt(mut self, min_net_debt: Decimal18) -> Self {
        self.min_net_debt = min_net_debt;
        self
    }

    /// Set the issuance schedule
    pub fn with_issuance(mut self, supply_cap: Decimal18, deployment_time: u64) -> Self {
        self.supply_cap = supply_cap;
        self.deployment_time = deployment_time;
        self
    }

    /// Validate parameters are consistent
    pub fn validate(&self) -> Result<()> {
        let invalid = |name: &str, reason: &str| {
            Err(Error::InvalidParameter {
                name: name.into(),
                reason: reason.into(),
            })
        };

        if self.mcr <= Decimal18::ONE {
            return invalid("mcr", "must be above 100%");
        }
        if self.ccr < self.mcr {
            return invalid("ccr", "must not be below mcr");
        }
        if self.coll_gas_compensation_divisor == 0 {
            return invalid("coll_gas_compensation_divisor", "must be non-zero");
        }
        if self.deposit_dust_divisor == 0 {
            return invalid("deposit_dust_divisor", "must be non-zero");
        }
        if self.issuance_factor > Decimal18::ONE {
            return invalid("issuance_factor", "must not exceed 1");
        }
        if self.max_events == 0 {
            return invalid("max_events", "must be non-zero");
        }
        Ok(())
    }

    /// Load configuration from a JSON file; missing fields take defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        let config: Self =
            serde_json::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        std::fs::write(path.as_ref(), content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Default configuration with `CDP_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        Self::default().apply_env()
    }

    /// Apply `CDP_*` environment overrides to this configuration
    pub fn apply_env(mut self) -> Result<Self> {
        fn var<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
            match std::env::var(key) {
                Ok(raw) => raw
                    .parse()
                    .map(Some)
                    .map_err(|_| Error::Config(format!("{} has invalid value {:?}", key, raw))),
                Err(_) => Ok(None),
            }
        }

        if let Some(mcr) = var("CDP_MCR")? {
            self.mcr = mcr;
        }
        if let Some(ccr) = var("CDP_CCR")? {
            self.ccr = ccr;
        }
        if let Some(divisor) = var("CDP_COLL_GAS_COMPENSATION_DIVISOR")? {
            self.coll_gas_compensation_divisor = divisor;
        }
        if let Some(cap) = var("CDP_COLL_GAS_COMPENSATION_CAP")? {
            self.coll_gas_compensation_cap = Some(cap);
        }
        if let Some(reserve) = var("CDP_DEBT_GAS_COMPENSATION")? {
            self.debt_gas_compensation = reserve;
        }
        if let Some(min_net_debt) = var("CDP_MIN_NET_DEBT")? {
            self.min_net_debt = min_net_debt;
        }
        if let Some(divisor) = var("CDP_DEPOSIT_DUST_DIVISOR")? {
            self.deposit_dust_divisor = divisor;
        }
        if let Some(cap) = var("CDP_SUPPLY_CAP")? {
            self.supply_cap = cap;
        }
        if let Some(time) = var("CDP_DEPLOYMENT_TIME")? {
            self.deployment_time = time;
        }

        self.validate()?;
        Ok(self)
    }
}
