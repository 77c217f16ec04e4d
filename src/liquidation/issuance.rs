//! Secondary-token issuance schedule for stability pool depositors.
//!
//! The cumulative issued amount follows `supply_cap * (1 - factor^minutes)`
//! where `minutes` counts whole minutes since deployment. Each trigger issues
//! the difference to the previously issued total.

use serde::{Deserialize, Serialize};

use crate::core::config::EngineConfig;
use crate::error::Result;
use crate::utils::constants::SECONDS_IN_ONE_MINUTE;
use crate::utils::math::{self, dec_pow, precision, Decimal18};

/// Result of an issuance trigger, not yet committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuancePlan {
    /// Newly issued amount
    pub issuance: Decimal18,
    /// Cumulative total after this trigger
    pub total_issued: Decimal18,
}

/// Time-based issuance of the secondary reward token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityIssuance {
    supply_cap: Decimal18,
    issuance_factor: Decimal18,
    deployment_time: u64,
    total_issued: Decimal18,
}

impl CommunityIssuance {
    /// Create an issuance schedule from configuration
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            supply_cap: config.supply_cap,
            issuance_factor: config.issuance_factor,
            deployment_time: config.deployment_time,
            total_issued: Decimal18::ZERO,
        }
    }

    /// Cumulative amount issued so far
    pub fn total_issued(&self) -> Decimal18 {
        self.total_issued
    }

    /// Total supply that will ever be issued
    pub fn supply_cap(&self) -> Decimal18 {
        self.supply_cap
    }

    /// Fraction of the supply cap issued by `now`, as an 18-decimal value
    pub fn cumulative_issuance_fraction(&self, now: u64) -> Result<Decimal18> {
        let minutes = now.saturating_sub(self.deployment_time) / SECONDS_IN_ONE_MINUTE;
        let remaining = dec_pow(self.issuance_factor.raw(), minutes)?;
        let fraction = math::checked_sub(precision(), remaining, "issuance fraction")?;
        Ok(Decimal18::from_raw(fraction))
    }

    /// Compute what a trigger at `now` would issue
    pub fn plan_issue(&self, now: u64) -> Result<IssuancePlan> {
        let fraction = self.cumulative_issuance_fraction(now)?;
        let total = self.supply_cap.mul(fraction)?.min(self.supply_cap);
        // The fraction is monotonic in time; an earlier `now` issues nothing
        let issuance = total.saturating_sub(self.total_issued);

        Ok(IssuancePlan {
            issuance,
            total_issued: self.total_issued.max(total),
        })
    }

    /// Commit a planned trigger
    pub fn apply_issue(&mut self, plan: &IssuancePlan) {
        self.total_issued = plan.total_issued;
        if !plan.issuance.is_zero() {
            tracing::debug!(
                issuance = %plan.issuance,
                total_issued = %plan.total_issued,
                "secondary token issued"
            );
        }
    }

    /// Issue everything accrued up to `now`
    pub fn issue(&mut self, now: u64) -> Result<Decimal18> {
        let plan = self.plan_issue(now)?;
        self.apply_issue(&plan);
        Ok(plan.issuance)
    }
}
