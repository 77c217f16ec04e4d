//! Liquidation accounting.
//!
//! This module handles liquidations and the stability pool:
//! - Reward snapshots and redistribution of liquidated debt and collateral
//! - Stability pool deposits, offsets and gain tracking
//! - Secondary-token issuance for depositors
//! - Single and batch liquidation sequencing in normal and recovery mode

pub mod issuance;
pub mod rewards;
pub mod sequencer;
pub mod stability_pool;

pub use issuance::*;
pub use rewards::*;
pub use sequencer::*;
pub use stability_pool::*;
