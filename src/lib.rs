//! # CDP Engine
//!
//! Liquidation-and-redistribution accounting for a collateralized debt
//! position system: stakes and pending rewards, stability pool offsets with
//! compounding deposits, and single or batch liquidation sequencing.
//!
//! ## Architecture
//!
//! The engine consists of several core modules:
//!
//! - **Core**: Configuration, positions, accounting pools and collaborator traits
//! - **Liquidation**: Reward snapshots, stability pool, issuance and sequencing
//! - **Protocol**: Engine facade, operations and events
//! - **Utils**: Fixed-point math, identifiers and constants
//!
//! ## Design Principles
//!
//! - **Atomic**: Every operation is planned before any state changes
//! - **Exact**: Integer fixed-point arithmetic with carried rounding errors
//! - **O(1) accounting**: Per-position and per-depositor values are derived from
//!   global accumulators, never by iterating over holders
//!
//! ## Example
//!
//! ```rust,ignore
//! use cdp_engine::prelude::*;
//!
//! let mut engine = CdpEngine::new(
//!     EngineConfig::default(),
//!     FixedPriceFeed::new("100".parse()?),
//!     InMemorySortedPositions::new(),
//!     InMemoryTokenLedger::new(),
//! )?;
//! engine.open_position(owner, "10".parse()?, "500".parse()?)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications
)]

pub mod core;
pub mod error;
pub mod liquidation;
pub mod protocol;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::{
        config::EngineConfig,
        interfaces::{
            FixedPriceFeed, InMemorySortedPositions, InMemoryTokenLedger, PriceFeed,
            SortedPositions, TokenLedger, GAS_POOL_ACCOUNT, STABILITY_POOL_ACCOUNT,
        },
        pools::{Asset, AssetPool},
        position::{PositionStatus, Reconciled},
    };
    pub use crate::error::{Error, Result};
    pub use crate::liquidation::{
        rewards::RewardSnapshotEngine,
        sequencer::{LiquidationMode, LiquidationTotals},
        stability_pool::StabilityPool,
    };
    pub use crate::protocol::{
        engine::{CdpEngine, EngineStatistics},
        events::{EngineEvent, EventLog},
        operations::{Operation, OperationResult, PositionAdjustment},
    };
    pub use crate::utils::{
        crypto::{Address, Hash, PositionId},
        math::{Decimal18, U256},
    };
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
