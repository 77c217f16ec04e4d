//! Protocol constants and magic numbers.
//!
//! All protocol-wide constants are defined here for easy auditing. Policy values
//! that a deployment may tune live in [`crate::core::config::EngineConfig`]; the
//! values below are either structural (precision, scale factors) or the defaults
//! that configuration falls back to.

// ═══════════════════════════════════════════════════════════════════════════════
// FIXED-POINT PRECISION
// ═══════════════════════════════════════════════════════════════════════════════

/// Number of decimals carried by every amount (18-decimal fixed point)
pub const DECIMALS: u32 = 18;

/// One whole unit in raw fixed-point representation (10^18)
pub const DECIMAL_PRECISION: u64 = 1_000_000_000_000_000_000;

/// Precision of the nominal collateral ratio used as ordering key (10^20)
pub const NICR_PRECISION: u128 = 100_000_000_000_000_000_000;

/// Scale jump applied to the stability pool product `P` (10^9)
pub const SCALE_FACTOR: u64 = 1_000_000_000;

/// Upper bound on the exponent accepted by `dec_pow` (1000 years in minutes)
pub const MAX_DEC_POW_MINUTES: u64 = 525_600_000;

/// Seconds per minute, used by decay and issuance schedules
pub const SECONDS_IN_ONE_MINUTE: u64 = 60;

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION DEFAULTS (raw 18-decimal values)
// ═══════════════════════════════════════════════════════════════════════════════

/// Default minimum collateralization ratio (MCR) - 110%
pub const DEFAULT_MCR: u64 = 1_100_000_000_000_000_000;

/// Default critical collateralization ratio (CCR) - 150%
pub const DEFAULT_CCR: u64 = 1_500_000_000_000_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Default divisor for the collateral gas compensation (1/200 = 0.5%)
pub const DEFAULT_COLL_GAS_COMPENSATION_DIVISOR: u64 = 200;

/// Default debt-token gas reserve per position, in whole tokens
pub const DEFAULT_DEBT_GAS_COMPENSATION_TOKENS: u64 = 20;

/// Default minimum net debt per position, in whole tokens
pub const DEFAULT_MIN_NET_DEBT_TOKENS: u64 = 180;

/// Default divisor below which a compounded deposit counts as dust
pub const DEFAULT_DEPOSIT_DUST_DIVISOR: u64 = SCALE_FACTOR;

// ═══════════════════════════════════════════════════════════════════════════════
// DECAY AND ISSUANCE DEFAULTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-minute decay factor of the base rate (half-life of 12 hours)
pub const MINUTE_DECAY_FACTOR: u64 = 999_037_758_833_783_000;

/// Per-minute issuance factor of the secondary token (half issued after one year)
pub const ISSUANCE_FACTOR: u64 = 999_998_681_227_695_000;

/// Default issuance supply cap, in whole secondary tokens
pub const DEFAULT_ISSUANCE_SUPPLY_CAP_TOKENS: u64 = 30_000_000;

// ═══════════════════════════════════════════════════════════════════════════════
// BOOKKEEPING
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum number of events retained by the engine event log
pub const MAX_EVENT_LOG: usize = 1000;

/// Length of an account address in bytes
pub const ADDRESS_LENGTH: usize = 20;

/// Length of a hash in bytes (SHA256)
pub const HASH_LENGTH: usize = 32;
