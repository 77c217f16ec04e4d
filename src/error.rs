//! Error types for the CDP accounting engine.
//!
//! Every fallible operation returns [`Result`]. A returned error means the
//! operation left no observable state change behind.

use thiserror::Error;

use crate::utils::crypto::Address;
use crate::utils::math::Decimal18;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ═══════════════════════════════════════════════════════════════════
    // Position Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Position is not active or has no stake
    #[error("Position {0} has no stake or is not active")]
    NoStakeOrPosition(Address),

    /// Position already exists and is active
    #[error("Position {0} is already active")]
    PositionAlreadyActive(Address),

    /// Collateralization ratio below minimum
    #[error("Collateralization ratio {current} below minimum {minimum}")]
    CollateralizationRatioTooLow {
        /// Current ratio
        current: Decimal18,
        /// Minimum required ratio
        minimum: Decimal18,
    },

    /// Net debt below the protocol minimum
    #[error("Net debt {amount} below minimum {minimum}")]
    DebtBelowMinimum {
        /// Requested net debt
        amount: Decimal18,
        /// Protocol minimum net debt
        minimum: Decimal18,
    },

    /// Remaining debt would not cover the gas compensation reserve
    #[error("Debt must exceed the gas compensation reserve")]
    DebtBelowGasCompensation,

    /// No collateral surplus to claim
    #[error("No collateral surplus available for {0}")]
    NoCollateralSurplus(Address),

    // ═══════════════════════════════════════════════════════════════════
    // Liquidation Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Position is not eligible for liquidation
    #[error("Position {position} is not liquidatable: ICR {icr} >= {threshold}")]
    NotLiquidatable {
        /// Position owner
        position: Address,
        /// Individual collateral ratio
        icr: Decimal18,
        /// Threshold in force
        threshold: Decimal18,
    },

    /// No candidate in the request was liquidated
    #[error("Nothing to liquidate")]
    NothingToLiquidate,

    /// The last active position cannot be liquidated
    #[error("Only one position in the system")]
    OnlyOnePositionInSystem,

    /// Offset requested against an empty stability pool
    #[error("Stability pool is empty")]
    PoolEmptyForOffset,

    // ═══════════════════════════════════════════════════════════════════
    // Stability Pool Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Depositor has no deposit
    #[error("No deposit for {0}")]
    NoDeposit(Address),

    /// Front end already registered
    #[error("Front end {0} already registered")]
    FrontEndAlreadyRegistered(Address),

    /// Front end not registered
    #[error("Front end {0} not registered")]
    FrontEndNotRegistered(Address),

    /// Registered front ends may not deposit
    #[error("Front end {0} cannot make deposits")]
    FrontEndCannotDeposit(Address),

    /// Kickback rate outside [0, 1]
    #[error("Kickback rate {0} must be within [0, 1]")]
    InvalidKickbackRate(Decimal18),

    /// Withdrawal blocked while undercollateralized positions exist
    #[error("Cannot withdraw while there are undercollateralized positions")]
    UndercollateralizedPositionsExist,

    // ═══════════════════════════════════════════════════════════════════
    // Validation Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invalid input parameter
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Reason for invalidity
        reason: String,
    },

    /// Amount invalid for the operation (typically zero)
    #[error("Invalid amount for {name}: {amount}")]
    InvalidAmount {
        /// What the amount was for
        name: String,
        /// Supplied amount
        amount: Decimal18,
    },

    /// Account balance too low for a transfer
    #[error("Insufficient balance for {account}: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Account holding the balance
        account: String,
        /// Requested amount
        requested: Decimal18,
        /// Available amount
        available: Decimal18,
    },

    /// Overflow in calculation
    #[error("Arithmetic overflow in {operation}")]
    Overflow {
        /// Operation that overflowed
        operation: String,
    },

    /// Underflow in calculation
    #[error("Arithmetic underflow in {operation}")]
    Underflow {
        /// Operation that underflowed
        operation: String,
    },

    /// Division by zero
    #[error("Division by zero in {operation}")]
    DivisionByZero {
        /// Operation that divided by zero
        operation: String,
    },

    // ═══════════════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════════════

    /// Invariant violation detected
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl Error {
    /// Returns true if the caller can retry after changing inputs or market state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotLiquidatable { .. }
                | Error::NothingToLiquidate
                | Error::PoolEmptyForOffset
                | Error::CollateralizationRatioTooLow { .. }
                | Error::DebtBelowMinimum { .. }
                | Error::InsufficientBalance { .. }
                | Error::UndercollateralizedPositionsExist
        )
    }

    /// Returns true if this is a critical error requiring immediate attention
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Error::InvariantViolation(_)
                | Error::Overflow { .. }
                | Error::Underflow { .. }
                | Error::DivisionByZero { .. }
        )
    }

    /// Returns the error code for external systems
    pub fn code(&self) -> u32 {
        match self {
            // Position errors: 1xxx
            Error::NoStakeOrPosition(_) => 1001,
            Error::PositionAlreadyActive(_) => 1002,
            Error::CollateralizationRatioTooLow { .. } => 1003,
            Error::DebtBelowMinimum { .. } => 1004,
            Error::DebtBelowGasCompensation => 1005,
            Error::NoCollateralSurplus(_) => 1006,

            // Liquidation errors: 2xxx
            Error::NotLiquidatable { .. } => 2001,
            Error::NothingToLiquidate => 2002,
            Error::OnlyOnePositionInSystem => 2003,
            Error::PoolEmptyForOffset => 2004,

            // Stability pool errors: 3xxx
            Error::NoDeposit(_) => 3001,
            Error::FrontEndAlreadyRegistered(_) => 3002,
            Error::FrontEndNotRegistered(_) => 3003,
            Error::FrontEndCannotDeposit(_) => 3004,
            Error::InvalidKickbackRate(_) => 3005,
            Error::UndercollateralizedPositionsExist => 3006,

            // Validation errors: 5xxx
            Error::InvalidParameter { .. } => 5001,
            Error::InvalidAmount { .. } => 5002,
            Error::InsufficientBalance { .. } => 5003,
            Error::Overflow { .. } => 5004,
            Error::Underflow { .. } => 5005,
            Error::DivisionByZero { .. } => 5006,

            // System errors: 6xxx / 7xxx
            Error::InvariantViolation(_) => 6001,
            Error::Config(_) => 6003,
            Error::Serialization(_) => 7001,
            Error::Deserialization(_) => 7002,
        }
    }

    /// Shorthand for a zero or otherwise invalid amount
    pub fn invalid_amount(name: &str, amount: Decimal18) -> Self {
        Error::InvalidAmount {
            name: name.into(),
            amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_unique() {
        let addr = Address::from_index(1);
        let codes = vec![
            Error::NoStakeOrPosition(addr).code(),
            Error::PositionAlreadyActive(addr).code(),
            Error::DebtBelowGasCompensation.code(),
            Error::NothingToLiquidate.code(),
            Error::OnlyOnePositionInSystem.code(),
            Error::PoolEmptyForOffset.code(),
            Error::NoDeposit(addr).code(),
            Error::FrontEndCannotDeposit(addr).code(),
            Error::invalid_amount("x", Decimal18::ZERO).code(),
            Error::DivisionByZero { operation: "".into() }.code(),
            Error::InvariantViolation("".into()).code(),
            Error::Config("".into()).code(),
        ];

        let mut unique_codes = codes.clone();
        unique_codes.sort();
        unique_codes.dedup();

        assert_eq!(codes.len(), unique_codes.len(), "Error codes must be unique");
    }

    #[test]
    fn test_error_display() {
        let err = Error::InsufficientBalance {
            account: "stability_pool".into(),
            requested: Decimal18::from_integer(1000),
            available: Decimal18::from_integer(500),
        };
        assert!(err.to_string().contains("1000"));
        assert!(err.to_string().contains("500"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(Error::NothingToLiquidate.is_recoverable());
        assert!(!Error::InvariantViolation("test".into()).is_recoverable());
    }

    #[test]
    fn test_is_critical() {
        assert!(Error::InvariantViolation("test".into()).is_critical());
        assert!(Error::Overflow { operation: "test".into() }.is_critical());
        assert!(!Error::NoDeposit(Address::zero()).is_critical());
    }
}
