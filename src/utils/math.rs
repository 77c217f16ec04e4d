//! Fixed-point arithmetic and mathematical utilities.
//!
//! All amounts are 18-decimal fixed-point values stored in 256-bit unsigned
//! integers. Products such as `stake * ΔL` routinely exceed 128 bits, so the
//! accumulator math is carried out on [`U256`] with checked operations that
//! surface overflow as an [`Error`] instead of wrapping.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;

pub use primitive_types::U256;

use crate::error::{Error, Result};
use crate::utils::constants::{
    DECIMALS, DECIMAL_PRECISION, MAX_DEC_POW_MINUTES, MINUTE_DECAY_FACTOR, NICR_PRECISION,
};

// ═══════════════════════════════════════════════════════════════════════════════
// RAW U256 HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// 10^18 as a 256-bit integer
pub fn precision() -> U256 {
    U256::from(DECIMAL_PRECISION)
}

/// Checked `a + b`
pub fn checked_add(a: U256, b: U256, operation: &str) -> Result<U256> {
    a.checked_add(b).ok_or_else(|| Error::Overflow {
        operation: operation.into(),
    })
}

/// Checked `a - b`
pub fn checked_sub(a: U256, b: U256, operation: &str) -> Result<U256> {
    a.checked_sub(b).ok_or_else(|| Error::Underflow {
        operation: operation.into(),
    })
}

/// Checked `a * b`
pub fn checked_mul(a: U256, b: U256, operation: &str) -> Result<U256> {
    a.checked_mul(b).ok_or_else(|| Error::Overflow {
        operation: operation.into(),
    })
}

/// Checked `a / b`
pub fn checked_div(a: U256, b: U256, operation: &str) -> Result<U256> {
    if b.is_zero() {
        return Err(Error::DivisionByZero {
            operation: operation.into(),
        });
    }
    Ok(a / b)
}

/// Computes `(a * b) / c`, truncating
pub fn mul_div(a: U256, b: U256, c: U256, operation: &str) -> Result<U256> {
    let product = checked_mul(a, b, operation)?;
    checked_div(product, c, operation)
}

/// Fixed-point multiplication rounding half up: `(x * y + 1e18 / 2) / 1e18`
pub fn dec_mul(x: U256, y: U256) -> Result<U256> {
    let product = checked_mul(x, y, "dec_mul")?;
    let rounded = checked_add(product, precision() / 2, "dec_mul")?;
    Ok(rounded / precision())
}

/// Raises an 18-decimal `base` to the integer power `minutes`.
///
/// Exponentiation by squaring with `dec_mul` at every step. The exponent is
/// capped at [`MAX_DEC_POW_MINUTES`] so the loop stays bounded; for any base
/// below one the result has long reached zero by then.
pub fn dec_pow(base: U256, minutes: u64) -> Result<U256> {
    let mut n = minutes.min(MAX_DEC_POW_MINUTES);
    if n == 0 {
        return Ok(precision());
    }

    let mut y = precision();
    let mut x = base;

    while n > 1 {
        if n % 2 == 0 {
            x = dec_mul(x, x)?;
            n /= 2;
        } else {
            y = dec_mul(x, y)?;
            x = dec_mul(x, x)?;
            n = (n - 1) / 2;
        }
    }

    dec_mul(x, y)
}

/// Base rate after `minutes_passed` minutes of exponential decay
pub fn decayed_base_rate(base_rate: Decimal18, minutes_passed: u64) -> Result<Decimal18> {
    let decay = dec_pow(U256::from(MINUTE_DECAY_FACTOR), minutes_passed)?;
    let decayed = mul_div(base_rate.raw(), decay, precision(), "decayed_base_rate")?;
    Ok(Decimal18::from_raw(decayed))
}

// ═══════════════════════════════════════════════════════════════════════════════
// DECIMAL18
// ═══════════════════════════════════════════════════════════════════════════════

/// Non-negative 18-decimal fixed-point amount.
///
/// Serialized as a decimal string (`"2.995"`) so configuration files and
/// scenarios stay readable.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Decimal18(U256);

impl Decimal18 {
    /// Zero value
    pub const ZERO: Self = Self(U256([0, 0, 0, 0]));

    /// One (1.0)
    pub const ONE: Self = Self(U256([DECIMAL_PRECISION, 0, 0, 0]));

    /// Largest representable value, used for "infinite" collateral ratios
    pub const MAX: Self = Self(U256::MAX);

    /// Create from a raw 18-decimal value
    pub const fn from_raw(raw: U256) -> Self {
        Self(raw)
    }

    /// Create from a raw value given in wei (10^-18 units)
    pub fn from_wei(wei: u128) -> Self {
        Self(U256::from(wei))
    }

    /// Create from an integer number of whole units
    pub fn from_integer(value: u64) -> Self {
        Self(U256::from(value) * precision())
    }

    /// Create `numerator / denominator` whole units (e.g. `from_ratio(995, 1000)`)
    pub fn from_ratio(numerator: u64, denominator: u64) -> Result<Self> {
        let raw = mul_div(
            U256::from(numerator),
            precision(),
            U256::from(denominator),
            "Decimal18::from_ratio",
        )?;
        Ok(Self(raw))
    }

    /// Create from a percentage (110 = 110%)
    pub fn from_percentage(pct: u64) -> Self {
        Self(U256::from(pct) * precision() / U256::from(100u64))
    }

    /// Raw underlying value
    pub fn raw(&self) -> U256 {
        self.0
    }

    /// Check if value is zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Checked addition
    pub fn checked_add(self, other: Self) -> Result<Self> {
        checked_add(self.0, other.0, "Decimal18 add").map(Self)
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Self) -> Result<Self> {
        checked_sub(self.0, other.0, "Decimal18 sub").map(Self)
    }

    /// Saturating subtraction
    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Fixed-point product, truncating: `self * other / 1e18`
    pub fn mul(self, other: Self) -> Result<Self> {
        mul_div(self.0, other.0, precision(), "Decimal18 mul").map(Self)
    }

    /// Fixed-point quotient, truncating: `self * 1e18 / other`
    pub fn div(self, other: Self) -> Result<Self> {
        mul_div(self.0, precision(), other.0, "Decimal18 div").map(Self)
    }

    /// `self * numerator / denominator` on raw values
    pub fn mul_div(self, numerator: Self, denominator: Self) -> Result<Self> {
        mul_div(self.0, numerator.0, denominator.0, "Decimal18 mul_div").map(Self)
    }

    /// Divide by a plain integer
    pub fn div_int(self, divisor: u64) -> Result<Self> {
        checked_div(self.0, U256::from(divisor), "Decimal18 div_int").map(Self)
    }

    /// Minimum of two values
    pub fn min(self, other: Self) -> Self {
        Self(self.0.min(other.0))
    }

    /// Maximum of two values
    pub fn max(self, other: Self) -> Self {
        Self(self.0.max(other.0))
    }

    /// Absolute difference between two values
    pub fn abs_diff(self, other: Self) -> Self {
        if self.0 >= other.0 {
            Self(self.0 - other.0)
        } else {
            Self(other.0 - self.0)
        }
    }

    /// Lossy conversion to a [`Decimal`] rounded down to `dp` decimal places.
    ///
    /// Returns `None` when the value does not fit in a `Decimal`.
    pub fn to_decimal(&self, dp: u32) -> Option<Decimal> {
        let dp = dp.min(DECIMALS);
        let scaled = self.0 / U256::exp10((DECIMALS - dp) as usize);
        if scaled.bits() > 96 {
            return None;
        }
        Decimal::try_from_i128_with_scale(scaled.low_u128() as i128, dp).ok()
    }
}

impl fmt::Debug for Decimal18 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Decimal18({})", self)
    }
}

impl fmt::Display for Decimal18 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / precision();
        let frac = self.0 % precision();
        if frac.is_zero() {
            return write!(f, "{}", whole);
        }
        let frac = format!("{:0>18}", frac.to_string());
        write!(f, "{}.{}", whole, frac.trim_end_matches('0'))
    }
}

impl FromStr for Decimal18 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidParameter {
            name: "decimal".into(),
            reason: format!("{}: {:?}", reason, s),
        };

        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };

        if whole.is_empty() && frac.is_empty() {
            return Err(invalid("empty amount"));
        }
        if frac.len() > DECIMALS as usize {
            return Err(invalid("more than 18 decimals"));
        }
        if !whole.chars().chain(frac.chars()).all(|c| c.is_ascii_digit()) {
            return Err(invalid("not a non-negative decimal"));
        }

        let whole = if whole.is_empty() {
            U256::zero()
        } else {
            U256::from_dec_str(whole).map_err(|_| invalid("integer part out of range"))?
        };
        let frac = if frac.is_empty() {
            U256::zero()
        } else {
            let padded = format!("{:0<18}", frac);
            U256::from_dec_str(&padded).map_err(|_| invalid("fraction out of range"))?
        };

        let raw = checked_add(
            checked_mul(whole, precision(), "Decimal18::from_str")?,
            frac,
            "Decimal18::from_str",
        )?;
        Ok(Self(raw))
    }
}

impl Serialize for Decimal18 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Decimal18 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl From<u64> for Decimal18 {
    fn from(units: u64) -> Self {
        Self::from_integer(units)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COLLATERALIZATION CALCULATIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Individual collateral ratio: `coll * price / debt`.
///
/// Positions without debt have an infinite ratio, represented as [`Decimal18::MAX`].
pub fn compute_cr(coll: Decimal18, debt: Decimal18, price: Decimal18) -> Result<Decimal18> {
    if debt.is_zero() {
        return Ok(Decimal18::MAX);
    }
    let cr = mul_div(coll.raw(), price.raw(), debt.raw(), "compute_cr")?;
    Ok(Decimal18::from_raw(cr))
}

/// Nominal collateral ratio (price independent), scaled by 1e20.
///
/// This is the key handed to the sorted-positions collaborator.
pub fn compute_nominal_cr(coll: Decimal18, debt: Decimal18) -> Result<U256> {
    if debt.is_zero() {
        return Ok(U256::MAX);
    }
    mul_div(coll.raw(), U256::from(NICR_PRECISION), debt.raw(), "compute_nominal_cr")
}

/// Collateral gas compensation: `coll / divisor`, optionally capped
pub fn collateral_gas_compensation(
    coll: Decimal18,
    divisor: u64,
    cap: Option<Decimal18>,
) -> Result<Decimal18> {
    let share = coll.div_int(divisor)?;
    Ok(match cap {
        Some(cap) => share.min(cap),
        None => share,
    })
}
