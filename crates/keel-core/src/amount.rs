//! Fixed-point monetary types.
//!
//! All monetary values in the system are integers in the fund's base unit
//! (18 fractional digits). `Amount` wraps `U256` to keep chain-sourced values
//! exact and to prevent mixing amounts with ratios in calculations.
//! Ratios are expressed in basis points via `Bps`.

use alloy::primitives::U256;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use std::str::FromStr;

use crate::error::CoreError;

/// Number of fractional digits in the base unit.
pub const BASE_UNIT_DECIMALS: u32 = 18;

/// One whole unit of account (10^18).
pub fn one_unit() -> U256 {
    U256::from(10u64).pow(U256::from(BASE_UNIT_DECIMALS))
}

/// Monetary amount in base units.
///
/// Arithmetic is checked: overflow is a programming error surfaced as
/// `CoreError::AmountOverflow` rather than a silent wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(pub U256);

impl Amount {
    pub const ZERO: Self = Self(U256::ZERO);

    #[inline]
    #[must_use]
    pub fn new(value: U256) -> Self {
        Self(value)
    }

    /// Amount from whole units of account (e.g. `from_units(10_000)` = 10,000·10¹⁸).
    #[must_use]
    pub fn from_units(units: u64) -> Self {
        Self(U256::from(units) * one_unit())
    }

    /// Amount from raw base units expressed as u128.
    #[must_use]
    pub fn from_base(base: u128) -> Self {
        Self(U256::from(base))
    }

    #[inline]
    #[must_use]
    pub fn inner(&self) -> U256 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, CoreError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, CoreError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(CoreError::AmountUnderflow)
    }

    /// Subtraction clamped at zero.
    #[must_use]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    #[must_use]
    pub fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    #[must_use]
    pub fn min(self, rhs: Self) -> Self {
        if self.0 <= rhs.0 {
            self
        } else {
            rhs
        }
    }

    #[must_use]
    pub fn max(self, rhs: Self) -> Self {
        if self.0 >= rhs.0 {
            self
        } else {
            rhs
        }
    }

    /// Apply a basis-point fraction: `self * bps / 10_000`.
    ///
    /// Negative `bps` yields zero (amounts are unsigned).
    #[must_use]
    pub fn mul_bps(self, bps: Bps) -> Self {
        if bps.0 <= 0 {
            return Self::ZERO;
        }
        Self(self.0 * U256::from(bps.0 as u64) / U256::from(Bps::SCALE))
    }

    /// Ratio of `self` to `total` in basis points, saturating at `Bps::MAX`.
    ///
    /// Returns zero when `total` is zero.
    #[must_use]
    pub fn ratio_bps(self, total: Self) -> Bps {
        if total.is_zero() {
            return Bps::ZERO;
        }
        let scaled = self.0.saturating_mul(U256::from(Bps::SCALE)) / total.0;
        if scaled > U256::from(i64::MAX as u64) {
            Bps::MAX
        } else {
            Bps(scaled.to::<u64>() as i64)
        }
    }

    /// Lossy conversion to `f64` for statistical calculations.
    ///
    /// Exact for values below 2^53 base units; relative error is bounded by
    /// f64 precision above that, which is acceptable for forecasting.
    #[must_use]
    pub fn to_f64_lossy(&self) -> f64 {
        self.0
            .as_limbs()
            .iter()
            .rev()
            .fold(0.0f64, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
    }

    /// Lossy conversion to whole units of account as `f64`.
    #[must_use]
    pub fn to_units_f64(&self) -> f64 {
        self.to_f64_lossy() / 1e18
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        U256::from_str_radix(s, 10)
            .map(Self)
            .map_err(|e| CoreError::InvalidAmount(e.to_string()))
    }
}

// Amounts serialize as decimal strings so they survive JSON round-trips
// through systems that mangle large integers.
impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Signed ratio in basis points (1 bp = 1/10,000).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bps(pub i64);

impl Bps {
    pub const SCALE: u64 = 10_000;
    pub const ZERO: Self = Self(0);
    /// 100% expressed in basis points.
    pub const ONE: Self = Self(10_000);
    pub const MAX: Self = Self(i64::MAX);

    #[inline]
    #[must_use]
    pub fn new(bps: i64) -> Self {
        Self(bps)
    }

    #[inline]
    #[must_use]
    pub fn inner(&self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Signed difference `self - rhs`.
    #[must_use]
    pub fn diff(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }

    /// Fractional value as `f64` (e.g. `Bps(150)` → `0.015`).
    #[must_use]
    pub fn as_fraction(self) -> f64 {
        self.0 as f64 / Self::SCALE as f64
    }
}

impl fmt::Display for Bps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}bp", self.0)
    }
}
