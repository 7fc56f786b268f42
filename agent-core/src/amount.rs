//! A fixed-point monetary amount newtype, modeled the same way the teacher's
//! `Amount` wraps satoshis: a non-negative [`Decimal`] with a hard upper
//! bound, explicit unit-named constructors (no bare [`From<u64>`]), and
//! checked arithmetic that never silently wraps or goes negative.
//!
//! Amounts here are currency-agnostic decimal quantities (e.g. "0.05 USDC");
//! the "lamport" smallest unit is only relevant at the chain boundary, where
//! [`Amount::to_lamports`] converts using 9 fractional digits.

use std::{
    fmt::{self, Display},
    ops::{Add, Sub},
};

use rust_decimal::{prelude::ToPrimitive, Decimal};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Number of fractional digits in the chain's smallest unit (lamport-style).
pub const LAMPORT_DECIMALS: u32 = 9;

#[derive(Debug, thiserror::Error)]
pub enum AmountError {
    #[error("amount is negative")]
    Negative,
    #[error("amount is too large")]
    TooLarge,
    #[error("amount converts to zero smallest-units, must be at least 1")]
    TooSmall,
}

/// A non-negative decimal amount, bounded so that conversion to the chain's
/// smallest unit never overflows a `u64`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Amount(Decimal);

impl Amount {
    /// `u64::MAX` smallest-units, expressed in whole currency units.
    pub const MAX: Self = Self(Decimal::from_parts(
        4294967295, 4294967295, 0, false, LAMPORT_DECIMALS,
    ));

    pub const ZERO: Self = Self(dec!(0));

    #[inline]
    pub fn try_from_decimal(value: Decimal) -> Result<Self, AmountError> {
        Self::try_from_inner(value)
    }

    /// Parse a decimal string, e.g. `"0.05"`.
    pub fn try_from_str(value: &str) -> Result<Self, AmountError> {
        let decimal = Decimal::from_str_exact(value)
            .map_err(|_| AmountError::Negative)?;
        Self::try_from_inner(decimal)
    }

    #[inline]
    pub fn from_lamports(lamports: u64) -> Self {
        Self(Decimal::from(lamports) / Decimal::from(10u64.pow(LAMPORT_DECIMALS)))
    }

    #[inline]
    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Converts to the chain's smallest unit, rejecting amounts that would
    /// round down to zero (the executor requires a transfer of at least one
    /// smallest-unit).
    pub fn to_lamports(&self) -> Result<u64, AmountError> {
        let lamports = self.0 * Decimal::from(10u64.pow(LAMPORT_DECIMALS));
        let lamports = lamports.to_u64().ok_or(AmountError::TooLarge)?;
        if lamports == 0 && self.0 > Decimal::ZERO {
            return Err(AmountError::TooSmall);
        }
        Ok(lamports)
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_add(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    #[inline]
    fn try_from_inner(inner: Decimal) -> Result<Self, AmountError> {
        if inner.is_sign_negative() {
            Err(AmountError::Negative)
        } else if inner > Self::MAX.0 {
            Err(AmountError::TooLarge)
        } else {
            Ok(Self(inner))
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;
        Self::try_from_inner(inner).map_err(serde::de::Error::custom)
    }
}

impl Display for Amount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decimal::fmt(&self.0, f)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Self) -> Self::Output {
        self.checked_add(rhs).expect("Amount addition overflowed")
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Self) -> Self::Output {
        self.checked_sub(rhs).expect("Amount subtraction underflowed")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn zero_is_valid() {
        assert_eq!(Amount::ZERO.to_lamports().unwrap(), 0);
    }

    #[test]
    fn rejects_negative() {
        assert!(matches!(
            Amount::try_from_str("-1").unwrap_err(),
            AmountError::Negative
        ));
    }

    #[test]
    fn roundtrips_lamports() {
        let amount = Amount::try_from_str("0.05").unwrap();
        let lamports = amount.to_lamports().unwrap();
        assert_eq!(lamports, 50_000_000);
        assert_eq!(Amount::from_lamports(lamports), amount);
    }

    #[test]
    fn dust_amount_rejected_as_too_small() {
        // 1 / 10^9 of a unit, smaller than 1 lamport-equivalent, is fine (1
        // lamport exactly); anything that rounds to zero lamports is not.
        let amount = Amount::try_from_str("0.0000000001").unwrap();
        assert!(matches!(
            amount.to_lamports().unwrap_err(),
            AmountError::TooSmall
        ));
    }

    proptest! {
        #[test]
        fn checked_add_never_panics(a in 0u64..1_000_000_000, b in 0u64..1_000_000_000) {
            let a = Amount::from_lamports(a);
            let b = Amount::from_lamports(b);
            let _ = a.checked_add(b);
        }
    }
}
