//! Arbitrary-precision balances
//!
//! Balances are unbounded integers plus a distinguished infinite value.
//! Fractional input is truncated toward zero when parsed, so every finite
//! `Amount` is already floored.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use num_bigint::BigInt;
use num_traits::{One, Signed, Zero};
use thiserror::Error;

/// Canonical string for the infinite amount
pub const INFINITY_STR: &str = "Infinity";

/// Largest decimal shift accepted before a value saturates to infinity
const MAX_DECIMAL_SHIFT: i64 = 100_000;

/// Strict parse failures (the value codec never surfaces these)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountParseError {
    #[error("empty amount")]
    Empty,
    #[error("invalid digits in amount {0:?}")]
    InvalidDigits(String),
    #[error("invalid exponent in amount {0:?}")]
    InvalidExponent(String),
}

/// An arbitrary-precision integer amount, or infinity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Amount {
    Finite(BigInt),
    Infinite,
}

impl Amount {
    pub fn zero() -> Self {
        Amount::Finite(BigInt::zero())
    }

    pub fn one() -> Self {
        Amount::Finite(BigInt::one())
    }

    /// `10^exp`
    pub fn pow10(exp: u32) -> Self {
        Amount::Finite(pow10(exp))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Amount::Finite(n) if n.is_zero())
    }

    pub fn is_negative(&self) -> bool {
        matches!(self, Amount::Finite(n) if n.is_negative())
    }

    pub fn is_positive(&self) -> bool {
        match self {
            Amount::Finite(n) => n.is_positive(),
            Amount::Infinite => true,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Amount::Infinite)
    }

    pub fn as_finite(&self) -> Option<&BigInt> {
        match self {
            Amount::Finite(n) => Some(n),
            Amount::Infinite => None,
        }
    }

    /// Negative values become zero
    pub fn clamp_non_negative(self) -> Self {
        if self.is_negative() { Amount::zero() } else { self }
    }

    /// Integer division by `divisor`, truncating toward zero.
    /// Infinity stays infinite; division by zero yields infinity.
    pub fn div_floor(&self, divisor: &BigInt) -> Self {
        match self {
            Amount::Finite(_) if divisor.is_zero() => Amount::Infinite,
            Amount::Finite(n) => Amount::Finite(n / divisor),
            Amount::Infinite => Amount::Infinite,
        }
    }

    /// Canonical persisted form: plain decimal digits or `Infinity`
    pub fn to_canonical(&self) -> String {
        match self {
            Amount::Finite(n) => n.to_string(),
            Amount::Infinite => INFINITY_STR.to_string(),
        }
    }

    /// Parse a decimal string and multiply it by `10^scale`.
    ///
    /// Accepts an optional sign, a fractional part and an `e` exponent
    /// (`"1.5e3"`, `"-12"`, `"Infinity"`). Digits left over after scaling are
    /// truncated. Negative infinity is rejected.
    pub fn parse_scaled(input: &str, scale: u32) -> Result<Self, AmountParseError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AmountParseError::Empty);
        }

        let (negative, body) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        if body.eq_ignore_ascii_case(INFINITY_STR) || body.eq_ignore_ascii_case("inf") {
            return if negative {
                Err(AmountParseError::InvalidDigits(input.to_string()))
            } else {
                Ok(Amount::Infinite)
            };
        }

        let (mantissa, exponent) = match body.find(['e', 'E']) {
            Some(i) => {
                let exp = body[i + 1..]
                    .parse::<i64>()
                    .map_err(|_| AmountParseError::InvalidExponent(input.to_string()))?;
                (&body[..i], exp)
            }
            None => (body, 0),
        };

        let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int_part.is_empty() && frac_part.is_empty()) || !all_digits(int_part) || !all_digits(frac_part) {
            return Err(AmountParseError::InvalidDigits(input.to_string()));
        }

        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        let is_zero = digits.bytes().all(|b| b == b'0');

        let shift = exponent
            .saturating_add(scale as i64)
            .saturating_sub(frac_part.len() as i64);
        if shift > MAX_DECIMAL_SHIFT {
            return match (is_zero, negative) {
                (true, _) => Ok(Amount::zero()),
                (false, false) => Ok(Amount::Infinite),
                (false, true) => Err(AmountParseError::InvalidExponent(input.to_string())),
            };
        }

        if shift >= 0 {
            digits.extend(std::iter::repeat_n('0', shift as usize));
        } else {
            let cut = shift.unsigned_abs() as usize;
            digits.truncate(digits.len().saturating_sub(cut));
        }
        if digits.is_empty() {
            return Ok(Amount::zero());
        }

        let magnitude = BigInt::parse_bytes(digits.as_bytes(), 10)
            .ok_or_else(|| AmountParseError::InvalidDigits(input.to_string()))?;
        Ok(Amount::Finite(if negative { -magnitude } else { magnitude }))
    }
}

pub(crate) fn pow10(exp: u32) -> BigInt {
    num_traits::pow(BigInt::from(10u8), exp as usize)
}

impl Default for Amount {
    fn default() -> Self {
        Amount::zero()
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amount::Finite(n) => write!(f, "{n}"),
            Amount::Infinite => f.write_str(INFINITY_STR),
        }
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse_scaled(s, 0)
    }
}

impl Ord for Amount {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Amount::Finite(a), Amount::Finite(b)) => a.cmp(b),
            (Amount::Finite(_), Amount::Infinite) => Ordering::Less,
            (Amount::Infinite, Amount::Finite(_)) => Ordering::Greater,
            (Amount::Infinite, Amount::Infinite) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Amount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<BigInt> for Amount {
    fn from(n: BigInt) -> Self {
        Amount::Finite(n)
    }
}

macro_rules! amount_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Amount {
            fn from(n: $t) -> Self {
                Amount::Finite(BigInt::from(n))
            }
        })*
    };
}

amount_from_int!(u32, u64, u128, i32, i64, i128, usize);

impl Add<&Amount> for &Amount {
    type Output = Amount;

    fn add(self, rhs: &Amount) -> Amount {
        match (self, rhs) {
            (Amount::Finite(a), Amount::Finite(b)) => Amount::Finite(a + b),
            _ => Amount::Infinite,
        }
    }
}

/// Infinity minus infinity is zero, and so is any finite value minus infinity
impl Sub<&Amount> for &Amount {
    type Output = Amount;

    fn sub(self, rhs: &Amount) -> Amount {
        match (self, rhs) {
            (Amount::Finite(a), Amount::Finite(b)) => Amount::Finite(a - b),
            (Amount::Infinite, Amount::Finite(_)) => Amount::Infinite,
            (_, Amount::Infinite) => Amount::zero(),
        }
    }
}

/// Infinity times a non-positive finite value is zero
impl Mul<&Amount> for &Amount {
    type Output = Amount;

    fn mul(self, rhs: &Amount) -> Amount {
        match (self, rhs) {
            (Amount::Finite(a), Amount::Finite(b)) => Amount::Finite(a * b),
            (Amount::Infinite, other) | (other, Amount::Infinite) => {
                if other.is_positive() { Amount::Infinite } else { Amount::zero() }
            }
        }
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        &self + &rhs
    }
}

impl Sub for Amount {
    type Output = Amount;

    fn sub(self, rhs: Amount) -> Amount {
        &self - &rhs
    }
}

impl Mul for Amount {
    type Output = Amount;

    fn mul(self, rhs: Amount) -> Amount {
        &self * &rhs
    }
}

/// A multiplicative factor: a whole amount or a decimal
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    Whole(Amount),
    Decimal(f64),
}

impl Factor {
    /// The factor as a fixed-point integer scaled by `10^scale`.
    ///
    /// NaN and negative infinity map to zero.
    pub fn to_scaled(&self, scale: u32) -> Amount {
        match self {
            Factor::Whole(a) => a * &Amount::pow10(scale),
            Factor::Decimal(f) if f.is_nan() => Amount::zero(),
            Factor::Decimal(f) if f.is_infinite() => {
                if *f > 0.0 { Amount::Infinite } else { Amount::zero() }
            }
            Factor::Decimal(f) => {
                let text = format!("{f:.prec$}", prec = scale as usize);
                Amount::parse_scaled(&text, scale).unwrap_or_default()
            }
        }
    }
}

impl From<Amount> for Factor {
    fn from(a: Amount) -> Self {
        Factor::Whole(a)
    }
}

impl From<f64> for Factor {
    fn from(f: f64) -> Self {
        Factor::Decimal(f)
    }
}

impl From<u32> for Factor {
    fn from(n: u32) -> Self {
        Factor::Whole(n.into())
    }
}

impl From<u64> for Factor {
    fn from(n: u64) -> Self {
        Factor::Whole(n.into())
    }
}

impl From<i64> for Factor {
    fn from(n: i64) -> Self {
        Factor::Whole(n.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn amt(s: &str) -> Amount {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_plain_and_signed() {
        assert_eq!(amt("123"), Amount::from(123u32));
        assert_eq!(amt("+7"), Amount::from(7u32));
        assert_eq!(amt("-42"), Amount::from(-42i32));
        assert_eq!(amt("  9  "), Amount::from(9u32));
    }

    #[test]
    fn test_parse_truncates_fraction() {
        assert_eq!(amt("12.99"), Amount::from(12u32));
        assert_eq!(amt(".5"), Amount::zero());
        assert_eq!(amt("-3.7"), Amount::from(-3i32));
    }

    #[test]
    fn test_parse_exponent() {
        assert_eq!(amt("1.5e3"), Amount::from(1500u32));
        assert_eq!(amt("25e-1"), Amount::from(2u32));
        assert_eq!(amt("1e-30"), Amount::zero());
        assert_eq!(amt("1e200000"), Amount::Infinite);
        assert_eq!(amt("0e200000"), Amount::zero());
    }

    #[test]
    fn test_parse_infinity() {
        assert_eq!(amt("Infinity"), Amount::Infinite);
        assert_eq!(amt("inf"), Amount::Infinite);
        assert!("-Infinity".parse::<Amount>().is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("".parse::<Amount>(), Err(AmountParseError::Empty));
        assert!("abc".parse::<Amount>().is_err());
        assert!("1.2.3".parse::<Amount>().is_err());
        assert!("1e".parse::<Amount>().is_err());
        assert!(".".parse::<Amount>().is_err());
    }

    #[test]
    fn test_parse_scaled() {
        assert_eq!(Amount::parse_scaled("1.5", 2).unwrap(), Amount::from(150u32));
        assert_eq!(Amount::parse_scaled("0.001", 2).unwrap(), Amount::zero());
    }

    #[test]
    fn test_ordering_with_infinity() {
        assert!(Amount::Infinite > amt("999999999999999999999999999"));
        assert!(amt("-1") < Amount::zero());
        assert_eq!(Amount::Infinite.cmp(&Amount::Infinite), Ordering::Equal);
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(&amt("5") + &amt("7"), amt("12"));
        assert_eq!(&amt("5") - &amt("7"), amt("-2"));
        assert_eq!(&amt("5") * &amt("7"), amt("35"));
        assert_eq!(&Amount::Infinite + &amt("-5"), Amount::Infinite);
        assert_eq!(&Amount::Infinite - &Amount::Infinite, Amount::zero());
        assert_eq!(&Amount::Infinite * &Amount::zero(), Amount::zero());
        assert_eq!(&amt("3") * &Amount::Infinite, Amount::Infinite);
    }

    #[test]
    fn test_clamp_non_negative() {
        assert_eq!(amt("-10").clamp_non_negative(), Amount::zero());
        assert_eq!(amt("10").clamp_non_negative(), amt("10"));
    }

    #[test]
    fn test_factor_scaling() {
        assert_eq!(Factor::from(3u32).to_scaled(2), amt("300"));
        assert_eq!(Factor::from(1.25).to_scaled(2), amt("125"));
        assert_eq!(Factor::from(f64::NAN).to_scaled(18), Amount::zero());
        assert_eq!(Factor::from(f64::INFINITY).to_scaled(18), Amount::Infinite);
    }

    proptest! {
        #[test]
        fn prop_canonical_round_trip(n in any::<u128>()) {
            let value = Amount::from(n);
            prop_assert_eq!(value.to_canonical().parse::<Amount>().unwrap(), value);
        }

        #[test]
        fn prop_long_digit_strings_round_trip(digits in "[1-9][0-9]{0,80}") {
            let value: Amount = digits.parse().unwrap();
            prop_assert_eq!(value.to_canonical(), digits);
        }
    }
}
