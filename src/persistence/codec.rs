//! Value codec
//!
//! Canonical persisted strings for balances and multipliers. Decoding is
//! tolerant: absent or malformed input yields the safe default (zero for
//! balances, the unit multiplier for multipliers) instead of an error.
//!
//! Multipliers are stored as fixed-point integers scaled by `10^18` and
//! tagged with [`MULTIPLIER_TAG`], so a scaled payload can never be read back
//! as a plain integer multiplier or vice versa.

use num_traits::Signed;

use crate::amount::{Amount, Factor};

/// Decimal places kept by the fixed-point multiplier encoding
pub const MULTIPLIER_SCALE: u32 = 18;

/// Prefix marking a scaled fixed-point multiplier payload
pub const MULTIPLIER_TAG: &str = "fx18:";

/// Encode a balance. Negative input is clamped to zero first.
pub fn encode_amount(value: &Amount) -> String {
    value.clone().clamp_non_negative().to_canonical()
}

/// Decode a balance, falling back to zero
pub fn decode_amount(raw: Option<&str>) -> Amount {
    let Some(raw) = raw else {
        return Amount::zero();
    };
    // Some older writers stored JSON-quoted strings
    let text = raw.trim().trim_matches('"');
    match text.parse::<Amount>() {
        Ok(value) if !value.is_negative() => value,
        _ => Amount::zero(),
    }
}

/// The scaled representation of 1.0
pub fn unit_multiplier() -> Amount {
    Amount::pow10(MULTIPLIER_SCALE)
}

/// Encode a scaled multiplier with its tag
pub fn encode_multiplier(scaled: &Amount) -> String {
    format!("{MULTIPLIER_TAG}{}", scaled.to_canonical())
}

/// Decode a multiplier into its scaled form.
///
/// Tagged payloads are read as already-scaled integers; untagged payloads are
/// plain (possibly decimal) multipliers and get scaled here. Anything that
/// fails to parse, is negative or floors to zero decodes as the unit.
pub fn decode_multiplier(raw: Option<&str>) -> Amount {
    let Some(raw) = raw.map(str::trim) else {
        return unit_multiplier();
    };
    let parsed = match raw.strip_prefix(MULTIPLIER_TAG) {
        Some(payload) => Amount::parse_scaled(payload, 0),
        None => Amount::parse_scaled(raw.trim_matches('"'), MULTIPLIER_SCALE),
    };
    match parsed {
        Ok(scaled) => normalize_multiplier(scaled),
        Err(_) => unit_multiplier(),
    }
}

/// Floor a scaled multiplier to its externally visible whole value
pub fn whole_multiplier(scaled: &Amount) -> Amount {
    match unit_multiplier().as_finite() {
        Some(unit) => scaled.div_floor(unit),
        None => Amount::Infinite,
    }
}

/// Scale a whole multiplier into fixed point
pub fn scale_multiplier(whole: &Amount) -> Amount {
    whole * &unit_multiplier()
}

/// Reset a scaled multiplier to the unit if its whole part is not positive
pub fn normalize_multiplier(scaled: Amount) -> Amount {
    let whole = whole_multiplier(&scaled);
    let positive = match &whole {
        Amount::Finite(n) => n.is_positive(),
        Amount::Infinite => true,
    };
    if positive { scaled } else { unit_multiplier() }
}

/// Multiply a scaled multiplier by `factor`, keeping 18 decimal places
pub fn multiply_scaled(scaled: &Amount, factor: &Factor) -> Amount {
    let factor = factor.to_scaled(MULTIPLIER_SCALE);
    let product = match (scaled, &factor, unit_multiplier()) {
        (Amount::Finite(a), Amount::Finite(b), Amount::Finite(unit)) => Amount::Finite(a * b / unit),
        _ => scaled * &factor,
    };
    normalize_multiplier(product)
}
