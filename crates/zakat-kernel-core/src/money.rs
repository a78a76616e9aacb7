use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::KernelError;

/// Parts-per-million scale for exchange rates (1_000_000 = parity).
pub const RATE_SCALE_PPM: i64 = 1_000_000;

/// Basis-point scale for proportional factors (10_000 = 100%).
pub const BASIS_POINT_SCALE: i64 = 10_000;

/// ISO-4217 style uppercase three-letter currency code.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Currency(String);

impl Currency {
    /// Parse and normalize a currency code.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the code is not three ASCII letters.
    pub fn parse(code: &str) -> Result<Self, KernelError> {
        let trimmed = code.trim();
        if trimmed.len() != 3 || !trimmed.chars().all(|ch| ch.is_ascii_alphabetic()) {
            return Err(KernelError::Validation(format!(
                "currency code MUST be three ASCII letters, got `{code}`"
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversion table from item currencies into one base currency.
///
/// Rates are minor units of the base currency per minor unit of the foreign
/// currency, scaled by [`RATE_SCALE_PPM`]. The base currency always converts
/// at parity and needs no entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExchangeRates {
    pub base: Currency,
    pub rate_ppm: BTreeMap<Currency, i64>,
}

impl ExchangeRates {
    #[must_use]
    pub fn new(base: Currency) -> Self {
        Self { base, rate_ppm: BTreeMap::new() }
    }

    /// Register or replace the rate for one foreign currency.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] for a non-positive rate.
    pub fn set_rate(&mut self, currency: Currency, rate_ppm: i64) -> Result<(), KernelError> {
        if rate_ppm <= 0 {
            return Err(KernelError::Validation(format!(
                "exchange rate for {currency} MUST be positive, got {rate_ppm} ppm"
            )));
        }
        self.rate_ppm.insert(currency, rate_ppm);
        Ok(())
    }

    /// Convert an amount in minor units of `currency` into base minor units.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when no rate is registered for the currency.
    pub fn convert_minor(&self, amount_minor: i64, currency: &Currency) -> Result<i64, KernelError> {
        if *currency == self.base {
            return Ok(amount_minor);
        }

        let rate = self.rate_ppm.get(currency).copied().ok_or_else(|| {
            KernelError::Validation(format!(
                "no exchange rate registered for {currency} into {}",
                self.base
            ))
        })?;

        Ok(mul_div_round(amount_minor, rate, RATE_SCALE_PPM))
    }
}

/// `value * numerator / denominator` in `i128`, rounded half away from zero.
///
/// Used for every proportional step (rates, modifiers, adjustments) so results
/// never deviate from the exact value by more than half a minor unit.
#[must_use]
pub fn mul_div_round(value: i64, numerator: i64, denominator: i64) -> i64 {
    debug_assert!(denominator > 0);
    let scaled = i128::from(value) * i128::from(numerator);
    let denominator = i128::from(denominator);
    let half = denominator / 2;
    let rounded = if scaled >= 0 { (scaled + half) / denominator } else { (scaled - half) / denominator };
    i64::try_from(rounded).unwrap_or(i64::MAX)
}

/// Apply a basis-point factor to an amount in minor units.
#[must_use]
pub fn apply_basis_points(amount_minor: i64, basis_points: u32) -> i64 {
    mul_div_round(amount_minor, i64::from(basis_points), BASIS_POINT_SCALE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_parse_normalizes_case_and_rejects_garbage() {
        let parsed = match Currency::parse("usd") {
            Ok(currency) => currency,
            Err(err) => panic!("usd should parse: {err}"),
        };
        assert_eq!(parsed.as_str(), "USD");

        assert!(Currency::parse("US").is_err());
        assert!(Currency::parse("US1").is_err());
        assert!(Currency::parse("DOLLARS").is_err());
    }

    #[test]
    fn convert_minor_is_identity_for_base_currency() {
        let usd = match Currency::parse("USD") {
            Ok(currency) => currency,
            Err(err) => panic!("USD should parse: {err}"),
        };
        let rates = ExchangeRates::new(usd.clone());
        assert_eq!(rates.convert_minor(123_456, &usd), Ok(123_456));
    }

    #[test]
    fn convert_minor_applies_ppm_rate_with_rounding() {
        let usd = match Currency::parse("USD") {
            Ok(currency) => currency,
            Err(err) => panic!("USD should parse: {err}"),
        };
        let eur = match Currency::parse("EUR") {
            Ok(currency) => currency,
            Err(err) => panic!("EUR should parse: {err}"),
        };
        let mut rates = ExchangeRates::new(usd);
        if let Err(err) = rates.set_rate(eur.clone(), 1_085_000) {
            panic!("rate should register: {err}");
        }

        // 10.00 EUR at 1.085 -> 10.85 USD
        assert_eq!(rates.convert_minor(1_000, &eur), Ok(1_085));
        // 0.01 EUR -> 0.01085 USD, rounds to 0.01
        assert_eq!(rates.convert_minor(1, &eur), Ok(1));
    }

    #[test]
    fn convert_minor_rejects_unknown_currency() {
        let usd = match Currency::parse("USD") {
            Ok(currency) => currency,
            Err(err) => panic!("USD should parse: {err}"),
        };
        let gbp = match Currency::parse("GBP") {
            Ok(currency) => currency,
            Err(err) => panic!("GBP should parse: {err}"),
        };
        let rates = ExchangeRates::new(usd);
        assert!(rates.convert_minor(100, &gbp).is_err());
    }

    #[test]
    fn apply_basis_points_matches_expected_percentages() {
        assert_eq!(apply_basis_points(1_000_000, 10_000), 1_000_000);
        assert_eq!(apply_basis_points(1_000_000, 3_000), 300_000);
        assert_eq!(apply_basis_points(300_000, 250), 7_500);
        assert_eq!(apply_basis_points(1_000_000, 0), 0);
    }
}
