use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::money::{mul_div_round, Currency};
use crate::KernelError;

/// Nisab quantity for the gold basis, in milligrams (87.48 g by convention).
pub const NISAB_GOLD_MILLIGRAMS: i64 = 87_480;

/// Nisab quantity for the silver basis, in milligrams (612.36 g by convention).
pub const NISAB_SILVER_MILLIGRAMS: i64 = 612_360;

/// A quote older than this is still usable but is flagged as stale.
pub const QUOTE_FRESHNESS_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Commodity {
    Gold,
    Silver,
}

impl Commodity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gold => "gold",
            Self::Silver => "silver",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gold" => Some(Self::Gold),
            "silver" => Some(Self::Silver),
            _ => None,
        }
    }

    #[must_use]
    pub fn nisab_milligrams(self) -> i64 {
        match self {
            Self::Gold => NISAB_GOLD_MILLIGRAMS,
            Self::Silver => NISAB_SILVER_MILLIGRAMS,
        }
    }
}

impl Display for Commodity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which reference the obligation threshold is derived from.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum ThresholdBasis {
    Gold,
    Silver,
    /// The lower of the two commodity thresholds.
    LowerOfGoldAndSilver,
    /// A fixed configured value; no price lookup is performed.
    Custom { value_minor: i64, currency: Currency },
}

impl ThresholdBasis {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gold => "gold",
            Self::Silver => "silver",
            Self::LowerOfGoldAndSilver => "lower_of_gold_and_silver",
            Self::Custom { .. } => "custom",
        }
    }
}

/// Most recent cached unit price for one commodity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PriceQuote {
    pub commodity: Commodity,
    /// Minor units of `currency` per gram.
    pub price_minor_per_gram: i64,
    pub currency: Currency,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

impl PriceQuote {
    /// # Errors
    /// Returns [`KernelError::Validation`] for a non-positive unit price.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.price_minor_per_gram <= 0 {
            return Err(KernelError::Validation(format!(
                "{} quote MUST have a positive price per gram, got {}",
                self.commodity, self.price_minor_per_gram
            )));
        }
        Ok(())
    }

    fn is_stale(&self, as_of: OffsetDateTime) -> bool {
        as_of - self.as_of > Duration::hours(QUOTE_FRESHNESS_HOURS)
    }

    fn threshold_minor(&self) -> i64 {
        mul_div_round(self.price_minor_per_gram, self.commodity.nisab_milligrams(), 1_000)
    }
}

/// The cached quotes available to one threshold computation. Either side may
/// be absent; whether that is fatal depends on the requested basis.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotePair {
    pub gold: Option<PriceQuote>,
    pub silver: Option<PriceQuote>,
}

impl QuotePair {
    fn quote(&self, commodity: Commodity) -> Result<&PriceQuote, KernelError> {
        let quote = match commodity {
            Commodity::Gold => self.gold.as_ref(),
            Commodity::Silver => self.silver.as_ref(),
        };
        quote.ok_or(KernelError::PriceUnavailable { commodity })
    }
}

/// A computed obligation threshold in the user's currency.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Threshold {
    pub value_minor: i64,
    pub currency: Currency,
    pub basis: ThresholdBasis,
    /// True when any quote used was past its freshness window. The cached
    /// value is still used; staleness is surfaced, never hidden.
    pub stale: bool,
}

/// Compute the obligation threshold for a basis from cached quotes.
///
/// A missing required quote is fatal ([`KernelError::PriceUnavailable`]); the
/// threshold never silently degrades to zero. Quotes past the freshness
/// window are used with `stale = true`.
///
/// # Errors
/// Returns [`KernelError::PriceUnavailable`] when a required quote is absent,
/// or [`KernelError::Validation`] for malformed or mixed-currency quotes.
pub fn compute_threshold(
    basis: &ThresholdBasis,
    quotes: &QuotePair,
    as_of: OffsetDateTime,
) -> Result<Threshold, KernelError> {
    match basis {
        ThresholdBasis::Custom { value_minor, currency } => {
            if *value_minor <= 0 {
                return Err(KernelError::Validation(format!(
                    "custom threshold MUST be positive, got {value_minor}"
                )));
            }
            Ok(Threshold {
                value_minor: *value_minor,
                currency: currency.clone(),
                basis: basis.clone(),
                stale: false,
            })
        }
        ThresholdBasis::Gold => single_commodity_threshold(basis, quotes, Commodity::Gold, as_of),
        ThresholdBasis::Silver => {
            single_commodity_threshold(basis, quotes, Commodity::Silver, as_of)
        }
        ThresholdBasis::LowerOfGoldAndSilver => {
            let gold = quotes.quote(Commodity::Gold)?;
            let silver = quotes.quote(Commodity::Silver)?;
            gold.validate()?;
            silver.validate()?;
            if gold.currency != silver.currency {
                return Err(KernelError::Validation(format!(
                    "gold quote is in {} but silver quote is in {}; thresholds require one currency",
                    gold.currency, silver.currency
                )));
            }

            let lower = if gold.threshold_minor() <= silver.threshold_minor() { gold } else { silver };
            Ok(Threshold {
                value_minor: lower.threshold_minor(),
                currency: lower.currency.clone(),
                basis: basis.clone(),
                stale: gold.is_stale(as_of) || silver.is_stale(as_of),
            })
        }
    }
}

fn single_commodity_threshold(
    basis: &ThresholdBasis,
    quotes: &QuotePair,
    commodity: Commodity,
    as_of: OffsetDateTime,
) -> Result<Threshold, KernelError> {
    let quote = quotes.quote(commodity)?;
    quote.validate()?;
    Ok(Threshold {
        value_minor: quote.threshold_minor(),
        currency: quote.currency.clone(),
        basis: basis.clone(),
        stale: quote.is_stale(as_of),
    })
}
