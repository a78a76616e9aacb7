use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod aggregate;
pub mod calendar;
pub mod cycle;
pub mod lifecycle;
pub mod methodology;
pub mod modifier;
pub mod money;
pub mod threshold;

pub use aggregate::{
    aggregate_wealth, Deduction, InclusionReason, Item, ItemBreakdown, WealthSummary,
};
pub use calendar::HijriDate;
pub use cycle::{evaluate_cycle, CycleEvent, CycleRecord};
pub use lifecycle::{
    apply_edit, finalize, refinalize, unlock, AuditEntry, AuditEventKind, RecordEdit,
    RecordStatus, MIN_JUSTIFICATION_CHARS,
};
pub use methodology::{
    CategoryRule, Methodology, MethodologyConfig, DEFAULT_RATE_BASIS_POINTS,
};
pub use modifier::{resolve_modifier, suggested_flags, ItemCategory, Modifier};
pub use money::{apply_basis_points, mul_div_round, Currency, ExchangeRates};
pub use threshold::{
    compute_threshold, Commodity, PriceQuote, QuotePair, Threshold, ThresholdBasis,
    NISAB_GOLD_MILLIGRAMS, NISAB_SILVER_MILLIGRAMS, QUOTE_FRESHNESS_HOURS,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum KernelError {
    #[error("no price quote is available for {commodity}; threshold cannot be computed")]
    PriceUnavailable { commodity: threshold::Commodity },
    #[error("invalid transition: record is {from}, requested {requested}")]
    InvalidTransition {
        from: lifecycle::RecordStatus,
        requested: lifecycle::RecordStatus,
    },
    #[error("record is {status} and cannot be mutated or deleted")]
    RecordLocked { status: lifecycle::RecordStatus },
    #[error("unlock justification has {actual} characters; at least {minimum} are required")]
    JustificationTooShort { minimum: usize, actual: usize },
    #[error("cycle completes at {scheduled_completion}; finalize requires the completion date or an explicit premature acknowledgement")]
    NotReady {
        scheduled_completion: time::OffsetDateTime,
    },
    #[error("invalid modifier combination: {0}")]
    InvalidModifierCombination(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("calendar error: {0}")]
    Calendar(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemId(pub Ulid);

impl ItemId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeductionId(pub Ulid);

impl DeductionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for DeductionId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DeductionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuditEntryId(pub Ulid);

impl AuditEntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AuditEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AuditEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
