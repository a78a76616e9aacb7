use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::modifier::ItemCategory;
use crate::money::BASIS_POINT_SCALE;
use crate::threshold::ThresholdBasis;
use crate::KernelError;

/// Default obligation rate, in basis points (2.5%).
pub const DEFAULT_RATE_BASIS_POINTS: u32 = 250;

/// Per-category treatment inside a methodology's rule table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryRule {
    pub included: bool,
    /// Optional proportional adjustment in basis points, applied after the
    /// item's own modifier. `None` means no adjustment (100%).
    pub adjustment_bp: Option<u32>,
}

impl CategoryRule {
    #[must_use]
    pub fn included() -> Self {
        Self { included: true, adjustment_bp: None }
    }

    #[must_use]
    pub fn excluded() -> Self {
        Self { included: false, adjustment_bp: None }
    }

    #[must_use]
    pub fn adjusted(adjustment_bp: u32) -> Self {
        Self { included: true, adjustment_bp: Some(adjustment_bp) }
    }
}

/// A complete calculation strategy: threshold basis, obligation rate, and the
/// per-category rule table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MethodologyConfig {
    pub name: String,
    pub basis: ThresholdBasis,
    pub rate_bp: u32,
    pub rules: BTreeMap<ItemCategory, CategoryRule>,
    pub deduct_liabilities: bool,
}

impl MethodologyConfig {
    /// The effective rule for a category. Categories absent from the table
    /// are included without adjustment.
    #[must_use]
    pub fn rule(&self, category: ItemCategory) -> CategoryRule {
        self.rules.get(&category).copied().unwrap_or_else(CategoryRule::included)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty name, a rate outside
    /// `1..=10_000` bp, or an adjustment above 10_000 bp.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.name.trim().is_empty() {
            return Err(KernelError::Validation(
                "methodology name MUST be non-empty".to_owned(),
            ));
        }
        let scale = u32::try_from(BASIS_POINT_SCALE).unwrap_or(u32::MAX);
        if self.rate_bp == 0 || self.rate_bp > scale {
            return Err(KernelError::Validation(format!(
                "obligation rate MUST be 1..={scale} bp, got {}",
                self.rate_bp
            )));
        }
        for (category, rule) in &self.rules {
            if let Some(adjustment) = rule.adjustment_bp {
                if adjustment > scale {
                    return Err(KernelError::Validation(format!(
                        "adjustment for `{}` MUST be <= {scale} bp, got {adjustment}",
                        category.as_str()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The closed set of calculation strategies. The four built-ins carry fixed,
/// immutable configurations; `Custom` holds a user-supplied rule table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "methodology", rename_all = "snake_case")]
pub enum Methodology {
    Hanafi,
    Shafii,
    Maliki,
    Hanbali,
    Custom(MethodologyConfig),
}

impl Methodology {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hanafi => "hanafi",
            Self::Shafii => "shafii",
            Self::Maliki => "maliki",
            Self::Hanbali => "hanbali",
            Self::Custom(_) => "custom",
        }
    }

    /// Parse a built-in methodology name. `custom` is not parseable here
    /// because it needs its stored configuration.
    #[must_use]
    pub fn parse_builtin(value: &str) -> Option<Self> {
        match value {
            "hanafi" => Some(Self::Hanafi),
            "shafii" => Some(Self::Shafii),
            "maliki" => Some(Self::Maliki),
            "hanbali" => Some(Self::Hanbali),
            _ => None,
        }
    }

    /// The effective configuration for this methodology.
    ///
    /// The built-in tables agree on the liquid categories and differ on the
    /// treatment of trade inventory and real property; Hanafi alone derives
    /// its threshold from the silver basis (the lower of the two in
    /// practice) and deducts liabilities most broadly.
    #[must_use]
    pub fn config(&self) -> MethodologyConfig {
        match self {
            Self::Hanafi => builtin(
                "hanafi",
                ThresholdBasis::Silver,
                true,
                [
                    (ItemCategory::Property, CategoryRule::excluded()),
                    (ItemCategory::BusinessInventory, CategoryRule::included()),
                ],
            ),
            Self::Shafii => builtin(
                "shafii",
                ThresholdBasis::Gold,
                false,
                [
                    (ItemCategory::Property, CategoryRule::excluded()),
                    (ItemCategory::BusinessInventory, CategoryRule::included()),
                ],
            ),
            Self::Maliki => builtin(
                "maliki",
                ThresholdBasis::Gold,
                true,
                [
                    (ItemCategory::Property, CategoryRule::excluded()),
                    (ItemCategory::BusinessInventory, CategoryRule::adjusted(5_000)),
                ],
            ),
            Self::Hanbali => builtin(
                "hanbali",
                ThresholdBasis::Gold,
                true,
                [
                    (ItemCategory::Property, CategoryRule::adjusted(2_500)),
                    (ItemCategory::BusinessInventory, CategoryRule::included()),
                ],
            ),
            Self::Custom(config) => config.clone(),
        }
    }
}

fn builtin<const N: usize>(
    name: &str,
    basis: ThresholdBasis,
    deduct_liabilities: bool,
    overrides: [(ItemCategory, CategoryRule); N],
) -> MethodologyConfig {
    let mut rules = BTreeMap::new();
    for category in [
        ItemCategory::Cash,
        ItemCategory::PreciousMetal,
        ItemCategory::Security,
        ItemCategory::RetirementAccount,
        ItemCategory::BusinessInventory,
        ItemCategory::Property,
        ItemCategory::Other,
    ] {
        rules.insert(category, CategoryRule::included());
    }
    for (category, rule) in overrides {
        rules.insert(category, rule);
    }
    MethodologyConfig {
        name: name.to_owned(),
        basis,
        rate_bp: DEFAULT_RATE_BASIS_POINTS,
        rules,
        deduct_liabilities,
    }
}
