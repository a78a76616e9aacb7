use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::methodology::MethodologyConfig;
use crate::modifier::{resolve_modifier, ItemCategory, Modifier};
use crate::money::{apply_basis_points, Currency, ExchangeRates};
use crate::{DeductionId, ItemId, KernelError};

/// An owned valuable thing belonging to one user.
///
/// Items referenced by a finalized record are soft-deactivated rather than
/// deleted, so historical aggregates stay reproducible.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Item {
    pub item_id: ItemId,
    pub user_id: String,
    pub category: ItemCategory,
    pub value_minor: i64,
    pub currency: Currency,
    #[serde(with = "time::serde::rfc3339")]
    pub acquired_at: OffsetDateTime,
    pub is_passive_holding: bool,
    pub is_restricted_access: bool,
    pub active: bool,
}

impl Item {
    /// # Errors
    /// Returns [`KernelError::Validation`] for a negative value or empty
    /// owner, or [`KernelError::InvalidModifierCombination`] when a flag is
    /// set on a category that does not present it.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.user_id.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "item {} MUST have an owner",
                self.item_id
            )));
        }
        if self.value_minor < 0 {
            return Err(KernelError::Validation(format!(
                "item {} value MUST be non-negative, got {}",
                self.item_id, self.value_minor
            )));
        }
        resolve_modifier(self.category, self.is_passive_holding, self.is_restricted_access)?;
        Ok(())
    }
}

/// A qualifying liability subtracted from the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Deduction {
    pub deduction_id: DeductionId,
    pub user_id: String,
    pub label: String,
    pub amount_minor: i64,
    pub currency: Currency,
    pub eligible: bool,
}

impl Deduction {
    /// # Errors
    /// Returns [`KernelError::Validation`] for an empty label or a negative amount.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.label.trim().is_empty() {
            return Err(KernelError::Validation(format!(
                "deduction {} MUST have a label",
                self.deduction_id
            )));
        }
        if self.amount_minor < 0 {
            return Err(KernelError::Validation(format!(
                "deduction {} amount MUST be non-negative, got {}",
                self.deduction_id, self.amount_minor
            )));
        }
        Ok(())
    }
}

/// Why a breakdown row did or did not contribute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum InclusionReason {
    Included,
    Inactive,
    CategoryExcluded,
    AcquiredAfterSample,
}

/// One explainable row per item, contributing or not.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemBreakdown {
    pub item_id: ItemId,
    pub category: ItemCategory,
    pub value_minor: i64,
    pub currency: Currency,
    /// Item value converted into the base currency, before any factor.
    pub converted_minor: i64,
    pub modifier: Modifier,
    pub adjustment_bp: Option<u32>,
    pub contribution_minor: i64,
    pub reason: InclusionReason,
}

/// The aggregate wealth picture for one user at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WealthSummary {
    /// Gross sum of contributions before deductions.
    pub total_minor: i64,
    /// `max(total - deductions, 0)`, the amount compared to the threshold.
    pub zakatable_minor: i64,
    pub deductions_minor: i64,
    pub currency: Currency,
    pub breakdown: Vec<ItemBreakdown>,
}

/// Aggregate a user's items under a methodology's rule table.
///
/// Every item appears in the breakdown, contributing or not, with the reason
/// recorded. Integer minor-unit summation makes the result exactly
/// order-independent; the breakdown is sorted by item id so serialized
/// output is stable under input permutation.
///
/// # Errors
/// Returns [`KernelError::Validation`] for an invalid item or deduction, an
/// unknown currency, or an item owned by a different user than the rest.
pub fn aggregate_wealth(
    items: &[Item],
    deductions: &[Deduction],
    rates: &ExchangeRates,
    config: &MethodologyConfig,
    as_of: OffsetDateTime,
) -> Result<WealthSummary, KernelError> {
    config.validate()?;

    let mut breakdown = Vec::with_capacity(items.len());
    let mut total_minor: i64 = 0;

    for item in items {
        item.validate()?;
        let modifier =
            resolve_modifier(item.category, item.is_passive_holding, item.is_restricted_access)?;
        let rule = config.rule(item.category);
        let converted_minor = rates.convert_minor(item.value_minor, &item.currency)?;

        let reason = if !item.active {
            InclusionReason::Inactive
        } else if item.acquired_at > as_of {
            InclusionReason::AcquiredAfterSample
        } else if !rule.included {
            InclusionReason::CategoryExcluded
        } else {
            InclusionReason::Included
        };

        let contribution_minor = if reason == InclusionReason::Included {
            let modified = apply_basis_points(converted_minor, modifier.basis_points());
            match rule.adjustment_bp {
                Some(adjustment) => apply_basis_points(modified, adjustment),
                None => modified,
            }
        } else {
            0
        };

        total_minor = total_minor.saturating_add(contribution_minor);
        breakdown.push(ItemBreakdown {
            item_id: item.item_id,
            category: item.category,
            value_minor: item.value_minor,
            currency: item.currency.clone(),
            converted_minor,
            modifier,
            adjustment_bp: rule.adjustment_bp,
            contribution_minor,
            reason,
        });
    }

    breakdown.sort_by_key(|row| row.item_id);

    let mut deductions_minor: i64 = 0;
    if config.deduct_liabilities {
        for deduction in deductions {
            deduction.validate()?;
            if !deduction.eligible {
                continue;
            }
            let converted = rates.convert_minor(deduction.amount_minor, &deduction.currency)?;
            deductions_minor = deductions_minor.saturating_add(converted);
        }
    }

    Ok(WealthSummary {
        total_minor,
        zakatable_minor: (total_minor - deductions_minor).max(0),
        deductions_minor,
        currency: rates.base.clone(),
        breakdown,
    })
}
