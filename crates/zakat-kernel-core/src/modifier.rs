use serde::{Deserialize, Serialize};

use crate::KernelError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ItemCategory {
    Cash,
    PreciousMetal,
    Security,
    RetirementAccount,
    BusinessInventory,
    Property,
    Other,
}

impl ItemCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::PreciousMetal => "precious-metal",
            Self::Security => "security",
            Self::RetirementAccount => "retirement-account",
            Self::BusinessInventory => "business-inventory",
            Self::Property => "property",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cash" => Some(Self::Cash),
            "precious-metal" => Some(Self::PreciousMetal),
            "security" => Some(Self::Security),
            "retirement-account" => Some(Self::RetirementAccount),
            "business-inventory" => Some(Self::BusinessInventory),
            "property" => Some(Self::Property),
            "other" => Some(Self::Other),
            _ => None,
        }
    }

    /// The passive-holding flag is only meaningful for tradable securities.
    #[must_use]
    pub fn supports_passive_flag(self) -> bool {
        matches!(self, Self::Security)
    }

    /// The restricted-access flag is only meaningful for accounts with a
    /// withdrawal penalty.
    #[must_use]
    pub fn supports_restricted_flag(self) -> bool {
        matches!(self, Self::RetirementAccount)
    }
}

/// Valuation multiplier applied before aggregation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Restricted,
    Passive,
    Full,
}

impl Modifier {
    #[must_use]
    pub fn basis_points(self) -> u32 {
        match self {
            Self::Restricted => 0,
            Self::Passive => 3_000,
            Self::Full => 10_000,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::Passive => "passive",
            Self::Full => "full",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "restricted" => Some(Self::Restricted),
            "passive" => Some(Self::Passive),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Derive the valuation modifier from an item's category and flags.
///
/// Restricted access always wins: when both flags are set the item values at
/// zero regardless of category. A single flag on a category that does not
/// present that flag is rejected before it can reach persistence.
///
/// # Errors
/// Returns [`KernelError::InvalidModifierCombination`] for a flag that the
/// category does not support.
pub fn resolve_modifier(
    category: ItemCategory,
    is_passive_holding: bool,
    is_restricted_access: bool,
) -> Result<Modifier, KernelError> {
    if is_passive_holding && is_restricted_access {
        return Ok(Modifier::Restricted);
    }

    if is_restricted_access {
        if !category.supports_restricted_flag() {
            return Err(KernelError::InvalidModifierCombination(format!(
                "restricted-access flag is not applicable to category `{}`",
                category.as_str()
            )));
        }
        return Ok(Modifier::Restricted);
    }

    if is_passive_holding {
        if !category.supports_passive_flag() {
            return Err(KernelError::InvalidModifierCombination(format!(
                "passive-holding flag is not applicable to category `{}`",
                category.as_str()
            )));
        }
        return Ok(Modifier::Passive);
    }

    Ok(Modifier::Full)
}

/// Suggested default flags for a newly created item of a category.
///
/// A pure function of the category alone; the suggestion is always
/// user-overridable and no behavioural history is consulted.
#[must_use]
pub fn suggested_flags(category: ItemCategory) -> (bool, bool) {
    match category {
        ItemCategory::RetirementAccount => (false, true),
        _ => (false, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CATEGORIES: [ItemCategory; 7] = [
        ItemCategory::Cash,
        ItemCategory::PreciousMetal,
        ItemCategory::Security,
        ItemCategory::RetirementAccount,
        ItemCategory::BusinessInventory,
        ItemCategory::Property,
        ItemCategory::Other,
    ];

    #[test]
    fn restricted_precedence_holds_for_every_category() {
        for category in ALL_CATEGORIES {
            assert_eq!(
                resolve_modifier(category, true, true),
                Ok(Modifier::Restricted),
                "restricted precedence failed for {}",
                category.as_str()
            );
        }
    }

    #[test]
    fn passive_security_values_at_thirty_percent() {
        let modifier = match resolve_modifier(ItemCategory::Security, true, false) {
            Ok(value) => value,
            Err(err) => panic!("passive security should resolve: {err}"),
        };
        assert_eq!(modifier.basis_points(), 3_000);
    }

    #[test]
    fn restricted_retirement_account_values_at_zero() {
        let modifier = match resolve_modifier(ItemCategory::RetirementAccount, false, true) {
            Ok(value) => value,
            Err(err) => panic!("restricted retirement account should resolve: {err}"),
        };
        assert_eq!(modifier.basis_points(), 0);
    }

    #[test]
    fn unflagged_items_value_in_full() {
        for category in ALL_CATEGORIES {
            assert_eq!(resolve_modifier(category, false, false), Ok(Modifier::Full));
        }
    }

    #[test]
    fn passive_flag_is_rejected_outside_securities() {
        for category in ALL_CATEGORIES {
            if category.supports_passive_flag() {
                continue;
            }
            assert!(
                matches!(
                    resolve_modifier(category, true, false),
                    Err(KernelError::InvalidModifierCombination(_))
                ),
                "passive flag should be rejected for {}",
                category.as_str()
            );
        }
    }

    #[test]
    fn restricted_flag_is_rejected_outside_penalized_accounts() {
        for category in ALL_CATEGORIES {
            if category.supports_restricted_flag() {
                continue;
            }
            assert!(
                matches!(
                    resolve_modifier(category, false, true),
                    Err(KernelError::InvalidModifierCombination(_))
                ),
                "restricted flag should be rejected for {}",
                category.as_str()
            );
        }
    }

    #[test]
    fn suggested_defaults_depend_on_category_alone() {
        assert_eq!(suggested_flags(ItemCategory::RetirementAccount), (false, true));
        assert_eq!(suggested_flags(ItemCategory::Security), (false, false));
        assert_eq!(suggested_flags(ItemCategory::Cash), (false, false));
    }

    #[test]
    fn category_string_round_trip() {
        for category in ALL_CATEGORIES {
            assert_eq!(ItemCategory::parse(category.as_str()), Some(category));
        }
        assert_eq!(ItemCategory::parse("unknown"), None);
    }
}
