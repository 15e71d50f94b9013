use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::expense::ApprovalMode;
use crate::domain::tenant::{CompanyId, UserId};
use crate::errors::DomainError;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant-scoped routing policy. Rules are never physically deleted while expenses may
/// reference them; `is_active = false` is the delete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRule {
    pub id: RuleId,
    pub company_id: CompanyId,
    pub name: String,
    pub threshold_percent: Option<u8>,
    pub required_approver_ids: Option<Vec<UserId>>,
    pub is_sequential: bool,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub category_filters: Option<Vec<String>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalRule {
    /// Inclusive on both bounds; an absent bound is unbounded on that side.
    pub fn covers_amount(&self, converted_amount: Decimal) -> bool {
        let above_floor = self.min_amount.map_or(true, |min| min <= converted_amount);
        let below_ceiling = self.max_amount.map_or(true, |max| max >= converted_amount);
        above_floor && below_ceiling
    }

    pub fn covers_category(&self, category: &str) -> bool {
        let Some(filters) = &self.category_filters else {
            return true;
        };
        let category = normalize_category(category);
        filters.iter().any(|filter| normalize_category(filter) == category)
    }

    pub fn explicit_approvers(&self) -> Option<&[UserId]> {
        self.required_approver_ids.as_deref().filter(|ids| !ids.is_empty())
    }

    /// The sequencing snapshot an expense keeps for its whole life. A threshold is always
    /// evaluated in parallel, whatever `is_sequential` says.
    pub fn approval_mode(&self) -> ApprovalMode {
        match self.threshold_percent {
            Some(percent) => ApprovalMode::Threshold { percent },
            None if self.is_sequential => ApprovalMode::Sequential,
            None => ApprovalMode::Parallel,
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::InvalidRule("rule name must not be empty".to_string()));
        }

        if let Some(percent) = self.threshold_percent {
            if percent > 100 {
                return Err(DomainError::InvalidRule(format!(
                    "threshold_percent must be in range 0..=100, got {percent}"
                )));
            }
        }

        for (label, bound) in [("min_amount", self.min_amount), ("max_amount", self.max_amount)] {
            if let Some(value) = bound {
                if value.is_sign_negative() {
                    return Err(DomainError::InvalidRule(format!(
                        "{label} must not be negative, got {value}"
                    )));
                }
            }
        }

        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err(DomainError::InvalidRule(format!(
                    "min_amount {min} is greater than max_amount {max}"
                )));
            }
        }

        if let Some(filters) = &self.category_filters {
            if filters.iter().any(|filter| filter.trim().is_empty()) {
                return Err(DomainError::InvalidRule(
                    "category_filters must not contain blank entries".to_string(),
                ));
            }
        }

        if let Some(ids) = &self.required_approver_ids {
            if ids.iter().any(|id| id.0.trim().is_empty()) {
                return Err(DomainError::InvalidRule(
                    "required_approver_ids must not contain blank ids".to_string(),
                ));
            }
        }

        Ok(())
    }
}

pub fn normalize_category(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::{ApprovalRule, RuleId};
    use crate::domain::expense::ApprovalMode;
    use crate::domain::tenant::{CompanyId, UserId};
    use crate::errors::DomainError;

    fn rule() -> ApprovalRule {
        let now = Utc::now();
        ApprovalRule {
            id: RuleId("rule-1".to_string()),
            company_id: CompanyId("acme".to_string()),
            name: "Travel over 1k".to_string(),
            threshold_percent: None,
            required_approver_ids: None,
            is_sequential: false,
            min_amount: Some(Decimal::new(1_000, 0)),
            max_amount: Some(Decimal::new(5_000, 0)),
            category_filters: Some(vec!["Travel".to_string()]),
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn amount_bounds_are_inclusive() {
        let rule = rule();
        assert!(rule.covers_amount(Decimal::new(1_000, 0)));
        assert!(rule.covers_amount(Decimal::new(5_000, 0)));
        assert!(!rule.covers_amount(Decimal::new(99_999, 2)));
        assert!(!rule.covers_amount(Decimal::new(500_001, 2)));
    }

    #[test]
    fn missing_bounds_are_unbounded() {
        let mut rule = rule();
        rule.min_amount = None;
        rule.max_amount = None;
        assert!(rule.covers_amount(Decimal::ZERO));
        assert!(rule.covers_amount(Decimal::new(1_000_000_000, 0)));
    }

    #[test]
    fn category_filter_ignores_case_and_padding() {
        let mut rule = rule();
        assert!(rule.covers_category(" travel "));
        assert!(!rule.covers_category("meals"));

        rule.category_filters = None;
        assert!(rule.covers_category("meals"));
    }

    #[test]
    fn threshold_wins_over_sequential_flag() {
        let mut rule = rule();
        rule.is_sequential = true;
        assert_eq!(rule.approval_mode(), ApprovalMode::Sequential);

        rule.threshold_percent = Some(60);
        assert_eq!(rule.approval_mode(), ApprovalMode::Threshold { percent: 60 });
    }

    #[test]
    fn empty_required_list_is_not_an_explicit_pool() {
        let mut rule = rule();
        rule.required_approver_ids = Some(Vec::new());
        assert!(rule.explicit_approvers().is_none());

        rule.required_approver_ids = Some(vec![UserId("u-a".to_string())]);
        assert_eq!(rule.explicit_approvers().map(<[UserId]>::len), Some(1));
    }

    #[test]
    fn validate_rejects_inverted_bounds_and_bad_threshold() {
        let mut inverted = rule();
        inverted.min_amount = Some(Decimal::new(10, 0));
        inverted.max_amount = Some(Decimal::new(5, 0));
        assert!(matches!(inverted.validate(), Err(DomainError::InvalidRule(_))));

        let mut threshold = rule();
        threshold.threshold_percent = Some(101);
        assert!(matches!(threshold.validate(), Err(DomainError::InvalidRule(_))));

        let mut blank = rule();
        blank.category_filters = Some(vec!["  ".to_string()]);
        assert!(matches!(blank.validate(), Err(DomainError::InvalidRule(_))));

        assert_eq!(rule().validate(), Ok(()));
    }
}
