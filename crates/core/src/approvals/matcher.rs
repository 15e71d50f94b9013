use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::rule::ApprovalRule;
use crate::domain::tenant::CompanyId;

/// Outcome of rule selection: either a tenant rule or the built-in fallback of routing to
/// the tenant's first manager-approver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchedPolicy {
    Rule(ApprovalRule),
    Default,
}

impl MatchedPolicy {
    pub fn rule(&self) -> Option<&ApprovalRule> {
        match self {
            Self::Rule(rule) => Some(rule),
            Self::Default => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RuleMatcher;

impl RuleMatcher {
    /// Picks the applicable rule among `rules`. Rules from other tenants and inactive rules
    /// are ignored even if the caller passes them in. The highest amount floor wins; a
    /// missing floor sorts below every concrete floor.
    pub fn match_rule(
        &self,
        rules: &[ApprovalRule],
        company_id: &CompanyId,
        converted_amount: Decimal,
        category: &str,
    ) -> MatchedPolicy {
        let mut candidates: Vec<&ApprovalRule> = rules
            .iter()
            .filter(|rule| &rule.company_id == company_id && rule.is_active)
            .filter(|rule| rule.covers_amount(converted_amount))
            .filter(|rule| rule.covers_category(category))
            .collect();

        candidates.sort_by(|left, right| {
            right.min_amount.cmp(&left.min_amount).then_with(|| left.id.cmp(&right.id))
        });

        candidates
            .into_iter()
            .next()
            .map_or(MatchedPolicy::Default, |rule| MatchedPolicy::Rule(rule.clone()))
    }
}
