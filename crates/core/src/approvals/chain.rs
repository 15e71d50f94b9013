use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::matcher::MatchedPolicy;
use crate::domain::expense::{ApprovalMode, ApproverAssignment};
use crate::domain::rule::RuleId;
use crate::domain::tenant::{CompanyId, UserId};

/// Tenant membership facts the builder needs, fetched by the caller from the user directory.
/// `manager_approvers` order is significant: the default policy takes the first entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApproverRoster {
    pub manager_approvers: Vec<UserId>,
    pub members: HashSet<UserId>,
}

impl ApproverRoster {
    pub fn new(manager_approvers: Vec<UserId>, members: impl IntoIterator<Item = UserId>) -> Self {
        Self { manager_approvers, members: members.into_iter().collect() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltChain {
    pub assignments: Vec<ApproverAssignment>,
    pub mode: ApprovalMode,
    pub matched_rule_id: Option<RuleId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainError {
    #[error("rule `{rule_id}` lists approvers outside company `{company_id}`: {user_ids:?}")]
    UnknownApprovers { rule_id: RuleId, company_id: CompanyId, user_ids: Vec<UserId> },
    #[error("rule `{rule_id}` lists approver `{user_id}` more than once")]
    DuplicateApprover { rule_id: RuleId, user_id: UserId },
    #[error("company `{company_id}` has no manager-approvers to route to")]
    NoManagerApprovers { company_id: CompanyId },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChainBuilder;

impl ChainBuilder {
    /// Sequencing snapshot for a policy, available even when the chain cannot be built.
    pub fn mode_for(&self, policy: &MatchedPolicy) -> ApprovalMode {
        match policy {
            MatchedPolicy::Rule(rule) => rule.approval_mode(),
            MatchedPolicy::Default => ApprovalMode::Parallel,
        }
    }

    /// Expands a policy into ordered, undecided assignments. An approver that cannot be
    /// resolved fails the whole build: dropping it would quietly weaken the chain.
    pub fn build(
        &self,
        policy: &MatchedPolicy,
        company_id: &CompanyId,
        roster: &ApproverRoster,
    ) -> Result<BuiltChain, ChainError> {
        let mode = self.mode_for(policy);
        let matched_rule_id = policy.rule().map(|rule| rule.id.clone());

        let user_ids: Vec<UserId> = match policy.rule() {
            Some(rule) => {
                if let Some(explicit) = rule.explicit_approvers() {
                    validate_explicit(&rule.id, company_id, explicit, roster)?;
                    explicit.to_vec()
                } else if rule.threshold_percent.is_some() {
                    manager_pool(company_id, roster)?
                } else {
                    vec![first_manager(company_id, roster)?]
                }
            }
            None => vec![first_manager(company_id, roster)?],
        };

        let assignments = user_ids
            .into_iter()
            .zip(1u32..)
            .map(|(user_id, order)| ApproverAssignment::undecided(user_id, order))
            .collect();

        Ok(BuiltChain { assignments, mode, matched_rule_id })
    }
}

fn validate_explicit(
    rule_id: &RuleId,
    company_id: &CompanyId,
    explicit: &[UserId],
    roster: &ApproverRoster,
) -> Result<(), ChainError> {
    let mut seen = HashSet::new();
    for user_id in explicit {
        if !seen.insert(user_id) {
            return Err(ChainError::DuplicateApprover {
                rule_id: rule_id.clone(),
                user_id: user_id.clone(),
            });
        }
    }

    let unknown: Vec<UserId> =
        explicit.iter().filter(|user_id| !roster.members.contains(*user_id)).cloned().collect();
    if !unknown.is_empty() {
        return Err(ChainError::UnknownApprovers {
            rule_id: rule_id.clone(),
            company_id: company_id.clone(),
            user_ids: unknown,
        });
    }

    Ok(())
}

fn manager_pool(
    company_id: &CompanyId,
    roster: &ApproverRoster,
) -> Result<Vec<UserId>, ChainError> {
    let mut seen = HashSet::new();
    let pool: Vec<UserId> = roster
        .manager_approvers
        .iter()
        .filter(|user_id| seen.insert(*user_id))
        .cloned()
        .collect();

    if pool.is_empty() {
        return Err(ChainError::NoManagerApprovers { company_id: company_id.clone() });
    }
    Ok(pool)
}

fn first_manager(company_id: &CompanyId, roster: &ApproverRoster) -> Result<UserId, ChainError> {
    roster
        .manager_approvers
        .first()
        .cloned()
        .ok_or_else(|| ChainError::NoManagerApprovers { company_id: company_id.clone() })
}
