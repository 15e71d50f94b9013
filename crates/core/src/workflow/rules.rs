use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::tenant::{CompanyId, UserId};
use crate::errors::DomainError;

use super::{RuleRepository, UserDirectory, WorkflowError};

/// Admin-editable part of a rule.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub threshold_percent: Option<u8>,
    #[serde(default)]
    pub required_approver_ids: Option<Vec<UserId>>,
    #[serde(default)]
    pub is_sequential: bool,
    #[serde(default)]
    pub min_amount: Option<Decimal>,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default)]
    pub category_filters: Option<Vec<String>>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Clone)]
pub struct RuleAdminService {
    rules: Arc<dyn RuleRepository>,
    directory: Arc<dyn UserDirectory>,
    audit: Arc<dyn AuditSink>,
}

impl RuleAdminService {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        directory: Arc<dyn UserDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { rules, directory, audit }
    }

    pub async fn list(
        &self,
        company_id: &CompanyId,
        include_inactive: bool,
    ) -> Result<Vec<ApprovalRule>, WorkflowError> {
        Ok(self.rules.list_for_company(company_id, include_inactive).await?)
    }

    pub async fn find(&self, rule_id: &RuleId) -> Result<ApprovalRule, WorkflowError> {
        self.rules
            .find_by_id(rule_id)
            .await?
            .ok_or_else(|| WorkflowError::RuleNotFound(rule_id.clone()))
    }

    pub async fn create(
        &self,
        company_id: &CompanyId,
        draft: RuleDraft,
        context: &AuditContext,
    ) -> Result<ApprovalRule, WorkflowError> {
        if self.directory.find_company(company_id).await?.is_none() {
            return Err(WorkflowError::CompanyNotFound(company_id.clone()));
        }

        let now = Utc::now();
        let rule = apply_draft(
            RuleId(format!("rule-{}", Uuid::new_v4())),
            company_id.clone(),
            draft,
            now,
        );
        self.store(rule, "rule.created", context).await
    }

    /// Replaces the editable fields in place. Expenses already routed keep the chain and
    /// mode they were built with.
    pub async fn update(
        &self,
        rule_id: &RuleId,
        draft: RuleDraft,
        context: &AuditContext,
    ) -> Result<ApprovalRule, WorkflowError> {
        let existing = self.find(rule_id).await?;
        let mut rule = apply_draft(existing.id, existing.company_id, draft, existing.created_at);
        rule.updated_at = Utc::now();
        self.store(rule, "rule.updated", context).await
    }

    pub async fn deactivate(
        &self,
        rule_id: &RuleId,
        context: &AuditContext,
    ) -> Result<(), WorkflowError> {
        if !self.rules.deactivate(rule_id).await? {
            return Err(WorkflowError::RuleNotFound(rule_id.clone()));
        }
        info!(
            event_name = "rule.deactivated",
            correlation_id = %context.correlation_id,
            rule_id = %rule_id,
            "approval rule deactivated"
        );
        self.audit.emit(
            AuditEvent::new(
                context,
                "rule.deactivated",
                AuditCategory::Configuration,
                AuditOutcome::Success,
            )
            .with_metadata("rule_id", rule_id.0.clone()),
        );
        Ok(())
    }

    async fn store(
        &self,
        rule: ApprovalRule,
        event_type: &str,
        context: &AuditContext,
    ) -> Result<ApprovalRule, WorkflowError> {
        rule.validate()?;
        self.check_approvers(&rule).await?;
        self.rules.save(rule.clone()).await?;

        info!(
            event_name = event_type,
            correlation_id = %context.correlation_id,
            company_id = %rule.company_id,
            rule_id = %rule.id,
            approval_mode = rule.approval_mode().as_str(),
            "approval rule saved"
        );
        self.audit.emit(
            AuditEvent::new(
                context,
                event_type,
                AuditCategory::Configuration,
                AuditOutcome::Success,
            )
            .with_metadata("rule_id", rule.id.0.clone())
            .with_metadata("approval_mode", rule.approval_mode().as_str()),
        );
        Ok(rule)
    }

    /// Catches unknown or repeated approvers at edit time. Routing still re-checks, since
    /// membership can change after the rule is saved.
    async fn check_approvers(&self, rule: &ApprovalRule) -> Result<(), WorkflowError> {
        let Some(explicit) = rule.explicit_approvers() else {
            return Ok(());
        };

        let mut seen = HashSet::new();
        if let Some(duplicate) = explicit.iter().find(|user_id| !seen.insert(*user_id)) {
            return Err(DomainError::InvalidRule(format!(
                "approver `{duplicate}` is listed more than once"
            ))
            .into());
        }

        let members: HashSet<UserId> =
            self.directory.list_company_members(&rule.company_id).await?.into_iter().collect();
        let unknown: Vec<&str> = explicit
            .iter()
            .filter(|user_id| !members.contains(*user_id))
            .map(|user_id| user_id.0.as_str())
            .collect();
        if !unknown.is_empty() {
            return Err(DomainError::InvalidRule(format!(
                "approvers not in company `{}`: {}",
                rule.company_id,
                unknown.join(", ")
            ))
            .into());
        }
        Ok(())
    }
}

fn apply_draft(
    id: RuleId,
    company_id: CompanyId,
    draft: RuleDraft,
    created_at: chrono::DateTime<Utc>,
) -> ApprovalRule {
    ApprovalRule {
        id,
        company_id,
        name: draft.name.trim().to_string(),
        threshold_percent: draft.threshold_percent,
        required_approver_ids: draft.required_approver_ids,
        is_sequential: draft.is_sequential,
        min_amount: draft.min_amount,
        max_amount: draft.max_amount,
        category_filters: draft.category_filters,
        is_active: draft.is_active,
        created_at,
        updated_at: created_at,
    }
}
