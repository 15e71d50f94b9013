use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::currency::{normalize_code, CurrencyConverter};
use crate::domain::expense::{ApprovalMode, Expense, ExpenseDraft, ExpenseId, ExpenseStatus};
use crate::domain::tenant::CompanyId;
use crate::errors::DomainError;

use super::{ApprovalWorkflow, RoutePreview, SubmissionEvent, SubmissionOutcome, WorkflowError};

/// Expense intake: validation, one-time currency conversion and id allocation ahead of
/// routing. The converted amount is frozen on the stored expense.
#[derive(Clone)]
pub struct ExpenseService {
    workflow: ApprovalWorkflow,
    converter: Arc<dyn CurrencyConverter>,
}

impl ExpenseService {
    pub fn new(workflow: ApprovalWorkflow, converter: Arc<dyn CurrencyConverter>) -> Self {
        Self { workflow, converter }
    }

    pub fn workflow(&self) -> &ApprovalWorkflow {
        &self.workflow
    }

    pub async fn submit(
        &self,
        draft: ExpenseDraft,
        correlation_id: &str,
    ) -> Result<SubmissionOutcome, WorkflowError> {
        let expense = self.prepare(draft).await?;
        self.workflow
            .submit(SubmissionEvent { expense, correlation_id: correlation_id.to_string() })
            .await
    }

    /// Validates and converts a draft into an unrouted expense.
    pub async fn prepare(&self, draft: ExpenseDraft) -> Result<Expense, WorkflowError> {
        validate_draft(&draft)?;

        let directory = self.workflow.directory();
        let company = directory
            .find_company(&draft.company_id)
            .await?
            .ok_or_else(|| WorkflowError::CompanyNotFound(draft.company_id.clone()))?;
        let submitter = directory.find_user(&draft.submitted_by).await?;
        if submitter.as_ref().map_or(true, |user| user.company_id != company.id) {
            return Err(WorkflowError::UnknownUser {
                company_id: company.id,
                user_id: draft.submitted_by,
            });
        }

        let currency = normalize_code(&draft.currency);
        let converted_amount = self.convert(draft.amount, &currency, &company.base_currency)?;

        let now = Utc::now();
        Ok(Expense {
            id: ExpenseId(format!("EXP-{}", Uuid::new_v4())),
            company_id: company.id,
            submitted_by: draft.submitted_by,
            amount: draft.amount,
            currency,
            converted_amount,
            category: draft.category.trim().to_string(),
            description: draft.description.trim().to_string(),
            expense_date: draft.expense_date,
            receipt_url: draft.receipt_url.filter(|url| !url.trim().is_empty()),
            status: ExpenseStatus::Pending,
            approvers: Vec::new(),
            approval_mode: ApprovalMode::Parallel,
            matched_rule_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }

    /// Dry run: converts and routes an amount for a company without storing anything.
    pub async fn preview(
        &self,
        company_id: &CompanyId,
        amount: Decimal,
        currency: &str,
        category: &str,
    ) -> Result<RoutePreview, WorkflowError> {
        let company = self
            .workflow
            .directory()
            .find_company(company_id)
            .await?
            .ok_or_else(|| WorkflowError::CompanyNotFound(company_id.clone()))?;
        let converted_amount =
            self.convert(amount, &normalize_code(currency), &company.base_currency)?;
        self.workflow.preview_route(&company.id, converted_amount, category.trim()).await
    }

    fn convert(
        &self,
        amount: Decimal,
        currency: &str,
        base_currency: &str,
    ) -> Result<Decimal, WorkflowError> {
        let base_currency = normalize_code(base_currency);
        self.converter.convert(amount, currency, &base_currency).ok_or_else(|| {
            WorkflowError::UnsupportedCurrency { from: currency.to_string(), to: base_currency }
        })
    }
}

fn validate_draft(draft: &ExpenseDraft) -> Result<(), DomainError> {
    if draft.amount <= Decimal::ZERO {
        return Err(DomainError::InvalidExpense(format!(
            "amount must be positive, got {}",
            draft.amount
        )));
    }
    if draft.category.trim().is_empty() {
        return Err(DomainError::InvalidExpense("category must not be empty".to_string()));
    }
    if draft.currency.trim().is_empty() {
        return Err(DomainError::InvalidExpense("currency must not be empty".to_string()));
    }
    Ok(())
}
