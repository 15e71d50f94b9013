//! Approval workflow orchestration and the collaborator seams it depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::{ChainError, DispositionEvaluator, LedgerError};
use crate::domain::expense::{Expense, ExpenseId, ExpenseStatus};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::tenant::{Company, CompanyId, User, UserId};
use crate::errors::{ApplicationError, DomainError, InterfaceError};

pub mod intake;
pub mod memory;
pub mod rules;
pub mod service;

pub use intake::ExpenseService;
pub use memory::{
    InMemoryDirectory, InMemoryExpenseStore, InMemoryRuleRepository,
    RecordingNotificationDispatcher,
};
pub use rules::{RuleAdminService, RuleDraft};
pub use service::{ApprovalWorkflow, RoutePreview};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("expense `{expense_id}` was modified concurrently (expected version {expected})")]
    VersionConflict { expense_id: ExpenseId, expected: u32 },
    #[error("`{0}` already exists")]
    Duplicate(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[async_trait]
pub trait RuleRepository: Send + Sync {
    async fn list_active_rules(&self, company_id: &CompanyId)
        -> Result<Vec<ApprovalRule>, StoreError>;

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
        include_inactive: bool,
    ) -> Result<Vec<ApprovalRule>, StoreError>;

    async fn find_by_id(&self, rule_id: &RuleId) -> Result<Option<ApprovalRule>, StoreError>;

    /// Creates or replaces the rule in place.
    async fn save(&self, rule: ApprovalRule) -> Result<(), StoreError>;

    /// Soft delete. Returns `false` when no such rule exists.
    async fn deactivate(&self, rule_id: &RuleId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_company(&self, company_id: &CompanyId) -> Result<Option<Company>, StoreError>;

    async fn find_user(&self, user_id: &UserId) -> Result<Option<User>, StoreError>;

    /// Manager-approvers in stable roster order; the default policy routes to the first.
    async fn list_manager_approvers(&self, company_id: &CompanyId)
        -> Result<Vec<UserId>, StoreError>;

    async fn list_company_members(&self, company_id: &CompanyId)
        -> Result<Vec<UserId>, StoreError>;
}

#[async_trait]
pub trait ExpenseStore: Send + Sync {
    async fn insert(&self, expense: &Expense) -> Result<(), StoreError>;

    async fn find_by_id(&self, expense_id: &ExpenseId) -> Result<Option<Expense>, StoreError>;

    /// Persists status and chain only if the stored version still equals
    /// `expected_version`; otherwise fails with `StoreError::VersionConflict`.
    async fn save_decision(&self, expense: &Expense, expected_version: u32)
        -> Result<(), StoreError>;

    async fn list_pending_for_approver(&self, approver_id: &UserId)
        -> Result<Vec<Expense>, StoreError>;

    /// Newest first.
    async fn list_by_submitter(&self, user_id: &UserId) -> Result<Vec<Expense>, StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Assigned,
    Approved,
    Rejected,
    Forwarded,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Forwarded => "forwarded",
        }
    }
}

/// Outbound request to whatever delivers messages to people.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub expense_id: ExpenseId,
    pub recipient_user_id: UserId,
    pub kind: NotificationKind,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("notification delivery failed: {0}")]
pub struct NotificationError(pub String);

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        tracing::info!(
            event_name = "notification.logged",
            expense_id = %notification.expense_id,
            recipient_user_id = %notification.recipient_user_id,
            kind = notification.kind.as_str(),
            "notification not delivered: log-only dispatcher"
        );
        Ok(())
    }
}

/// A persisted-ready expense entering routing. The expense already carries the
/// `companyId`, `convertedAmount`, `category` and `expenseId` routing reads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionEvent {
    pub expense: Expense,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub expense: Expense,
    pub matched_rule_id: Option<RuleId>,
    /// Set when the chain could not be built; the expense is then pending with no approvers.
    pub configuration_issue: Option<ChainError>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionEvent {
    pub expense_id: ExpenseId,
    pub approver_id: UserId,
    pub approved: bool,
    pub comments: Option<String>,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub expense_id: ExpenseId,
    pub new_status: ExpenseStatus,
    pub next_approvers: Vec<UserId>,
    pub rejected: bool,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error(transparent)]
    Decision(#[from] LedgerError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("expense `{0}` not found")]
    ExpenseNotFound(ExpenseId),
    #[error("approval rule `{0}` not found")]
    RuleNotFound(RuleId),
    #[error("company `{0}` not found")]
    CompanyNotFound(CompanyId),
    #[error("user `{user_id}` is not a member of company `{company_id}`")]
    UnknownUser { company_id: CompanyId, user_id: UserId },
    #[error("no exchange rate from `{from}` to `{to}`")]
    UnsupportedCurrency { from: String, to: String },
    #[error("expense `{expense_id}` kept changing underneath {attempts} decision attempts")]
    Conflict { expense_id: ExpenseId, attempts: u32 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        InterfaceError::from(self).with_correlation_id(correlation_id)
    }
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<WorkflowError> for InterfaceError {
    fn from(value: WorkflowError) -> Self {
        let correlation_id = "unassigned".to_owned();
        match value {
            WorkflowError::Decision(error) => {
                Self::Conflict { message: error.to_string(), correlation_id }
            }
            error @ WorkflowError::Conflict { .. } => {
                Self::Conflict { message: error.to_string(), correlation_id }
            }
            error @ (WorkflowError::ExpenseNotFound(_)
            | WorkflowError::RuleNotFound(_)
            | WorkflowError::CompanyNotFound(_)) => {
                Self::NotFound { message: error.to_string(), correlation_id }
            }
            error @ (WorkflowError::UnknownUser { .. }
            | WorkflowError::UnsupportedCurrency { .. }) => {
                Self::BadRequest { message: error.to_string(), correlation_id }
            }
            WorkflowError::Domain(error) => ApplicationError::Domain(error).into(),
            WorkflowError::Store(StoreError::Duplicate(message)) => {
                Self::Conflict { message: format!("`{message}` already exists"), correlation_id }
            }
            WorkflowError::Store(error) => ApplicationError::from(error).into(),
        }
    }
}

/// Whether `approver_id` may act on `expense` right now.
pub fn is_awaiting(expense: &Expense, approver_id: &UserId) -> bool {
    expense.status == ExpenseStatus::Pending
        && DispositionEvaluator
            .awaiting_decision(&expense.approvers, expense.approval_mode)
            .iter()
            .any(|user_id| user_id == approver_id)
}
