use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::approvals::{
    ApprovalLedger, ApproverRoster, BuiltChain, ChainBuilder, ChainError, DispositionEvaluator,
    MatchedPolicy, RuleMatcher,
};
use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::expense::{ApprovalMode, Expense, ExpenseId, ExpenseStatus};
use crate::domain::tenant::{CompanyId, UserId};

use super::{
    DecisionEvent, DecisionOutcome, ExpenseStore, Notification, NotificationDispatcher,
    NotificationKind, RuleRepository, StoreError, SubmissionEvent, SubmissionOutcome,
    UserDirectory, WorkflowError,
};

pub const DEFAULT_MAX_CONFLICT_RETRIES: u32 = 3;

/// Dry-run routing result: the policy that matched and what it expands to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutePreview {
    pub converted_amount: Decimal,
    pub policy: MatchedPolicy,
    pub chain: Result<BuiltChain, ChainError>,
}

/// Routes submitted expenses and applies approver decisions.
///
/// Decisions use optimistic concurrency: the expense is re-read and the ledger re-applied
/// whenever the store reports that another writer got there first.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    rules: Arc<dyn RuleRepository>,
    directory: Arc<dyn UserDirectory>,
    expenses: Arc<dyn ExpenseStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn AuditSink>,
    max_conflict_retries: u32,
}

impl ApprovalWorkflow {
    pub fn new(
        rules: Arc<dyn RuleRepository>,
        directory: Arc<dyn UserDirectory>,
        expenses: Arc<dyn ExpenseStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            rules,
            directory,
            expenses,
            notifier,
            audit,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
        }
    }

    pub fn with_max_conflict_retries(mut self, retries: u32) -> Self {
        self.max_conflict_retries = retries;
        self
    }

    pub fn expenses(&self) -> &Arc<dyn ExpenseStore> {
        &self.expenses
    }

    pub fn directory(&self) -> &Arc<dyn UserDirectory> {
        &self.directory
    }

    /// Matches a rule and expands it into a chain without persisting anything.
    pub async fn preview_route(
        &self,
        company_id: &CompanyId,
        converted_amount: Decimal,
        category: &str,
    ) -> Result<RoutePreview, WorkflowError> {
        let rules = self.rules.list_active_rules(company_id).await?;
        let policy = RuleMatcher.match_rule(&rules, company_id, converted_amount, category);
        let roster = self.roster(company_id).await?;
        let chain = ChainBuilder.build(&policy, company_id, &roster);
        Ok(RoutePreview { converted_amount, policy, chain })
    }

    pub async fn submit(&self, event: SubmissionEvent) -> Result<SubmissionOutcome, WorkflowError> {
        let SubmissionEvent { mut expense, correlation_id } = event;
        let context = AuditContext::new(
            Some(expense.company_id.clone()),
            Some(expense.id.clone()),
            correlation_id.clone(),
            expense.submitted_by.0.clone(),
        );

        let RoutePreview { policy, chain, .. } = self
            .preview_route(&expense.company_id, expense.converted_amount, &expense.category)
            .await?;
        expense.status = ExpenseStatus::Pending;
        expense.version = 1;
        expense.matched_rule_id = policy.rule().map(|rule| rule.id.clone());

        let configuration_issue = match chain {
            Ok(chain) => {
                expense.approvers = chain.assignments;
                expense.approval_mode = chain.mode;
                None
            }
            Err(error) => {
                expense.approvers = Vec::new();
                expense.approval_mode = ChainBuilder.mode_for(&policy);
                Some(error)
            }
        };

        self.expenses.insert(&expense).await?;

        info!(
            event_name = "approval.submitted",
            correlation_id = %correlation_id,
            company_id = %expense.company_id,
            expense_id = %expense.id,
            matched_rule_id = matched_rule_label(&expense),
            approval_mode = expense.approval_mode.as_str(),
            approvers = expense.approvers.len(),
            "expense routed"
        );
        self.audit.emit(
            AuditEvent::new(
                &context,
                "approval.submitted",
                AuditCategory::Routing,
                AuditOutcome::Success,
            )
            .with_metadata("approval_mode", expense.approval_mode.as_str())
            .with_metadata("approvers", expense.approvers.len().to_string())
            .with_metadata("matched_rule_id", matched_rule_label(&expense)),
        );

        if let Some(issue) = &configuration_issue {
            warn!(
                event_name = "approval.configuration_error",
                correlation_id = %correlation_id,
                company_id = %expense.company_id,
                expense_id = %expense.id,
                error = %issue,
                "expense left pending without approvers"
            );
            self.audit.emit(
                AuditEvent::new(
                    &context,
                    "approval.configuration_error",
                    AuditCategory::Configuration,
                    AuditOutcome::Failed,
                )
                .with_metadata("reason", issue.to_string()),
            );
        }

        let recipients = DispositionEvaluator
            .awaiting_decision(&expense.approvers, expense.approval_mode)
            .into_iter()
            .map(|recipient| (recipient, NotificationKind::Assigned))
            .collect();
        self.notify(&context, &expense, recipients).await;

        Ok(SubmissionOutcome {
            matched_rule_id: expense.matched_rule_id.clone(),
            expense,
            configuration_issue,
        })
    }

    pub async fn decide(&self, event: DecisionEvent) -> Result<DecisionOutcome, WorkflowError> {
        let DecisionEvent { expense_id, approver_id, approved, comments, correlation_id } = event;
        let mut context = AuditContext::new(
            None,
            Some(expense_id.clone()),
            correlation_id.clone(),
            approver_id.0.clone(),
        );

        let mut attempts = 0u32;
        let (expense, disposition) = loop {
            attempts += 1;
            let mut expense = self
                .expenses
                .find_by_id(&expense_id)
                .await?
                .ok_or_else(|| WorkflowError::ExpenseNotFound(expense_id.clone()))?;
            context.company_id = Some(expense.company_id.clone());
            let expected_version = expense.version;

            let slot = match ApprovalLedger.record_decision(
                &mut expense,
                &approver_id,
                approved,
                comments.clone(),
                Utc::now(),
            ) {
                Ok(slot) => slot,
                Err(error) => {
                    info!(
                        event_name = "approval.decision_refused",
                        correlation_id = %correlation_id,
                        expense_id = %expense_id,
                        approver_id = %approver_id,
                        error = %error,
                        "decision refused"
                    );
                    self.audit.emit(
                        AuditEvent::new(
                            &context,
                            "approval.decision_refused",
                            AuditCategory::Decision,
                            AuditOutcome::Rejected,
                        )
                        .with_metadata("reason", error.to_string()),
                    );
                    return Err(error.into());
                }
            };

            let disposition = DispositionEvaluator.evaluate(
                &expense.approvers,
                expense.approval_mode,
                slot.order,
            );
            expense.status = disposition.status;
            expense.version = expected_version + 1;
            expense.updated_at = Utc::now();

            match self.expenses.save_decision(&expense, expected_version).await {
                Ok(()) => break (expense, disposition),
                Err(StoreError::VersionConflict { .. })
                    if attempts <= self.max_conflict_retries =>
                {
                    debug!(
                        event_name = "approval.decision_retry",
                        correlation_id = %correlation_id,
                        expense_id = %expense_id,
                        attempt = attempts,
                        "expense changed concurrently, retrying decision"
                    );
                }
                Err(StoreError::VersionConflict { .. }) => {
                    warn!(
                        event_name = "approval.decision_conflict",
                        correlation_id = %correlation_id,
                        expense_id = %expense_id,
                        attempts,
                        "giving up after repeated concurrent modification"
                    );
                    return Err(WorkflowError::Conflict { expense_id, attempts });
                }
                Err(error) => return Err(error.into()),
            }
        };

        info!(
            event_name = "approval.decision_recorded",
            correlation_id = %correlation_id,
            company_id = %expense.company_id,
            expense_id = %expense.id,
            approver_id = %approver_id,
            approved,
            new_status = expense.status.as_str(),
            "decision recorded"
        );
        self.audit.emit(
            AuditEvent::new(
                &context,
                "approval.decision_recorded",
                AuditCategory::Decision,
                AuditOutcome::Success,
            )
            .with_metadata("approved", approved.to_string())
            .with_metadata("new_status", expense.status.as_str()),
        );

        let recipients = match expense.status {
            ExpenseStatus::Approved => {
                vec![(expense.submitted_by.clone(), NotificationKind::Approved)]
            }
            ExpenseStatus::Rejected => {
                vec![(expense.submitted_by.clone(), NotificationKind::Rejected)]
            }
            ExpenseStatus::Pending if expense.approval_mode == ApprovalMode::Sequential => {
                disposition
                    .next_approvers
                    .iter()
                    .map(|next| (next.clone(), NotificationKind::Forwarded))
                    .collect()
            }
            ExpenseStatus::Pending => Vec::new(),
        };
        self.notify(&context, &expense, recipients).await;

        Ok(DecisionOutcome {
            rejected: disposition.rejected(),
            expense_id: expense.id,
            new_status: disposition.status,
            next_approvers: disposition.next_approvers,
        })
    }

    pub async fn find_expense(&self, expense_id: &ExpenseId) -> Result<Expense, WorkflowError> {
        self.expenses
            .find_by_id(expense_id)
            .await?
            .ok_or_else(|| WorkflowError::ExpenseNotFound(expense_id.clone()))
    }

    pub async fn pending_for(&self, approver_id: &UserId) -> Result<Vec<Expense>, WorkflowError> {
        Ok(self.expenses.list_pending_for_approver(approver_id).await?)
    }

    pub async fn submitted_by(&self, user_id: &UserId) -> Result<Vec<Expense>, WorkflowError> {
        Ok(self.expenses.list_by_submitter(user_id).await?)
    }

    async fn roster(&self, company_id: &CompanyId) -> Result<ApproverRoster, WorkflowError> {
        let managers = self.directory.list_manager_approvers(company_id).await?;
        let members = self.directory.list_company_members(company_id).await?;
        Ok(ApproverRoster::new(managers, members))
    }

    /// Hands notifications to a background task so a slow channel never holds up the
    /// committed state change. Without a tokio runtime they are delivered inline.
    async fn notify(
        &self,
        context: &AuditContext,
        expense: &Expense,
        recipients: Vec<(UserId, NotificationKind)>,
    ) {
        if recipients.is_empty() {
            return;
        }

        let payload = json!({
            "companyId": expense.company_id,
            "submittedBy": expense.submitted_by,
            "status": expense.status,
            "amount": expense.amount,
            "currency": expense.currency,
            "convertedAmount": expense.converted_amount,
            "category": expense.category,
            "description": expense.description,
        });
        let notifications: Vec<Notification> = recipients
            .into_iter()
            .map(|(recipient, kind)| Notification {
                expense_id: expense.id.clone(),
                recipient_user_id: recipient,
                kind,
                payload: payload.clone(),
            })
            .collect();

        let notifier = Arc::clone(&self.notifier);
        let audit = Arc::clone(&self.audit);
        let context = context.clone();
        let delivery = async move {
            for notification in notifications {
                deliver(notifier.as_ref(), audit.as_ref(), &context, notification).await;
            }
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(delivery);
            }
            Err(_) => delivery.await,
        }
    }
}

async fn deliver(
    notifier: &dyn NotificationDispatcher,
    audit: &dyn AuditSink,
    context: &AuditContext,
    notification: Notification,
) {
    let expense_id = notification.expense_id.clone();
    let recipient = notification.recipient_user_id.clone();
    let kind = notification.kind;

    if let Err(error) = notifier.dispatch(notification).await {
        warn!(
            event_name = "notification.dispatch_failed",
            correlation_id = %context.correlation_id,
            expense_id = %expense_id,
            recipient = %recipient,
            kind = kind.as_str(),
            error = %error,
            "notification dropped"
        );
        audit.emit(
            AuditEvent::new(
                context,
                "notification.dispatch_failed",
                AuditCategory::Notification,
                AuditOutcome::Failed,
            )
            .with_metadata("recipient", recipient.0)
            .with_metadata("kind", kind.as_str()),
        );
    }
}

fn matched_rule_label(expense: &Expense) -> &str {
    expense.matched_rule_id.as_ref().map_or("default", |id| id.0.as_str())
}
