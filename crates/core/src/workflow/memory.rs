use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::domain::expense::{Expense, ExpenseId};
use crate::domain::rule::{ApprovalRule, RuleId};
use crate::domain::tenant::{Company, CompanyId, User, UserId};

use super::{
    is_awaiting, ExpenseStore, Notification, NotificationDispatcher, NotificationError,
    RuleRepository, StoreError, UserDirectory,
};

#[derive(Default)]
pub struct InMemoryRuleRepository {
    rules: RwLock<HashMap<String, ApprovalRule>>,
}

impl InMemoryRuleRepository {
    pub fn with_rules(rules: impl IntoIterator<Item = ApprovalRule>) -> Self {
        let rules = rules.into_iter().map(|rule| (rule.id.0.clone(), rule)).collect();
        Self { rules: RwLock::new(rules) }
    }
}

#[async_trait]
impl RuleRepository for InMemoryRuleRepository {
    async fn list_active_rules(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<ApprovalRule>, StoreError> {
        self.list_for_company(company_id, false).await
    }

    async fn list_for_company(
        &self,
        company_id: &CompanyId,
        include_inactive: bool,
    ) -> Result<Vec<ApprovalRule>, StoreError> {
        let rules = self.rules.read().await;
        let mut selected: Vec<ApprovalRule> = rules
            .values()
            .filter(|rule| &rule.company_id == company_id)
            .filter(|rule| include_inactive || rule.is_active)
            .cloned()
            .collect();
        selected.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(selected)
    }

    async fn find_by_id(&self, rule_id: &RuleId) -> Result<Option<ApprovalRule>, StoreError> {
        let rules = self.rules.read().await;
        Ok(rules.get(&rule_id.0).cloned())
    }

    async fn save(&self, rule: ApprovalRule) -> Result<(), StoreError> {
        let mut rules = self.rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }

    async fn deactivate(&self, rule_id: &RuleId) -> Result<bool, StoreError> {
        let mut rules = self.rules.write().await;
        Ok(rules
            .get_mut(&rule_id.0)
            .map(|rule| {
                rule.is_active = false;
                rule.updated_at = chrono::Utc::now();
            })
            .is_some())
    }
}

/// Companies and users held in insertion order so manager-approver order is stable.
#[derive(Default)]
pub struct InMemoryDirectory {
    companies: RwLock<Vec<Company>>,
    users: RwLock<Vec<User>>,
}

impl InMemoryDirectory {
    pub fn new(companies: Vec<Company>, users: Vec<User>) -> Self {
        Self { companies: RwLock::new(companies), users: RwLock::new(users) }
    }

    pub async fn add_user(&self, user: User) {
        self.users.write().await.push(user);
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn find_company(&self, company_id: &CompanyId) -> Result<Option<Company>, StoreError> {
        let companies = self.companies.read().await;
        Ok(companies.iter().find(|company| &company.id == company_id).cloned())
    }

    async fn find_user(&self, user_id: &UserId) -> Result<Option<User>, StoreError> {
        let users = self.users.read().await;
        Ok(users.iter().find(|user| &user.id == user_id).cloned())
    }

    async fn list_manager_approvers(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .filter(|user| &user.company_id == company_id && user.is_manager_approver)
            .map(|user| user.id.clone())
            .collect())
    }

    async fn list_company_members(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, StoreError> {
        let users = self.users.read().await;
        Ok(users
            .iter()
            .filter(|user| &user.company_id == company_id)
            .map(|user| user.id.clone())
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryExpenseStore {
    expenses: RwLock<HashMap<String, Expense>>,
}

#[async_trait]
impl ExpenseStore for InMemoryExpenseStore {
    async fn insert(&self, expense: &Expense) -> Result<(), StoreError> {
        let mut expenses = self.expenses.write().await;
        if expenses.contains_key(&expense.id.0) {
            return Err(StoreError::Duplicate(expense.id.0.clone()));
        }
        expenses.insert(expense.id.0.clone(), expense.clone());
        Ok(())
    }

    async fn find_by_id(&self, expense_id: &ExpenseId) -> Result<Option<Expense>, StoreError> {
        let expenses = self.expenses.read().await;
        Ok(expenses.get(&expense_id.0).cloned())
    }

    async fn save_decision(
        &self,
        expense: &Expense,
        expected_version: u32,
    ) -> Result<(), StoreError> {
        let mut expenses = self.expenses.write().await;
        let stored = expenses
            .get_mut(&expense.id.0)
            .ok_or_else(|| StoreError::Backend(format!("expense `{}` vanished", expense.id)))?;
        if stored.version != expected_version {
            return Err(StoreError::VersionConflict {
                expense_id: expense.id.clone(),
                expected: expected_version,
            });
        }
        *stored = expense.clone();
        Ok(())
    }

    async fn list_pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<Expense>, StoreError> {
        let expenses = self.expenses.read().await;
        let mut pending: Vec<Expense> = expenses
            .values()
            .filter(|expense| is_awaiting(expense, approver_id))
            .cloned()
            .collect();
        pending.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        Ok(pending)
    }

    async fn list_by_submitter(&self, user_id: &UserId) -> Result<Vec<Expense>, StoreError> {
        let expenses = self.expenses.read().await;
        let mut submitted: Vec<Expense> =
            expenses.values().filter(|expense| &expense.submitted_by == user_id).cloned().collect();
        submitted.sort_by(|left, right| {
            right.created_at.cmp(&left.created_at).then_with(|| right.id.cmp(&left.id))
        });
        Ok(submitted)
    }
}

/// Keeps every dispatched notification; can be switched to fail delivery.
#[derive(Default)]
pub struct RecordingNotificationDispatcher {
    sent: RwLock<Vec<Notification>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingNotificationDispatcher {
    pub fn failing() -> Self {
        Self { failing: AtomicBool::new(true), ..Self::default() }
    }

    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    /// Delivery runs in the background; waits until `attempts` dispatches have finished
    /// (successful or not) or five seconds pass, then returns what was delivered.
    pub async fn wait_for(&self, attempts: usize) -> Vec<Notification> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.attempts.load(Ordering::Acquire) < attempts && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent().await
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotificationDispatcher {
    async fn dispatch(&self, notification: Notification) -> Result<(), NotificationError> {
        let result = if self.failing.load(Ordering::Relaxed) {
            Err(NotificationError(format!(
                "recipient `{}` unreachable",
                notification.recipient_user_id
            )))
        } else {
            self.sent.write().await.push(notification);
            Ok(())
        };
        self.attempts.fetch_add(1, Ordering::Release);
        result
    }
}
