use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::rule::RuleId;
use crate::domain::tenant::{CompanyId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExpenseId(pub String);

impl std::fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Sequencing snapshot taken from the matched rule when the chain is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApprovalMode {
    Sequential,
    Parallel,
    Threshold { percent: u8 },
}

impl ApprovalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Threshold { .. } => "threshold",
        }
    }

    pub fn threshold_percent(&self) -> Option<u8> {
        match self {
            Self::Threshold { percent } => Some(*percent),
            Self::Sequential | Self::Parallel => None,
        }
    }

    pub fn from_parts(kind: &str, threshold_percent: Option<u8>) -> Option<Self> {
        match (kind.trim().to_ascii_lowercase().as_str(), threshold_percent) {
            ("sequential", _) => Some(Self::Sequential),
            ("parallel", _) => Some(Self::Parallel),
            ("threshold", Some(percent)) => Some(Self::Threshold { percent }),
            _ => None,
        }
    }
}

/// One slot in an expense's approval chain. `approved` is tri-state: `None` until decided.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproverAssignment {
    pub user_id: UserId,
    pub order: u32,
    pub approved: Option<bool>,
    pub comments: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApproverAssignment {
    pub fn undecided(user_id: UserId, order: u32) -> Self {
        Self { user_id, order, approved: None, comments: None, decided_at: None }
    }

    pub fn is_decided(&self) -> bool {
        self.approved.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: ExpenseId,
    pub company_id: CompanyId,
    pub submitted_by: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub converted_amount: Decimal,
    pub category: String,
    pub description: String,
    pub expense_date: NaiveDate,
    pub receipt_url: Option<String>,
    pub status: ExpenseStatus,
    pub approvers: Vec<ApproverAssignment>,
    pub approval_mode: ApprovalMode,
    pub matched_rule_id: Option<RuleId>,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Expense {
    pub fn assignment_for(&self, user_id: &UserId) -> Option<&ApproverAssignment> {
        self.approvers.iter().find(|assignment| &assignment.user_id == user_id)
    }
}

/// Intake payload before conversion and routing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDraft {
    pub company_id: CompanyId,
    pub submitted_by: UserId,
    pub amount: Decimal,
    pub currency: String,
    pub category: String,
    #[serde(default)]
    pub description: String,
    pub expense_date: NaiveDate,
    pub receipt_url: Option<String>,
}
