use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::expense::{ApprovalMode, Expense, ExpenseId, ExpenseStatus};
use crate::domain::tenant::UserId;

/// The slot a successful `record_decision` just filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecidedSlot {
    pub order: u32,
    pub approved: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerError {
    #[error("expense `{expense_id}` is already {} and accepts no further decisions", status.as_str())]
    ExpenseClosed { expense_id: ExpenseId, status: ExpenseStatus },
    #[error("`{approver_id}` is not an approver on expense `{expense_id}`")]
    NotAnApprover { expense_id: ExpenseId, approver_id: UserId },
    #[error("`{approver_id}` has already decided on expense `{expense_id}`")]
    AlreadyDecided { expense_id: ExpenseId, approver_id: UserId },
    #[error("`{approver_id}` is not yet eligible on expense `{expense_id}`; waiting on `{waiting_on}`")]
    NotYetEligible { expense_id: ExpenseId, approver_id: UserId, waiting_on: UserId },
}

/// Per-slot decision log on an expense's chain. Every precondition is checked before the
/// chain is touched, so a failed call leaves the expense exactly as it was.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApprovalLedger;

impl ApprovalLedger {
    pub fn record_decision(
        &self,
        expense: &mut Expense,
        approver_id: &UserId,
        approved: bool,
        comments: Option<String>,
        decided_at: DateTime<Utc>,
    ) -> Result<DecidedSlot, LedgerError> {
        if expense.status.is_terminal() {
            return Err(LedgerError::ExpenseClosed {
                expense_id: expense.id.clone(),
                status: expense.status,
            });
        }

        let Some(index) =
            expense.approvers.iter().position(|assignment| &assignment.user_id == approver_id)
        else {
            return Err(LedgerError::NotAnApprover {
                expense_id: expense.id.clone(),
                approver_id: approver_id.clone(),
            });
        };

        let order = expense.approvers[index].order;
        if expense.approvers[index].is_decided() {
            return Err(LedgerError::AlreadyDecided {
                expense_id: expense.id.clone(),
                approver_id: approver_id.clone(),
            });
        }

        if expense.approval_mode == ApprovalMode::Sequential {
            let blocking = expense
                .approvers
                .iter()
                .filter(|assignment| assignment.order < order && !assignment.is_decided())
                .min_by_key(|assignment| assignment.order);
            if let Some(blocking) = blocking {
                return Err(LedgerError::NotYetEligible {
                    expense_id: expense.id.clone(),
                    approver_id: approver_id.clone(),
                    waiting_on: blocking.user_id.clone(),
                });
            }
        }

        let slot = &mut expense.approvers[index];
        slot.approved = Some(approved);
        slot.comments =
            comments.map(|text| text.trim().to_string()).filter(|text| !text.is_empty());
        slot.decided_at = Some(decided_at);

        Ok(DecidedSlot { order, approved })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal::Decimal;

    use super::{ApprovalLedger, DecidedSlot, LedgerError};
    use crate::domain::expense::{
        ApprovalMode, ApproverAssignment, Expense, ExpenseId, ExpenseStatus,
    };
    use crate::domain::tenant::{CompanyId, UserId};

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    fn expense(mode: ApprovalMode, approvers: &[&str]) -> Expense {
        let now = Utc::now();
        Expense {
            id: ExpenseId("EXP-1".to_string()),
            company_id: CompanyId("acme".to_string()),
            submitted_by: user("u-emp"),
            amount: Decimal::new(12_000, 2),
            currency: "USD".to_string(),
            converted_amount: Decimal::new(12_000, 2),
            category: "travel".to_string(),
            description: "Client visit".to_string(),
            expense_date: NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date"),
            receipt_url: None,
            status: ExpenseStatus::Pending,
            approvers: approvers
                .iter()
                .zip(1u32..)
                .map(|(id, order)| ApproverAssignment::undecided(user(id), order))
                .collect(),
            approval_mode: mode,
            matched_rule_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn records_only_the_matching_slot() {
        let mut expense = expense(ApprovalMode::Parallel, &["u-a", "u-b", "u-c"]);
        let decided_at = Utc.with_ymd_and_hms(2026, 3, 15, 9, 30, 0).single().expect("time");

        let slot = ApprovalLedger
            .record_decision(
                &mut expense,
                &user("u-b"),
                true,
                Some("  looks fine ".to_string()),
                decided_at,
            )
            .expect("decision should record");

        assert_eq!(slot, DecidedSlot { order: 2, approved: true });
        assert_eq!(expense.approvers[1].approved, Some(true));
        assert_eq!(expense.approvers[1].comments.as_deref(), Some("looks fine"));
        assert_eq!(expense.approvers[1].decided_at, Some(decided_at));
        assert!(expense.approvers[0].approved.is_none());
        assert!(expense.approvers[2].approved.is_none());
    }

    #[test]
    fn second_decision_by_same_approver_fails_without_mutation() {
        let mut expense = expense(ApprovalMode::Parallel, &["u-a", "u-b"]);
        ApprovalLedger
            .record_decision(&mut expense, &user("u-a"), true, None, Utc::now())
            .expect("first decision");
        let snapshot = expense.clone();

        let error = ApprovalLedger
            .record_decision(
                &mut expense,
                &user("u-a"),
                false,
                Some("changed mind".into()),
                Utc::now(),
            )
            .expect_err("re-decision must fail");

        assert!(matches!(error, LedgerError::AlreadyDecided { .. }));
        assert_eq!(expense, snapshot);
    }

    #[test]
    fn outsider_is_not_an_approver() {
        let mut expense = expense(ApprovalMode::Parallel, &["u-a"]);
        let snapshot = expense.clone();

        let error = ApprovalLedger
            .record_decision(&mut expense, &user("u-zed"), true, None, Utc::now())
            .expect_err("outsider must be refused");

        assert_eq!(
            error,
            LedgerError::NotAnApprover {
                expense_id: ExpenseId("EXP-1".to_string()),
                approver_id: user("u-zed"),
            }
        );
        assert_eq!(expense, snapshot);
    }

    #[test]
    fn sequential_successor_cannot_decide_before_predecessor() {
        let mut expense = expense(ApprovalMode::Sequential, &["u-a", "u-b", "u-c"]);

        let error = ApprovalLedger
            .record_decision(&mut expense, &user("u-c"), true, None, Utc::now())
            .expect_err("order 3 must wait");

        assert_eq!(
            error,
            LedgerError::NotYetEligible {
                expense_id: ExpenseId("EXP-1".to_string()),
                approver_id: user("u-c"),
                waiting_on: user("u-a"),
            }
        );
        assert!(expense.approvers.iter().all(|slot| slot.approved.is_none()));

        ApprovalLedger
            .record_decision(&mut expense, &user("u-a"), true, None, Utc::now())
            .expect("order 1 may decide");
        ApprovalLedger
            .record_decision(&mut expense, &user("u-b"), true, None, Utc::now())
            .expect("order 2 may decide after order 1");
    }

    #[test]
    fn parallel_approvers_may_decide_in_any_order() {
        let mut expense = expense(ApprovalMode::Threshold { percent: 50 }, &["u-a", "u-b", "u-c"]);

        ApprovalLedger
            .record_decision(&mut expense, &user("u-c"), true, None, Utc::now())
            .expect("last slot may decide first in parallel mode");
    }

    #[test]
    fn terminal_expense_accepts_no_decisions() {
        let mut expense = expense(ApprovalMode::Parallel, &["u-a", "u-b"]);
        expense.status = ExpenseStatus::Approved;

        let error = ApprovalLedger
            .record_decision(&mut expense, &user("u-b"), true, None, Utc::now())
            .expect_err("closed expense");

        assert_eq!(
            error,
            LedgerError::ExpenseClosed {
                expense_id: ExpenseId("EXP-1".to_string()),
                status: ExpenseStatus::Approved,
            }
        );
    }
}
