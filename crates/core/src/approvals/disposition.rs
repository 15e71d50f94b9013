use serde::{Deserialize, Serialize};

use crate::domain::expense::{ApprovalMode, ApproverAssignment, ExpenseStatus};
use crate::domain::tenant::UserId;

/// Expense status after a decision plus whoever should be told it is their turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Disposition {
    pub status: ExpenseStatus,
    pub next_approvers: Vec<UserId>,
}

impl Disposition {
    fn closed(status: ExpenseStatus) -> Self {
        Self { status, next_approvers: Vec::new() }
    }

    fn pending(next_approvers: Vec<UserId>) -> Self {
        Self { status: ExpenseStatus::Pending, next_approvers }
    }

    pub fn rejected(&self) -> bool {
        self.status == ExpenseStatus::Rejected
    }
}

/// Pure state machine over a chain: `pending -> approved | rejected`, both terminal.
///
/// Callers guarantee that `decided_order` names exactly one slot that was undecided before
/// the current call and is decided now; the ledger enforces this.
#[derive(Clone, Copy, Debug, Default)]
pub struct DispositionEvaluator;

impl DispositionEvaluator {
    pub fn evaluate(
        &self,
        chain: &[ApproverAssignment],
        mode: ApprovalMode,
        decided_order: u32,
    ) -> Disposition {
        if chain.iter().any(|slot| slot.approved == Some(false)) {
            return Disposition::closed(ExpenseStatus::Rejected);
        }

        match mode {
            ApprovalMode::Sequential => {
                let successor = chain
                    .iter()
                    .filter(|slot| slot.order > decided_order)
                    .min_by_key(|slot| slot.order);
                match successor {
                    Some(next) => Disposition::pending(vec![next.user_id.clone()]),
                    None => Disposition::closed(ExpenseStatus::Approved),
                }
            }
            ApprovalMode::Parallel => {
                if chain.iter().all(|slot| slot.approved == Some(true)) {
                    Disposition::closed(ExpenseStatus::Approved)
                } else {
                    Disposition::pending(undecided(chain))
                }
            }
            ApprovalMode::Threshold { percent } => {
                let approved = chain.iter().filter(|slot| slot.approved == Some(true)).count();
                if threshold_met(approved, chain.len(), percent) {
                    Disposition::closed(ExpenseStatus::Approved)
                } else {
                    Disposition::pending(undecided(chain))
                }
            }
        }
    }

    /// Approvers who may act right now on a still-pending chain. Sequential chains expose
    /// only the lowest undecided slot; parallel and threshold chains expose every one.
    pub fn awaiting_decision(
        &self,
        chain: &[ApproverAssignment],
        mode: ApprovalMode,
    ) -> Vec<UserId> {
        if chain.iter().any(|slot| slot.approved == Some(false)) {
            return Vec::new();
        }

        match mode {
            ApprovalMode::Sequential => chain
                .iter()
                .filter(|slot| !slot.is_decided())
                .min_by_key(|slot| slot.order)
                .map(|slot| vec![slot.user_id.clone()])
                .unwrap_or_default(),
            ApprovalMode::Parallel | ApprovalMode::Threshold { .. } => undecided(chain),
        }
    }
}

/// `approved / total * 100 >= percent`, cross-multiplied so no rounding is involved.
pub fn threshold_met(approved: usize, total: usize, percent: u8) -> bool {
    if total == 0 {
        return false;
    }
    approved as u128 * 100 >= u128::from(percent) * total as u128
}

fn undecided(chain: &[ApproverAssignment]) -> Vec<UserId> {
    let mut open: Vec<&ApproverAssignment> =
        chain.iter().filter(|slot| !slot.is_decided()).collect();
    open.sort_by_key(|slot| slot.order);
    open.into_iter().map(|slot| slot.user_id.clone()).collect()
}
