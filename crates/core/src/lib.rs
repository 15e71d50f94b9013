pub mod approvals;
pub mod audit;
pub mod config;
pub mod currency;
pub mod domain;
pub mod errors;
pub mod workflow;

pub use approvals::{
    ApprovalLedger, ApproverRoster, BuiltChain, ChainBuilder, ChainError, DecidedSlot,
    Disposition, DispositionEvaluator, LedgerError, MatchedPolicy, RuleMatcher,
};
pub use currency::{CurrencyConverter, StaticRateTable};
pub use domain::expense::{
    ApprovalMode, ApproverAssignment, Expense, ExpenseDraft, ExpenseId, ExpenseStatus,
};
pub use domain::rule::{ApprovalRule, RuleId};
pub use domain::tenant::{Company, CompanyId, User, UserId, UserRole};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use workflow::{
    ApprovalWorkflow, DecisionEvent, DecisionOutcome, ExpenseService, ExpenseStore,
    LogNotificationDispatcher, Notification, NotificationDispatcher, NotificationError,
    NotificationKind, RoutePreview, RuleAdminService, RuleDraft, RuleRepository, StoreError,
    SubmissionEvent, SubmissionOutcome, UserDirectory, WorkflowError,
};
