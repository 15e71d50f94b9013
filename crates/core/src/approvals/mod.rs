//! Routing and decision engine for expense approvals.
//!
//! Submission runs `RuleMatcher` then `ChainBuilder`; each decision runs `ApprovalLedger`
//! then `DispositionEvaluator`. Every component is synchronous and free of I/O.

pub mod chain;
pub mod disposition;
pub mod ledger;
pub mod matcher;

pub use chain::{ApproverRoster, BuiltChain, ChainBuilder, ChainError};
pub use disposition::{threshold_met, Disposition, DispositionEvaluator};
pub use ledger::{ApprovalLedger, DecidedSlot, LedgerError};
pub use matcher::{MatchedPolicy, RuleMatcher};
