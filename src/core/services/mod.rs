pub mod account_service;
pub mod approval_service;
pub mod balance_service;
pub mod journal_service;
pub mod recurrence_service;

pub use account_service::{AccountChanges, AccountService};
pub use approval_service::{ApprovalService, Continuation, DecisionOutcome};
pub use balance_service::{AccountStatement, BalanceService, IntegrityReport, TrialBalance};
pub use journal_service::{JournalService, LiveDirectory, PostingOptions};
pub use recurrence_service::{OccurrenceOutcome, RecurrenceService, RetryOutcome, RunReport};

use crate::errors::LedgerError;

pub type ServiceResult<T> = Result<T, LedgerError>;
