//! Ledger domain models, persistence-friendly types, and the shared in-memory book.

pub mod account;
pub mod approval;
pub mod journal;
#[allow(clippy::module_inception)]
pub mod ledger;
pub mod recurring;
pub mod time_interval;

pub use account::{Account, AccountNature};
pub use approval::{ApprovalRequest, ApprovalStatus, ApprovalSubject, Decision};
pub use journal::{EntrySource, JournalEntry, JournalLine, JournalStatus, LedgerEntry};
pub use ledger::{
    AccountBook, AccountDirectory, AccountView, Ledger, LedgerSnapshot, LockedAccounts,
    SharedAccount, CURRENT_SCHEMA_VERSION,
};
pub use recurring::{
    EntrySide, ExecutionStatus, RecurringEntryDefinition, RecurringExecutionRecord,
    RecurringStatus, TemplateAmount, TemplateLine,
};
pub use time_interval::Frequency;
