use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Structural problems with a proposed journal entry. Never partially applied.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Journal entry needs at least two lines, found {lines}")]
    EmptyEntry { lines: usize },
    #[error("Line {line} must carry exactly one of debit or credit")]
    AmbiguousLine { line: usize },
    #[error("Line {line} carries a negative amount")]
    NegativeAmount { line: usize },
    #[error("Line {line} references account {account_id}: {reason}")]
    InvalidAccountReference {
        line: usize,
        account_id: Uuid,
        reason: AccountRejection,
    },
    #[error("Journal entry is unbalanced by {difference} (debits minus credits)")]
    UnbalancedEntry { difference: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRejection {
    Unknown,
    Inactive,
    GroupAccount,
}

impl std::fmt::Display for AccountRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AccountRejection::Unknown => "account does not exist",
            AccountRejection::Inactive => "account is inactive",
            AccountRejection::GroupAccount => "group accounts cannot receive postings",
        };
        f.write_str(text)
    }
}

/// Failures while running a recurring definition.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("Template line {line} could not be resolved: {reason}")]
    TemplateResolution { line: usize, reason: String },
    #[error("Recurring run failed downstream: {0}")]
    Downstream(String),
    #[error("Recurring definition {0}: retries exhausted, manual intervention required")]
    RetriesExhausted(Uuid),
    #[error("Recurring definition {0} is dormant")]
    Dormant(Uuid),
    #[error("Recurring definition {0} is awaiting approval")]
    AwaitingApproval(Uuid),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApprovalError {
    #[error("Approval request {request_id} cannot be decided: {reason}")]
    InvalidState { request_id: Uuid, reason: String },
    #[error("`{approver}` is not an authorized approver")]
    Unauthorized { approver: String },
}

/// Lock or transaction conflicts during posting. Retrying the whole posting is safe.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConcurrencyError {
    #[error("Timed out waiting for the lock on account {0}")]
    LockTimeout(Uuid),
    #[error("Execution deadline of {0} ms exceeded before commit")]
    DeadlineExceeded(u64),
    #[error("Concurrent update conflict: {0}")]
    Conflict(String),
}

/// Umbrella error type for the ledger engine.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error("Integrity violation on account {account_id}: balance {recorded} does not reconcile with ledger total {expected}")]
    IntegrityViolation {
        account_id: Uuid,
        recorded: Decimal,
        expected: Decimal,
    },
    #[error("Account {0} is on integrity hold pending operator review")]
    IntegrityHold(Uuid),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Persistence error: {0}")]
    Storage(String),
    #[error("Change applied but not persisted: {0}")]
    NotDurable(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for LedgerError {
    fn from(err: std::io::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}
