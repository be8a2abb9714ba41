use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification that decides which side of a posting increases the balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccountNature {
    Asset,
    Liability,
    Equity,
    Income,
    Expense,
}

impl AccountNature {
    /// Asset and expense accounts grow with debits; everything else grows with credits.
    pub fn is_debit_normal(self) -> bool {
        matches!(self, AccountNature::Asset | AccountNature::Expense)
    }

    /// Signed change a posting of `debit`/`credit` applies to an account of this nature.
    pub fn balance_delta(self, debit: Decimal, credit: Decimal) -> Decimal {
        if self.is_debit_normal() {
            debit - credit
        } else {
            credit - debit
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AccountNature::Asset => "Asset",
            AccountNature::Liability => "Liability",
            AccountNature::Equity => "Equity",
            AccountNature::Income => "Income",
            AccountNature::Expense => "Expense",
        }
    }
}

/// A chart-of-accounts entry. Only the account registry writes `current_balance`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    #[serde(default)]
    pub current_balance: Decimal,
    #[serde(default = "Account::default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Creates a new active account with a zero balance.
    pub fn new(code: impl Into<String>, name: impl Into<String>, nature: AccountNature) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into().trim().to_string(),
            name: name.into(),
            nature,
            current_balance: Decimal::ZERO,
            active: true,
            parent_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn default_active() -> bool {
        true
    }

    /// Canonical form used for code uniqueness checks.
    pub fn normalized_code(code: &str) -> String {
        code.trim().to_ascii_lowercase()
    }
}
