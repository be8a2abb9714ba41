use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JournalStatus {
    Draft,
    Posted,
    Reversed,
}

/// Where a journal entry came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntrySource {
    #[default]
    Manual,
    Recurring {
        definition_id: Uuid,
        scheduled_date: NaiveDate,
    },
    Reversal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalLine {
    pub account_id: Uuid,
    #[serde(default)]
    pub debit: Decimal,
    #[serde(default)]
    pub credit: Decimal,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center: Option<String>,
}

impl JournalLine {
    pub fn debit(account_id: Uuid, amount: Decimal) -> Self {
        Self {
            account_id,
            debit: amount,
            credit: Decimal::ZERO,
            description: String::new(),
            cost_center: None,
        }
    }

    pub fn credit(account_id: Uuid, amount: Decimal) -> Self {
        Self {
            account_id,
            debit: Decimal::ZERO,
            credit: amount,
            description: String::new(),
            cost_center: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_cost_center(mut self, cost_center: impl Into<String>) -> Self {
        self.cost_center = Some(cost_center.into());
        self
    }

    /// The same line with debit and credit swapped.
    pub fn inverted(&self) -> Self {
        Self {
            account_id: self.account_id,
            debit: self.credit,
            credit: self.debit,
            description: self.description.clone(),
            cost_center: self.cost_center.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub id: Uuid,
    pub entry_number: u64,
    pub date: NaiveDate,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub description: String,
    pub lines: Vec<JournalLine>,
    pub status: JournalStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source: EntrySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverses: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_by: Option<Uuid>,
}

impl JournalEntry {
    /// Creates a draft entry. The entry number is assigned when the ledger records it.
    pub fn draft(date: NaiveDate, created_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entry_number: 0,
            date,
            reference: String::new(),
            description: String::new(),
            lines: Vec::new(),
            status: JournalStatus::Draft,
            created_by: created_by.into(),
            created_at: Utc::now(),
            posted_at: None,
            source: EntrySource::Manual,
            reverses: None,
            reversed_by: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_line(mut self, line: JournalLine) -> Self {
        self.lines.push(line);
        self
    }

    pub fn with_source(mut self, source: EntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn total_debits(&self) -> Decimal {
        self.lines.iter().map(|line| line.debit).sum()
    }

    pub fn total_credits(&self) -> Decimal {
        self.lines.iter().map(|line| line.credit).sum()
    }
}

/// Projection row written once per journal line at posting time. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub date: NaiveDate,
    pub journal_entry_id: Uuid,
    pub entry_number: u64,
    pub account_id: Uuid,
    pub debit: Decimal,
    pub credit: Decimal,
    pub balance_after: Decimal,
    pub posted_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Ordering key used for as-of balance reconstruction.
    pub fn sort_key(&self) -> (NaiveDate, u64) {
        (self.date, self.entry_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverted_line_swaps_sides() {
        let account = Uuid::new_v4();
        let line = JournalLine::debit(account, Decimal::new(1000, 0)).with_cost_center("ops");
        let inverted = line.inverted();
        assert_eq!(inverted.debit, Decimal::ZERO);
        assert_eq!(inverted.credit, Decimal::new(1000, 0));
        assert_eq!(inverted.cost_center.as_deref(), Some("ops"));
    }

    #[test]
    fn totals_sum_each_side() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let entry = JournalEntry::draft(date, "tester")
            .with_line(JournalLine::debit(Uuid::new_v4(), Decimal::new(40, 0)))
            .with_line(JournalLine::debit(Uuid::new_v4(), Decimal::new(60, 0)))
            .with_line(JournalLine::credit(Uuid::new_v4(), Decimal::new(100, 0)));
        assert_eq!(entry.total_debits(), Decimal::new(100, 0));
        assert_eq!(entry.total_credits(), Decimal::new(100, 0));
        assert_eq!(entry.status, JournalStatus::Draft);
    }
}
