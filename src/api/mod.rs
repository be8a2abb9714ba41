//! Boundary payloads for the HTTP-style surface, validated before they reach the engine.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::services::{AccountService, DecisionOutcome};
use crate::errors::{
    ApprovalError, ConcurrencyError, ExecutionError, LedgerError, Result, ValidationError,
};
use crate::ledger::{
    AccountNature, EntrySide, Frequency, JournalEntry, JournalLine, Ledger,
    RecurringEntryDefinition, TemplateAmount, TemplateLine,
};

/// Accounts are addressed either by id or by chart code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "lowercase")]
pub enum AccountSelector {
    Id(Uuid),
    Code(String),
}

impl AccountSelector {
    /// Ids pass through untouched; the journal validator reports unknown ones.
    pub fn resolve(&self, ledger: &Ledger) -> Result<Uuid> {
        match self {
            AccountSelector::Id(id) => Ok(*id),
            AccountSelector::Code(code) => AccountService::find_by_code(ledger, code)
                .map(|account| account.id)
                .ok_or_else(|| LedgerError::NotFound(format!("account code `{}`", code))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRequest {
    pub code: String,
    pub name: String,
    pub nature: AccountNature,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<AccountSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalLineRequest {
    pub account: AccountSelector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit: Option<Decimal>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntryRequest {
    pub date: NaiveDate,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub description: String,
    pub created_by: String,
    pub lines: Vec<JournalLineRequest>,
}

impl JournalEntryRequest {
    pub fn into_entry(self, ledger: &Ledger) -> Result<JournalEntry> {
        if self.created_by.trim().is_empty() {
            return Err(LedgerError::InvalidInput("createdBy is required".into()));
        }
        let mut entry = JournalEntry::draft(self.date, self.created_by.trim())
            .with_reference(self.reference)
            .with_description(self.description);
        for line in self.lines {
            entry.lines.push(JournalLine {
                account_id: line.account.resolve(ledger)?,
                debit: line.debit.unwrap_or(Decimal::ZERO),
                credit: line.credit.unwrap_or(Decimal::ZERO),
                description: line.description,
                cost_center: line.cost_center,
            });
        }
        Ok(entry)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateLineRequest {
    pub account: AccountSelector,
    pub side: EntrySide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_center: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringEntryRequest {
    pub name: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: String,
    pub lines: Vec<TemplateLineRequest>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub approval_required: bool,
    pub created_by: String,
}

impl RecurringEntryRequest {
    pub fn into_definition(
        self,
        ledger: &Ledger,
        config: &EngineConfig,
    ) -> Result<RecurringEntryDefinition> {
        let mut definition = RecurringEntryDefinition::new(
            self.name.trim(),
            self.frequency,
            self.start_date,
            self.created_by,
        )
        .with_max_retries(self.max_retries.unwrap_or(config.default_max_retries));
        definition.end_date = self.end_date;
        definition.reference = self.reference;
        definition.parameters = self.parameters;
        definition.approval_required = self.approval_required;

        for (index, line) in self.lines.into_iter().enumerate() {
            let amount = match (line.amount, line.parameter) {
                (Some(value), None) => TemplateAmount::Fixed(value),
                (None, Some(name)) if !name.trim().is_empty() => {
                    TemplateAmount::Parameter(name.trim().to_string())
                }
                _ => {
                    return Err(LedgerError::InvalidInput(format!(
                        "template line {} needs exactly one of amount or parameter",
                        index
                    )))
                }
            };
            definition.lines.push(TemplateLine {
                account_id: line.account.resolve(ledger)?,
                side: line.side,
                amount,
                description: line.description,
                cost_center: line.cost_center,
            });
        }
        Ok(definition)
    }
}

/// Window for `GET /accounts/{id}/ledger`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDecisionRequest {
    pub request_ids: Vec<Uuid>,
    pub approver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comments: Option<String>,
}

/// One entry of a batch response: the outcome or the error for a single id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub request_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DecisionOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl BatchItemResult {
    pub fn from_result(request_id: Uuid, result: Result<DecisionOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                request_id,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => Self {
                request_id,
                outcome: None,
                error: Some(ApiError::from(&err)),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Wire form of a `LedgerError`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
}

impl From<&LedgerError> for ApiError {
    fn from(err: &LedgerError) -> Self {
        let (status, code) = match err {
            LedgerError::Validation(inner) => (
                400,
                match inner {
                    ValidationError::EmptyEntry { .. } => "EmptyEntry",
                    ValidationError::AmbiguousLine { .. } => "AmbiguousLine",
                    ValidationError::NegativeAmount { .. } => "NegativeAmount",
                    ValidationError::InvalidAccountReference { .. } => "InvalidAccountReference",
                    ValidationError::UnbalancedEntry { .. } => "UnbalancedEntry",
                },
            ),
            LedgerError::Execution(inner) => match inner {
                ExecutionError::TemplateResolution { .. } => (422, "TemplateResolution"),
                ExecutionError::Downstream(_) => (502, "ExecutionFailed"),
                ExecutionError::RetriesExhausted(_) => (409, "RetriesExhausted"),
                ExecutionError::Dormant(_) => (409, "Dormant"),
                ExecutionError::AwaitingApproval(_) => (409, "AwaitingApproval"),
            },
            LedgerError::Approval(ApprovalError::InvalidState { .. }) => (409, "InvalidState"),
            LedgerError::Approval(ApprovalError::Unauthorized { .. }) => (403, "Unauthorized"),
            LedgerError::Concurrency(ConcurrencyError::DeadlineExceeded(_)) => {
                (503, "DeadlineExceeded")
            }
            LedgerError::Concurrency(_) => (409, "ConcurrencyConflict"),
            LedgerError::IntegrityViolation { .. } => (500, "IntegrityViolation"),
            LedgerError::IntegrityHold(_) => (423, "IntegrityHold"),
            LedgerError::NotFound(_) => (404, "NotFound"),
            LedgerError::InvalidState(_) => (409, "InvalidState"),
            LedgerError::InvalidInput(_) => (400, "InvalidInput"),
            LedgerError::Storage(_) => (500, "StorageError"),
            LedgerError::NotDurable(_) => (500, "NotDurable"),
            LedgerError::Config(_) => (500, "ConfigError"),
        };
        Self {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_uses_tagged_form() {
        let selector: AccountSelector =
            serde_json::from_str(r#"{"by":"code","value":"1000"}"#).unwrap();
        assert_eq!(selector, AccountSelector::Code("1000".into()));
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&AccountSelector::Id(id)).unwrap();
        assert_eq!(json, format!(r#"{{"by":"id","value":"{}"}}"#, id));
    }

    #[test]
    fn journal_request_resolves_codes() {
        let ledger = Ledger::new("Api");
        let cash =
            AccountService::create(&ledger, "1000", "Cash", AccountNature::Asset, None).unwrap();
        let payload = r#"{
            "date": "2024-01-15",
            "createdBy": "clerk",
            "lines": [
                {"account": {"by": "code", "value": "1000"}, "debit": "1000"},
                {"account": {"by": "id", "value": "7f1d5e5e-8a8e-4a4c-9d1e-2d4c7f0b8f11"}, "credit": "1000"}
            ]
        }"#;
        let request: JournalEntryRequest = serde_json::from_str(payload).unwrap();
        let entry = request.into_entry(&ledger).unwrap();
        assert_eq!(entry.lines[0].account_id, cash.id);
        assert_eq!(entry.lines[1].credit, Decimal::from(1000));
    }

    #[test]
    fn template_lines_need_one_amount_source() {
        let ledger = Ledger::new("Api");
        let request = RecurringEntryRequest {
            name: "Rent".into(),
            frequency: Frequency::Monthly,
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            end_date: None,
            reference: String::new(),
            lines: vec![TemplateLineRequest {
                account: AccountSelector::Id(Uuid::new_v4()),
                side: EntrySide::Debit,
                amount: Some(Decimal::ONE),
                parameter: Some("rent".into()),
                description: String::new(),
                cost_center: None,
            }],
            parameters: BTreeMap::new(),
            max_retries: None,
            approval_required: false,
            created_by: "ops".into(),
        };
        let err = request
            .into_definition(&ledger, &EngineConfig::default())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[test]
    fn errors_map_to_stable_codes() {
        let unbalanced = LedgerError::from(ValidationError::UnbalancedEntry {
            difference: Decimal::ONE,
        });
        let api = ApiError::from(&unbalanced);
        assert_eq!((api.status, api.code.as_str()), (400, "UnbalancedEntry"));

        let hold = ApiError::from(LedgerError::IntegrityHold(Uuid::new_v4()));
        assert_eq!((hold.status, hold.code.as_str()), (423, "IntegrityHold"));

        let exhausted = ApiError::from(LedgerError::from(ExecutionError::RetriesExhausted(
            Uuid::new_v4(),
        )));
        assert!(exhausted.message.contains("retries exhausted"));
    }
}
