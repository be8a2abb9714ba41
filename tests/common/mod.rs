#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use ledger_engine::{
    api::{AccountRequest, AccountSelector, JournalEntryRequest, JournalLineRequest},
    config::EngineConfig,
    core::{clock::FixedClock, LedgerManager},
    ledger::{Account, AccountNature},
    storage::JsonStorage,
};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use tempfile::TempDir;

/// Holds TempDir guards so temporary folders live for the duration of the test run.
static TEST_DIRS: Lazy<Mutex<Vec<TempDir>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub struct TestEnv {
    pub manager: Arc<LedgerManager>,
    pub clock: Arc<FixedClock>,
    pub base: PathBuf,
    pub config: EngineConfig,
}

impl TestEnv {
    /// Opens a fresh manager over the same directory, as a restarted process would.
    pub fn reopen(&self) -> LedgerManager {
        open_manager(&self.base, self.config.clone(), Arc::clone(&self.clock))
    }

    pub fn set_today(&self, day: NaiveDate) {
        self.clock.set_date(day);
    }

    pub fn account(&self, code: &str, name: &str, nature: AccountNature) -> Account {
        self.manager
            .create_account(AccountRequest {
                code: code.into(),
                name: name.into(),
                nature,
                parent: None,
            })
            .expect("create account")
    }
}

pub fn fresh_dir() -> PathBuf {
    let temp = TempDir::new().expect("create temp dir");
    let base = temp.path().to_path_buf();
    TEST_DIRS.lock().expect("lock temp dir registry").push(temp);
    base
}

/// Creates an isolated manager backed by a unique directory and a clock pinned to `today`.
pub fn setup_test_env(today: NaiveDate) -> TestEnv {
    setup_test_env_with(today, EngineConfig::default())
}

pub fn setup_test_env_with(today: NaiveDate, config: EngineConfig) -> TestEnv {
    let base = fresh_dir();
    let clock = Arc::new(FixedClock::on(today));
    let manager = Arc::new(open_manager(&base, config.clone(), Arc::clone(&clock)));
    TestEnv {
        manager,
        clock,
        base,
        config,
    }
}

pub fn open_manager(base: &Path, config: EngineConfig, clock: Arc<FixedClock>) -> LedgerManager {
    let storage = JsonStorage::new(Some(base.to_path_buf())).expect("create json storage backend");
    LedgerManager::open(Box::new(storage), config, clock).expect("open ledger manager")
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub fn amount(value: &str) -> Decimal {
    value.parse().expect("decimal literal")
}

/// Two-line entry request: debit `debit_code`, credit `credit_code`.
pub fn transfer(
    day: NaiveDate,
    debit_code: &str,
    credit_code: &str,
    value: &str,
) -> JournalEntryRequest {
    JournalEntryRequest {
        date: day,
        reference: String::new(),
        description: String::new(),
        created_by: "tester".into(),
        lines: vec![
            JournalLineRequest {
                account: AccountSelector::Code(debit_code.into()),
                debit: Some(amount(value)),
                credit: None,
                description: String::new(),
                cost_center: None,
            },
            JournalLineRequest {
                account: AccountSelector::Code(credit_code.into()),
                debit: None,
                credit: Some(amount(value)),
                description: String::new(),
                cost_center: None,
            },
        ],
    }
}
