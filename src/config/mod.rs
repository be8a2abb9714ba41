use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    core::utils::{ensure_dir, write_atomic, PathResolver},
    errors::LedgerError,
    ledger::recurring::DEFAULT_MAX_RETRIES,
};

/// Tunables for the ledger engine, persisted as `config/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "EngineConfig::default_ledger_name")]
    pub ledger_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Decimal places amounts are rounded to before validation.
    #[serde(default = "EngineConfig::default_currency_scale")]
    pub currency_scale: u32,
    #[serde(default = "EngineConfig::default_balance_epsilon")]
    pub balance_epsilon: Decimal,
    #[serde(default = "EngineConfig::default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "EngineConfig::default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "EngineConfig::default_execution_deadline_ms")]
    pub execution_deadline_ms: u64,
    #[serde(default = "EngineConfig::default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Empty means any approver is accepted.
    #[serde(default)]
    pub authorized_approvers: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ledger_name: Self::default_ledger_name(),
            data_dir: None,
            currency_scale: Self::default_currency_scale(),
            balance_epsilon: Self::default_balance_epsilon(),
            default_max_retries: Self::default_max_retries(),
            scheduler_interval_secs: Self::default_scheduler_interval_secs(),
            execution_deadline_ms: Self::default_execution_deadline_ms(),
            lock_timeout_ms: Self::default_lock_timeout_ms(),
            authorized_approvers: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn default_ledger_name() -> String {
        "general".into()
    }

    pub fn default_currency_scale() -> u32 {
        2
    }

    pub fn default_balance_epsilon() -> Decimal {
        Decimal::new(1, 2)
    }

    pub fn default_max_retries() -> u32 {
        DEFAULT_MAX_RETRIES
    }

    pub fn default_scheduler_interval_secs() -> u64 {
        60
    }

    pub fn default_execution_deadline_ms() -> u64 {
        5_000
    }

    pub fn default_lock_timeout_ms() -> u64 {
        2_000
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs.max(1))
    }

    pub fn execution_deadline(&self) -> Duration {
        Duration::from_millis(self.execution_deadline_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn is_authorized_approver(&self, approver: &str) -> bool {
        self.authorized_approvers.is_empty()
            || self
                .authorized_approvers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(approver.trim()))
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.ledger_name.trim().is_empty() {
            return Err(LedgerError::Config("ledger_name must not be empty".into()));
        }
        if self.balance_epsilon <= Decimal::ZERO {
            return Err(LedgerError::Config(
                "balance_epsilon must be positive".into(),
            ));
        }
        if self.currency_scale > 8 {
            return Err(LedgerError::Config(format!(
                "currency_scale {} exceeds the supported maximum of 8",
                self.currency_scale
            )));
        }
        Ok(())
    }
}

/// Loads and saves [`EngineConfig`] under a base directory.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Result<Self, LedgerError> {
        Self::with_base_dir(PathResolver::base_dir())
    }

    pub fn with_base_dir(base: PathBuf) -> Result<Self, LedgerError> {
        ensure_dir(&base)?;
        ensure_dir(&PathResolver::config_dir_in(&base))?;
        Ok(Self {
            path: PathResolver::config_file_in(&base),
        })
    }

    pub fn load(&self) -> Result<EngineConfig, LedgerError> {
        let config = if self.path.exists() {
            let data = fs::read_to_string(&self.path)?;
            serde_json::from_str(&data).map_err(|err| LedgerError::Config(err.to_string()))?
        } else {
            EngineConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config: &EngineConfig) -> Result<(), LedgerError> {
        config.validate()?;
        let json = serde_json::to_string_pretty(config)?;
        write_atomic(&self.path, &json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempdir().unwrap();
        let manager = ConfigManager::with_base_dir(temp.path().to_path_buf()).unwrap();
        let config = manager.load().unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.balance_epsilon, Decimal::new(1, 2));
        assert_eq!(config.default_max_retries, 3);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let temp = tempdir().unwrap();
        let manager = ConfigManager::with_base_dir(temp.path().to_path_buf()).unwrap();
        let config = EngineConfig {
            ledger_name: "acme".into(),
            authorized_approvers: vec!["controller".into()],
            ..EngineConfig::default()
        };
        manager.save(&config).unwrap();
        let loaded = manager.load().unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.is_authorized_approver("Controller"));
        assert!(!loaded.is_authorized_approver("intern"));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempdir().unwrap();
        let manager = ConfigManager::with_base_dir(temp.path().to_path_buf()).unwrap();
        fs::write(manager.path(), r#"{ "ledger_name": "ops", "lock_timeout_ms": 10 }"#).unwrap();
        let loaded = manager.load().unwrap();
        assert_eq!(loaded.ledger_name, "ops");
        assert_eq!(loaded.lock_timeout_ms, 10);
        assert_eq!(loaded.scheduler_interval_secs, 60);
    }

    #[test]
    fn rejects_non_positive_epsilon() {
        let config = EngineConfig {
            balance_epsilon: Decimal::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }
}
