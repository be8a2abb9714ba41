use dirs::home_dir;
use std::{
    env, fs,
    path::{Path, PathBuf},
};

use crate::errors::LedgerError;

const DEFAULT_DIR_NAME: &str = ".ledger_engine";
const HOME_ENV: &str = "LEDGER_ENGINE_HOME";
const LEDGER_DIR: &str = "ledgers";
const CONFIG_DIR: &str = "config";
const CONFIG_FILE: &str = "config.json";

/// Resolves the on-disk layout used by the engine.
pub struct PathResolver;

impl PathResolver {
    /// Application data directory: `$LEDGER_ENGINE_HOME`, else `~/.ledger_engine`.
    pub fn base_dir() -> PathBuf {
        if let Some(custom) = env::var_os(HOME_ENV) {
            return PathBuf::from(custom);
        }
        home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_DIR_NAME)
    }

    pub fn resolve_base(custom: Option<PathBuf>) -> PathBuf {
        custom.unwrap_or_else(Self::base_dir)
    }

    pub fn ledger_dir_in(base: &Path) -> PathBuf {
        base.join(LEDGER_DIR)
    }

    pub fn config_dir_in(base: &Path) -> PathBuf {
        base.join(CONFIG_DIR)
    }

    pub fn config_file_in(base: &Path) -> PathBuf {
        Self::config_dir_in(base).join(CONFIG_FILE)
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), LedgerError> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

const TMP_SUFFIX: &str = "tmp";

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.to_path_buf();
    let ext = match path.extension().and_then(|ext| ext.to_str()) {
        Some(existing) => format!("{}.{}", existing, TMP_SUFFIX),
        None => TMP_SUFFIX.to_string(),
    };
    tmp.set_extension(ext);
    tmp
}

/// Writes `data` to a sibling temp file, flushes it, then renames it over `path`.
pub fn write_atomic(path: &Path, data: &str) -> Result<(), LedgerError> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_path_keeps_original_extension() {
        let tmp = tmp_path(Path::new("/data/ledgers/main.json"));
        assert_eq!(tmp, PathBuf::from("/data/ledgers/main.json.tmp"));
    }

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic(&path, "{\"a\":1}").unwrap();
        write_atomic(&path, "{\"a\":2}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":2}");
        assert!(!tmp_path(&path).exists());
    }
}
