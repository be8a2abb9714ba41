#![doc(test(attr(deny(warnings))))]

//! Double-entry general ledger engine: validated journal posting with reversals,
//! per-account balances and trial balance, recurring entries with retry, and an
//! approval gate in front of posting.

pub mod api;
pub mod config;
pub mod core;
pub mod errors;
pub mod ledger;
pub mod storage;
pub mod utils;

pub use crate::core::LedgerManager;
pub use errors::{LedgerError, Result};

use std::sync::Once;

static INIT_TRACING: Once = Once::new();

/// Initializes global tracing and emits a startup info log.
pub fn init() {
    INIT_TRACING.call_once(|| {
        utils::init_tracing();
        tracing::info!("Ledger engine tracing initialized.");
    });
}
