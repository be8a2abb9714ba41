pub mod build_info;

use std::sync::Once;

static TRACING_INIT: Once = Once::new();

/// Installs the global fmt subscriber. `RUST_LOG` directives are honored on top of
/// the `ledger_engine=info` default.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ledger_engine=info"));

        // A subscriber installed by the host application wins.
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    });
}
