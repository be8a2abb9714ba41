pub mod clock;
pub mod ledger_manager;
pub mod scheduler;
pub mod services;
pub mod utils;

pub use clock::{Clock, FixedClock, SystemClock};
pub use ledger_manager::{LedgerManager, LoadMetadata};
pub use scheduler::SchedulerHandle;
