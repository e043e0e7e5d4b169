//! Utility functions and helpers.

mod logging;
mod shutdown;
mod unit_id;

pub use logging::init_logging;
pub use shutdown::{ShutdownListener, ShutdownSignal};
pub use unit_id::UnitId;
