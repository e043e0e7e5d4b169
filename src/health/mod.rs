//! Health checking for registered backends.

mod monitor;

pub use monitor::{HealthMonitor, HealthSettings};
