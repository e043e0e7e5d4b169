//! dynlb - a dynamic TCP/UDP round-robin load balancer
//!
//! Backends register themselves at runtime. The first backend registered for
//! a (protocol, port) pair creates a forwarding group listening on that port;
//! inbound connections and datagrams are spread across the group's backends
//! in round-robin order. A health monitor probes every backend and evicts the
//! ones that stop answering.

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod registry;
pub mod state;
pub mod util;

pub use config::Config;
pub use error::{ErrorKind, LbError};
pub use registry::{GroupRegistry, RegistryListener, RegistrySettings};
pub use state::AppState;
