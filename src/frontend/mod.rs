//! Forwarding groups and their listener loops.
//!
//! A group owns one listening socket, accepts (TCP) or receives (UDP) inbound
//! units on it, and hands each unit to a worker pool that forwards it to the
//! next backend in round-robin order.

mod group;
mod listener;
mod worker_pool;

pub use group::{ForwardingGroup, GroupSettings};
pub use listener::{BoundListener, LoopExit};
pub use worker_pool::WorkerPool;
