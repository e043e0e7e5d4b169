//! Structural errors surfaced by the registry, groups and health monitor.
//!
//! Per-unit forwarding and probe failures never show up here; they are
//! resolved locally (see [`crate::proxy::ForwardError`]).

use crate::backend::{BackendTarget, ForwardInfo, Protocol};
use std::net::SocketAddr;
use thiserror::Error;

/// Coarse classification used by callers translating errors to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    NotFound,
    Duplicate,
    Io,
}

/// Errors returned by group, registry and health-monitor operations.
#[derive(Debug, Error)]
pub enum LbError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("{target} cannot join a {expected} group")]
    ProtocolMismatch {
        expected: Protocol,
        target: BackendTarget,
    },

    #[error("no forwarding group for {0}")]
    GroupNotFound(ForwardInfo),

    #[error("backend {0} is not registered")]
    BackendNotFound(BackendTarget),

    #[error("backend {0} is already registered")]
    DuplicateBackend(BackendTarget),

    #[error("health check for {0} is already scheduled")]
    DuplicateHealthCheck(BackendTarget),

    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: Protocol,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("worker pool is shut down")]
    PoolClosed,
}

impl LbError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LbError::InvalidState(_) | LbError::ProtocolMismatch { .. } | LbError::PoolClosed => {
                ErrorKind::InvalidState
            }
            LbError::GroupNotFound(_) | LbError::BackendNotFound(_) => ErrorKind::NotFound,
            LbError::DuplicateBackend(_) | LbError::DuplicateHealthCheck(_) => ErrorKind::Duplicate,
            LbError::Bind { .. } => ErrorKind::Io,
        }
    }
}
