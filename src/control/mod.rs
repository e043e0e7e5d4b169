//! Control protocol: backends register and unregister themselves over TCP.

pub mod message;
mod server;

pub use message::{Command, ControlRequest, ControlResponse};
pub use server::{process_request, ControlServer};

use crate::proxy::ForwardError;
use thiserror::Error;

/// Failures while serving a control connection.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("malformed control request: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown control command '{0}'")]
    UnknownCommand(String),

    #[error("control transport error: {0}")]
    Transport(#[from] ForwardError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
