//! Control protocol records.
//!
//! A request is `{"cmd":"REGISTER","protocol":"TCP","port":9000}`; a reply is
//! `{"ack":"successful"}` or `{"ack":"failed","msg":"..."}`.

use super::ControlError;
use crate::backend::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ACK_SUCCESSFUL: &str = "successful";
pub const ACK_FAILED: &str = "failed";

pub const REGISTRATION_FAILED: &str = "Registration Failed";
pub const UNREGISTRATION_FAILED: &str = "UnRegistration Failed";

/// Membership change requested by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Register,
    Unregister,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Register => "REGISTER",
            Command::Unregister => "UNREGISTER",
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            Command::Register => REGISTRATION_FAILED,
            Command::Unregister => UNREGISTRATION_FAILED,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub cmd: String,
    pub protocol: Protocol,
    pub port: u16,
}

impl ControlRequest {
    pub fn new(cmd: Command, protocol: Protocol, port: u16) -> Self {
        Self {
            cmd: cmd.as_str().to_string(),
            protocol,
            port,
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, ControlError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// The requested command; unknown names are rejected.
    pub fn command(&self) -> Result<Command, ControlError> {
        match self.cmd.as_str() {
            "REGISTER" => Ok(Command::Register),
            "UNREGISTER" => Ok(Command::Unregister),
            other => Err(ControlError::UnknownCommand(other.to_string())),
        }
    }
}

/// Reply to one control request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ack: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl ControlResponse {
    pub fn successful() -> Self {
        Self {
            ack: ACK_SUCCESSFUL.to_string(),
            msg: None,
        }
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self {
            ack: ACK_FAILED.to_string(),
            msg: Some(msg.into()),
        }
    }

    /// The failure reply for a rejected `command`.
    pub fn rejected(command: Command) -> Self {
        Self::failed(command.failure_message())
    }

    pub fn is_successful(&self) -> bool {
        self.ack == ACK_SUCCESSFUL
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, ControlError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request() {
        let request =
            ControlRequest::decode(br#"{"cmd":"REGISTER","protocol":"UDP","port":5353}"#).unwrap();
        assert_eq!(request.command().unwrap(), Command::Register);
        assert_eq!(request.protocol, Protocol::Udp);
        assert_eq!(request.port, 5353);
    }

    #[test]
    fn test_unknown_command() {
        let request =
            ControlRequest::decode(br#"{"cmd":"RESTART","protocol":"TCP","port":1}"#).unwrap();
        assert!(matches!(
            request.command(),
            Err(ControlError::UnknownCommand(cmd)) if cmd == "RESTART"
        ));
    }

    #[test]
    fn test_malformed_request() {
        assert!(matches!(
            ControlRequest::decode(b"{not json"),
            Err(ControlError::Malformed(_))
        ));
        assert!(matches!(
            ControlRequest::decode(br#"{"cmd":"REGISTER","protocol":"SCTP","port":1}"#),
            Err(ControlError::Malformed(_))
        ));
    }

    #[test]
    fn test_response_wire_format() {
        let ok = ControlResponse::successful().encode().unwrap();
        assert_eq!(ok, br#"{"ack":"successful"}"#);

        let failed = ControlResponse::rejected(Command::Unregister).encode().unwrap();
        assert_eq!(failed, br#"{"ack":"failed","msg":"UnRegistration Failed"}"#);
    }
}
