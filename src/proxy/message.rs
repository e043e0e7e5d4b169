//! Fixed wire payloads shared by the forwarding and probe paths.

use serde::{Deserialize, Serialize};

/// Raw reply sent to a client in place of a backend response.
pub const FORWARD_ERROR_MESSAGE: &[u8] = b"packet forwarding failed";

/// Acknowledgement value a healthy backend echoes back.
pub const SUCCESS_ACK: &str = "hello";

/// Health probe request record: `{"cmd":"hello"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckRequest {
    pub cmd: String,
}

impl HealthCheckRequest {
    pub fn hello() -> Self {
        Self {
            cmd: "hello".to_string(),
        }
    }

    /// Serialize the probe for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Health probe reply record: `{"ack":"hello"}` on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    #[serde(default)]
    pub ack: String,
}

impl HealthCheckResponse {
    /// Build the reply a healthy backend sends.
    pub fn healthy() -> Self {
        Self {
            ack: SUCCESS_ACK.to_string(),
        }
    }

    /// Decode a reply. Trailing zero padding is tolerated.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(trim_trailing_zeros(data))
    }

    pub fn is_success(&self) -> bool {
        self.ack == SUCCESS_ACK
    }
}

/// Strip the zero padding a fixed-size receive buffer leaves behind.
///
/// Senders never trim; receivers always do.
pub fn trim_trailing_zeros(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|&b| b != 0).map_or(0, |idx| idx + 1);
    &data[..end]
}
