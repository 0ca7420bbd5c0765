use serde::{Deserialize, Serialize};

/// Token ingress endpoint for this control node.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// UDP port that accepts token payloads.
    pub ingress_port: u16,
    /// Bind address for both ingress sockets.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
