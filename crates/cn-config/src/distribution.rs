use serde::Deserialize;

/// Rule-distribution settings: where fragments arrive and where commitment
/// ACKs are sent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// Distribution channel; part of the rule-port formula.
    pub channel: u16,
    /// Per-node port offset; part of the rule-port formula.
    pub base_port: u16,
    /// Distributor endpoint that collects commitment ACKs.
    pub commitment_endpoint: String,
}

impl DistributionConfig {
    /// Rule ingress port: `20000 + channel × 1000 + base_port`.
    ///
    /// Range is enforced by config validation; the widening here keeps the
    /// arithmetic itself overflow-free.
    pub fn rule_port(&self) -> u16 {
        (20000u32 + u32::from(self.channel) * 1000 + u32::from(self.base_port)) as u16
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            base_port: 0,
            commitment_endpoint: "127.0.0.1:30000".to_string(),
        }
    }
}
