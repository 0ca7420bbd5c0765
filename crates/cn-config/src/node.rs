use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::capture::CaptureConfig;
use crate::distribution::DistributionConfig;
use crate::logging::LoggingConfig;
use crate::scheduler::SchedulerConfig;
use crate::server::ServerConfig;
use crate::validate;
use crate::worker::WorkerConfig;

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct NodeConfigRaw {
    node: IdentityConfig,
    server: ServerConfig,
    #[serde(default)]
    distribution: DistributionConfig,
    #[serde(default)]
    worker: WorkerConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    capture: CaptureConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// The (service, operation) identity of the local business service.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    pub service: String,
    pub operation: String,
}

// ---------------------------------------------------------------------------
// NodeConfig (resolved, validated)
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct NodeConfig {
    pub node: IdentityConfig,
    pub server: ServerConfig,
    pub distribution: DistributionConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub capture: CaptureConfig,
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Read and parse a `ctrlnode.toml` file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.as_ref().display()))?;
        content.parse()
    }
}

impl FromStr for NodeConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`NodeConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: NodeConfigRaw = toml::from_str(toml_str)?;

        let config = NodeConfig {
            node: raw.node,
            server: raw.server,
            distribution: raw.distribution,
            worker: raw.worker,
            scheduler: raw.scheduler,
            capture: raw.capture,
            logging: raw.logging,
        };

        validate::validate(&config)?;

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const FULL_TOML: &str = r#"
[node]
service = "triage"
operation = "assess"

[server]
ingress_port = 9401
bind = "0.0.0.0"

[distribution]
channel = 1
base_port = 7
commitment_endpoint = "10.0.0.9:30000"

[worker]
retry_cap = 5
retry_base_delay = "100ms"

[scheduler]
queue_high_watermark = 64
park_grace = "2s"
sweep_interval = "500ms"
join_deadline_skew = "1s"

[capture]
buffer_size = 32
journal = "journal/capture.jsonl"

[logging]
level = "debug"
format = "json"
"#;

    const MINIMAL_TOML: &str = r#"
[node]
service = "triage"
operation = "assess"

[server]
ingress_port = 9401
"#;

    #[test]
    fn parse_full_config() {
        let config: NodeConfig = FULL_TOML.parse().unwrap();
        assert_eq!(config.node.service, "triage");
        assert_eq!(config.node.operation, "assess");
        assert_eq!(config.server.ingress_port, 9401);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.distribution.rule_port(), 21007);
        assert_eq!(config.distribution.commitment_endpoint, "10.0.0.9:30000");
        assert_eq!(config.worker.retry_cap, 5);
        assert_eq!(
            config.worker.retry_base_delay.as_duration(),
            Duration::from_millis(100)
        );
        assert_eq!(config.scheduler.queue_high_watermark, 64);
        assert_eq!(
            config.scheduler.join_deadline_skew.as_duration(),
            Duration::from_secs(1)
        );
        assert_eq!(config.capture.buffer_size, 32);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, crate::LogFormat::Json);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config: NodeConfig = MINIMAL_TOML.parse().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.distribution.channel, 0);
        assert_eq!(config.distribution.rule_port(), 20000);
        assert_eq!(config.worker.retry_cap, 3);
        assert_eq!(config.scheduler.queue_high_watermark, 1024);
        assert_eq!(config.capture.buffer_size, 256);
    }

    #[test]
    fn missing_node_section_is_an_error() {
        let err = "[server]\ningress_port = 9401\n".parse::<NodeConfig>().unwrap_err();
        assert!(err.to_string().contains("node"), "{err}");
    }

    #[test]
    fn empty_service_name_rejected() {
        let toml = MINIMAL_TOML.replace("\"triage\"", "\"\"");
        assert!(toml.parse::<NodeConfig>().is_err());
    }

    #[test]
    fn ingress_port_colliding_with_rule_port_rejected() {
        let toml = MINIMAL_TOML.replace("ingress_port = 9401", "ingress_port = 20000");
        assert!(toml.parse::<NodeConfig>().is_err());
    }
}
