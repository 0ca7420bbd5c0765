use std::net::SocketAddr;

use crate::node::NodeConfig;

/// Cross-field validation of a parsed [`NodeConfig`].
pub(crate) fn validate(config: &NodeConfig) -> anyhow::Result<()> {
    if config.node.service.is_empty() {
        anyhow::bail!("[node] service must not be empty");
    }
    if config.node.operation.is_empty() {
        anyhow::bail!("[node] operation must not be empty");
    }

    // The rule-port formula must stay inside the u16 range.
    let rule_port = 20000u32
        + u32::from(config.distribution.channel) * 1000
        + u32::from(config.distribution.base_port);
    if rule_port > u32::from(u16::MAX) {
        anyhow::bail!(
            "[distribution] channel {} / base_port {} put the rule port out of range ({rule_port})",
            config.distribution.channel,
            config.distribution.base_port,
        );
    }

    if u32::from(config.server.ingress_port) == rule_port {
        anyhow::bail!(
            "[server] ingress_port {} collides with the rule ingress port",
            config.server.ingress_port
        );
    }

    config
        .distribution
        .commitment_endpoint
        .parse::<SocketAddr>()
        .map_err(|e| {
            anyhow::anyhow!(
                "[distribution] commitment_endpoint {:?} is not a socket address: {e}",
                config.distribution.commitment_endpoint
            )
        })?;

    if config.scheduler.queue_high_watermark == 0 {
        anyhow::bail!("[scheduler] queue_high_watermark must be at least 1");
    }
    if config.capture.buffer_size == 0 {
        anyhow::bail!("[capture] buffer_size must be at least 1");
    }

    Ok(())
}
