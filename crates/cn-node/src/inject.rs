use anyhow::{Context, Result};
use clap::Args;
use tokio::net::UdpSocket;

use cn_core::payload::{Header, JoinAttribute, Payload, ServiceRef};
use cn_core::{TokenId, now_millis};

#[derive(Args)]
pub struct InjectArgs {
    /// Target token ingress endpoint, e.g. `127.0.0.1:9401`
    #[arg(long)]
    pub to: String,
    /// Token sequence id (workflow roots start at workflowBase + n)
    #[arg(long)]
    pub sequence_id: u64,
    /// Rule base version, e.g. `v001`
    #[arg(long)]
    pub version: String,
    /// Target service name (must match the node's identity)
    #[arg(long)]
    pub service: String,
    /// Target operation (must match the node's identity)
    #[arg(long)]
    pub operation: String,
    /// Attributes as `name=value` (repeatable)
    #[arg(long = "attr")]
    pub attributes: Vec<String>,
    /// Optional deadline (epoch millis) applied to every attribute
    #[arg(long)]
    pub not_after: Option<u64>,
}

pub async fn run(args: InjectArgs) -> Result<()> {
    let version = args
        .version
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid --version: {e}"))?;

    let mut attributes = Vec::with_capacity(args.attributes.len());
    for raw in &args.attributes {
        let (name, value) = raw
            .split_once('=')
            .with_context(|| format!("--attr {raw:?} is not name=value"))?;
        attributes.push(JoinAttribute {
            name: name.to_string(),
            value: value.to_string(),
            not_after: args.not_after,
        });
    }

    let payload = Payload {
        header: Header {
            sequence_id: TokenId::new(args.sequence_id),
            rule_base_version: version,
            created_at: Some(now_millis()),
            updated_at: None,
        },
        service: ServiceRef {
            service: args.service,
            operation: args.operation,
        },
        attributes,
        monitor: Vec::new(),
    };
    let xml = payload.to_xml().map_err(|e| anyhow::anyhow!("{e}"))?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket
        .send_to(xml.as_bytes(), args.to.as_str())
        .await
        .with_context(|| format!("sending token to {}", args.to))?;
    println!(
        "injected token {} ({}) to {}",
        args.sequence_id, args.version, args.to
    );
    Ok(())
}
