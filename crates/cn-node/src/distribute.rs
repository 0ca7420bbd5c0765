use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tokio::net::UdpSocket;

#[derive(Args)]
pub struct DistributeArgs {
    /// Rule base version being shipped, e.g. `v001`
    #[arg(long)]
    pub version: String,
    /// Path to the fragment file (fact/rule text)
    #[arg(long)]
    pub fragments: PathBuf,
    /// Rule ingress endpoints of the participating control nodes
    /// (repeatable), e.g. `127.0.0.1:21000`
    #[arg(long = "target")]
    pub targets: Vec<String>,
    /// Lines per fragment datagram
    #[arg(long, default_value_t = 32)]
    pub chunk_lines: usize,
    /// Local commitment endpoint to collect ACKs on
    #[arg(long, default_value = "0.0.0.0:30000")]
    pub listen: String,
    /// How long to wait for all ACKs
    #[arg(long, default_value = "10")]
    pub timeout_secs: u64,
}

/// Ship a fragment file and wait for every node's commitment ACK.
///
/// Retransmission of lost fragments is deliberately not implemented here —
/// rerun the command; the agents are idempotent.
pub async fn run(args: DistributeArgs) -> Result<()> {
    if args.targets.is_empty() {
        anyhow::bail!("at least one --target is required");
    }
    let text = std::fs::read_to_string(&args.fragments)
        .with_context(|| format!("reading fragments: {}", args.fragments.display()))?;

    // Fail fast on authoring errors before anything leaves this host.
    let parsed = cn_lang::parse_fragments(&text)
        .with_context(|| format!("validating fragments: {}", args.fragments.display()))?;

    let chunks = chunk_lines(&text, args.chunk_lines);
    let total = chunks.len();
    println!(
        "shipping {} fragments ({} facts/rules) of {} to {} node(s)",
        total,
        parsed.len(),
        args.version,
        args.targets.len()
    );

    let ack_socket = UdpSocket::bind(&args.listen)
        .await
        .with_context(|| format!("binding commitment endpoint {}", args.listen))?;
    let send_socket = UdpSocket::bind("0.0.0.0:0").await?;

    for target in &args.targets {
        for (index, chunk) in chunks.iter().enumerate() {
            let datagram = format!("{} {} {}\n{}", args.version, index + 1, total, chunk);
            send_socket
                .send_to(datagram.as_bytes(), target.as_str())
                .await
                .with_context(|| format!("sending fragment to {target}"))?;
        }
    }

    // Collect one ACK per node identity within the deadline.
    let expected = args.targets.len();
    let mut acked: HashSet<String> = HashSet::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let mut buf = [0u8; 512];
    while acked.len() < expected {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ack_socket.recv_from(&mut buf)).await {
            Ok(Ok((len, peer))) => {
                let ack = String::from_utf8_lossy(&buf[..len]).to_string();
                let mut parts = ack.split_ascii_whitespace();
                if parts.next() == Some("ACK") && parts.next() == Some(args.version.as_str()) {
                    if let Some(identity) = parts.next() {
                        if acked.insert(identity.to_string()) {
                            println!("ACK from {identity} ({peer})");
                        }
                    }
                }
            }
            Ok(Err(e)) => anyhow::bail!("commitment socket error: {e}"),
            Err(_) => break,
        }
    }

    if acked.len() < expected {
        anyhow::bail!(
            "only {}/{} nodes acknowledged {} before the deadline; \
             rerun to retransmit (agents are idempotent)",
            acked.len(),
            expected,
            args.version
        );
    }
    println!("{} committed on all {} node(s)", args.version, expected);
    Ok(())
}

/// Split fragment text into datagram-sized chunks on line boundaries.
fn chunk_lines(text: &str, lines_per_chunk: usize) -> Vec<String> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return vec![String::new()];
    }
    lines
        .chunks(lines_per_chunk.max(1))
        .map(|chunk| chunk.join("\n"))
        .collect()
}
