//! Launcher: `consensus_node <node_id> <host> <port> [--peers '{"n2":"host:port"}'] [--vote-abort]`
//!
//! Parses positional and flag arguments by hand (matching this crate's
//! no-CLI-parsing-crate convention), starts a node, and runs it until
//! SIGINT/SIGTERM.

use std::process::ExitCode;

use consensus_node::config::{self, NodeConfig};
use consensus_node::node::Node;
use tracing::{error, info};

struct Args {
    node_id: String,
    host: String,
    port: u16,
    peers_json: String,
    vote_abort: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut positional = Vec::new();
    let mut peers_json = "{}".to_string();
    let mut vote_abort = false;

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--peers" => {
                peers_json = iter.next().ok_or("--peers requires a value")?;
            }
            "--vote-abort" => vote_abort = true,
            other => positional.push(other.to_string()),
        }
    }

    if positional.len() != 3 {
        return Err(format!(
            "usage: consensus_node <node_id> <host> <port> [--peers JSON] [--vote-abort] (got {} positional args)",
            positional.len()
        ));
    }
    let port: u16 = positional[2]
        .parse()
        .map_err(|_| format!("invalid port: {}", positional[2]))?;

    Ok(Args {
        node_id: positional[0].clone(),
        host: positional[1].clone(),
        port,
        peers_json,
        vote_abort,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let peers = match config::parse_peers_json(&args.peers_json) {
        Ok(peers) => peers,
        Err(e) => {
            eprintln!("invalid peers JSON: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut node_config = NodeConfig::new(&args.node_id, &args.host, args.port, peers);
    node_config.vote_commit = !args.vote_abort;
    if let Err(e) = node_config.validate() {
        eprintln!("invalid node configuration: {e}");
        return ExitCode::FAILURE;
    }

    let mut node = Node::new(node_config);
    if let Err(e) = node.start().await {
        error!(error = %e, "node failed to start");
        return ExitCode::FAILURE;
    }

    info!(node_id = %args.node_id, "consensus node running, waiting for SIGINT/SIGTERM");

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    node.stop();
    node.wait().await;
    ExitCode::SUCCESS
}
