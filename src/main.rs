//! `engine-bridge [config-path]`
//!
//! Line-delimited JSON over stdin/stdout. Each request line is handled on
//! the blocking pool so callback replies can arrive while a top-level
//! request is still waiting.

use std::path::PathBuf;
use std::sync::Arc;

use engine_bridge::bindings::{TransportRequest, TransportResponse};
use engine_bridge::config::BridgeConfig;
use engine_bridge::core::initialize_logging;
use engine_bridge::{BridgeError, BridgeServer};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

fn load_config() -> Result<BridgeConfig, BridgeError> {
    let (mut config, source) = match std::env::args().nth(1) {
        Some(path) => (BridgeConfig::from_file(&path)?, Some(PathBuf::from(path))),
        None => BridgeConfig::load_or_default(),
    };
    config.apply_env_overrides();
    config.validate()?;

    initialize_logging(&config.logging);
    match source {
        Some(path) => info!(target: "bridge", path = %path.display(), "Loaded configuration"),
        None => info!(target: "bridge", "Using default configuration"),
    }
    Ok(config)
}

async fn run() -> Result<(), BridgeError> {
    let config = load_config()?;
    let server = Arc::new(BridgeServer::new(config)?);

    let (tx, mut rx) = mpsc::unbounded_channel::<TransportResponse>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!(target: "bridge", error = %e, "Failed to serialize response");
                    continue;
                }
            };
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: TransportRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: "bridge", error = %e, "Ignoring malformed request line");
                continue;
            }
        };

        let server = Arc::clone(&server);
        let tx = tx.clone();
        tokio::task::spawn_blocking(move || {
            let TransportRequest { id, name, args } = request;
            let response = match server.handle(&name, args) {
                Ok(response) => response,
                Err(BridgeError::UnknownRequest(name)) => {
                    error!(target: "bridge", request = %name, "Unknown request");
                    std::process::exit(2);
                }
                Err(e) => json!({ "error": e.to_string() }),
            };
            let _ = tx.send(TransportResponse { id, response });
        });
    }

    info!(target: "bridge", "Input closed; shutting down");
    server.stop();
    drop(tx);
    let _ = writer.await;
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Engine bridge failed: {}", e);
        std::process::exit(1);
    }
}
