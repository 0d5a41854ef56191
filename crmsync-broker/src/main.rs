//! `crmsync-broker` -- lightweight topic broker for crmsync clients.
//!
//! An axum WebSocket server that authenticates clients by bearer token,
//! fans `/topic/...` messages out to their subscribers, and pushes
//! notifications posted to `/notify/{username}` to that user's sessions.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:9100 with one token
//! cargo run --bin crmsync-broker -- --token secret=alice
//!
//! # Push a notification to alice
//! curl -X POST localhost:9100/notify/alice -H 'content-type: application/json' \
//!     -d '{"id":1,"type":"TASK_NEW_COMMENT","params":{"task_description":"Call back"}}'
//! ```

use std::sync::Arc;

use clap::Parser;
use crmsync_broker::broker::{self, BrokerState};
use crmsync_broker::config::{BrokerCliArgs, BrokerConfig};

#[tokio::main]
async fn main() {
    let cli = BrokerCliArgs::parse();

    let config = match BrokerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    if config.tokens.is_empty() {
        tracing::warn!("no tokens configured, every connection will be rejected");
    }
    tracing::info!(addr = %config.bind_addr, tokens = config.tokens.len(), "starting crmsync broker");

    let state = Arc::new(BrokerState::with_config(config.tokens, config.max_body_size));

    match broker::start_server_with_state(&config.bind_addr, state).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "broker listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "broker server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    }
}
