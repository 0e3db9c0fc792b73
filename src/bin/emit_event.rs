//! Emit Event Binary - publish one event envelope to the broker
//!
//! Smoke test for a deployment: the envelope is validated with the same
//! schema registry the worker uses, then published with the worker's
//! retry settings.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin emit_event -- event.json
//! cat event.json | cargo run --bin emit_event
//! cargo run --bin emit_event -- event.json --routing-key answer.generated
//! ```
//!
//! Broker settings are read from the same environment variables as
//! `dataset_worker`.

use rlvrflow::events::SchemaRegistry;
use rlvrflow::transport::{AmqpConnector, Transport, TransportSettings, TransportStats};
use rlvrflow::{CancellationToken, WorkerConfig};
use std::env;
use std::io::Read;
use std::sync::Arc;

struct EmitArgs {
    input: Option<String>,
    routing_key: Option<String>,
}

fn parse_args() -> EmitArgs {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut input = None;
    let mut routing_key = None;

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--routing-key" => routing_key = iter.next(),
            "-" => input = None,
            _ => input = Some(arg),
        }
    }

    EmitArgs { input, routing_key }
}

fn read_input(input: Option<&str>) -> std::io::Result<Vec<u8>> {
    match input {
        Some(path) => std::fs::read(path),
        None => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    dotenv::dotenv().ok();

    let args = parse_args();
    let config = WorkerConfig::from_env()?;

    let bytes = read_input(args.input.as_deref())?;
    let event = SchemaRegistry::standard().decode(&bytes)?;
    log::info!(
        "📨 Publishing {} (correlation_id: {}, event_id: {})",
        event.event_type(),
        event.correlation_id,
        event.event_id
    );

    let stats = Arc::new(TransportStats::new());
    let mut transport = Transport::new(
        Arc::new(AmqpConnector::new(config.broker.url.clone())),
        TransportSettings::from_config(&config.broker),
        stats.clone(),
        CancellationToken::new(),
    );

    let result = transport.publish(&event, args.routing_key.as_deref()).await;
    transport.close().await;
    result?;

    log::info!(
        "✅ Published after {} attempt(s)",
        stats.snapshot().publish_attempts
    );
    Ok(())
}
