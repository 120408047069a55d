//! One-shot handler invocation
//!
//! Usage:
//!   execgate-invoke <config.toml> [event.json | -]
//!
//! Reads a single event (from the file, or stdin when absent or `-`), runs the
//! adapter once, and prints the serverless response
//! `{"statusCode", "headers", "body"}` on stdout. Logs go to stderr.

use anyhow::{Context, Result};
use execgate::config::Config;
use execgate::handler::Handler;
use std::io::Read;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("execgate=info".parse().expect("valid log directive")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .context("usage: execgate-invoke <config.toml> [event.json | -]")?;
    let event_source = args.next();

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let raw = read_event(event_source.as_deref())?;
    let event: serde_json::Value =
        serde_json::from_str(&raw).context("Event is not valid JSON")?;

    let handler = Handler::from_config(&config)?;
    let response = handler.handle(&event).await;

    println!("{}", response.to_json());
    Ok(())
}

fn read_event(source: Option<&str>) -> Result<String> {
    match source {
        None | Some("-") => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("Failed to read event from stdin")?;
            Ok(raw)
        }
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read event file {}", path)),
    }
}
