use anyhow::{Context, Result};
use argp::FromArgs;
use buildrelay_core::{config::Config, env, models::BuildEvent};
use buildrelay_pubsub::PubSubClient;
use typed_path::Utf8NativePathBuf;

use crate::util::{native_path, parse_attributes};

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// Publish a build event to the configured topic, e.g. to drive a local emulator.
#[argp(subcommand, name = "publish")]
pub struct Args {
    #[argp(positional, from_str_fn(native_path))]
    /// build event JSON file
    event: Utf8NativePathBuf,
    #[argp(option, short = 'c', from_str_fn(native_path))]
    /// config file (default: $BUILDRELAY_CONFIG or config.yml)
    config: Option<Utf8NativePathBuf>,
    #[argp(option, short = 'a')]
    /// message attribute as key=value (repeatable)
    attribute: Vec<String>,
}

pub fn run(args: Args) -> Result<()> {
    let config_path = match &args.config {
        Some(path) => path.to_string(),
        None => std::env::var(env::CONFIG_PATH).unwrap_or_else(|_| "config.yml".to_string()),
    };
    let config = Config::load(&config_path)?;
    let data = std::fs::read(args.event.with_platform_encoding())
        .with_context(|| format!("Failed to read {}", args.event))?;
    // Catch typos before they reach the worker
    let event = BuildEvent::from_slice(&data).with_context(|| format!("Invalid {}", args.event))?;
    let attributes = parse_attributes(&args.attribute)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start runtime")?;
    let id = runtime.block_on(async {
        let client = PubSubClient::new(&config.pubsub)?;
        client.topic(&config.pubsub.topic).await?;
        let id = client.publish(&config.pubsub.topic, &data, attributes).await?;
        anyhow::Ok(id)
    })?;
    tracing::info!(status = event.status(), "Published message {id} to {}", config.pubsub.topic);
    Ok(())
}
