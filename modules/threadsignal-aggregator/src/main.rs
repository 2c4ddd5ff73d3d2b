use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use threadsignal_aggregator::{Aggregator, Config, Platform, ThreadReference, ThreadRequest};

const USAGE: &str = "usage: threadsignal <platform> <id-or-url> | threadsignal <url>";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("threadsignal=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env()?;
    config.log_redacted();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let reference = match args.as_slice() {
        [url] => ThreadReference::parse(url)?,
        [platform, target] => ThreadReference::new(platform.parse::<Platform>()?, target.as_str()),
        _ => bail!(USAGE),
    };
    let mut request = ThreadRequest::new(reference);
    if let Some(max_nodes) = config.max_nodes {
        request = request.max_nodes(max_nodes);
    }

    let aggregator = Aggregator::from_config(&config)?;

    // Ctrl-C stops new work; whatever was collected is still printed.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, returning partial thread");
            on_signal.cancel();
        }
    });

    let result = aggregator.aggregate(request, cancel).await?;
    info!(
        nodes = result.total_nodes_processed,
        may_be_incomplete = result.may_be_incomplete,
        "Done"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
