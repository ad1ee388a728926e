//! `synapse up` — start the engine and HTTP API.

use anyhow::{Context, Result};
use clap::ArgMatches;
use tracing_subscriber::EnvFilter;

use synapse_engine::{Config, MemoryJobQueue, SynapseRuntime};

pub async fn run(matches: &ArgMatches) -> Result<()> {
    let mut config = Config::from_env().context("loading configuration")?;

    if let Some(port) = matches.get_one::<String>("port") {
        config.api.port = port.parse().context("parsing --port")?;
    }
    if matches.get_flag("in-memory") {
        config.store.in_memory = true;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let embedded_queue = matches.get_flag("embedded-queue");
    let runtime = if embedded_queue {
        let (queue, receiver) = MemoryJobQueue::new();
        let runtime = SynapseRuntime::builder(config)
            .with_queue(queue)
            .build()
            .context("building runtime")?;
        tokio::spawn(std::sync::Arc::clone(&runtime).run_worker(receiver));
        runtime
    } else {
        SynapseRuntime::new(config).context("building runtime")?
    };

    let background = runtime.spawn_background();
    tracing::info!(
        embedded_queue,
        tasks = background.len(),
        "engine started, serving HTTP API"
    );

    synapse_engine::api::serve(runtime).await?;
    Ok(())
}
