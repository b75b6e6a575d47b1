use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use mq_chat_router::{
    cli::{Cli, Command, RouterArgs, SimArgs},
    client,
    router::Router,
    sim,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Router(args) => run_router(args).await?,
        Command::Client(args) => client::run(args).await?,
        Command::Sim(args) => run_sim(args).await?,
    }

    Ok(())
}

async fn run_router(args: RouterArgs) -> Result<()> {
    let transport = args.queue.open()?;
    let router = Router::new(Arc::clone(&transport), args.config())?;
    let handle = router.spawn()?;
    info!(key_path = %args.queue.key_path.display(), "router listening, press ctrl-c to stop");

    // Removing the queue wakes the blocked receiver, which then drains.
    let closer = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(?error, "ctrl-c handler failed");
            }
            info!("shutting down router");
            if let Err(error) = transport.close() {
                warn!(%error, "failed to remove message queue");
            }
        })
    };

    let outcome = tokio::task::spawn_blocking(move || handle.wait())
        .await
        .context("router task failed")?;
    closer.abort();

    if let Err(error) = transport.close() {
        warn!(%error, "failed to remove message queue");
    }
    outcome
}

async fn run_sim(args: SimArgs) -> Result<()> {
    let config = args.config();
    let report = if args.in_process {
        tokio::task::spawn_blocking(move || sim::run_in_process(&config, Default::default()))
            .await
            .context("simulation task failed")??
    } else {
        let transport = args.queue.open()?;
        tokio::task::spawn_blocking(move || sim::run(transport, &config))
            .await
            .context("simulation task failed")??
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{report}");
    }
    if !report.is_complete() {
        warn!(
            received = report.received,
            expected = report.expected,
            "simulation finished with missing deliveries"
        );
    }
    Ok(())
}
