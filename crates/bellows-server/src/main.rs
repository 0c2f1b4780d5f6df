use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod scheduler;

use bellows_core::config::Settings;
use bellows_core::context::Context;
use bellows_core::db::{create_pool, run_migrations};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present; real environment wins.
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();

    match cli.command.unwrap_or_default() {
        Commands::Check => check(settings).await,
        Commands::Run => run(settings).await,
    }
}

async fn check(settings: Settings) -> Result<()> {
    let pool = create_pool(&settings.database_url).await?;
    run_migrations(&pool).await?;
    println!("configuration ok");
    Ok(())
}

async fn run(settings: Settings) -> Result<()> {
    tracing::info!("bellowsd {} starting", bellows_core::VERSION);

    let pool = create_pool(&settings.database_url).await?;
    run_migrations(&pool).await?;
    let ctx = Context::new(pool, settings);

    // Buildsets interrupted by the last shutdown go back on their queues.
    scheduler::recover_pending(&ctx).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_ctx = ctx.clone();
    let scheduler_handle =
        tokio::spawn(async move { scheduler::run(scheduler_ctx, shutdown_rx).await });

    wait_for_shutdown().await;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    scheduler_handle.await?;

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
