//! Periodic poll scheduler.
//!
//! Asks the poller for new revisions of every repository on an interval
//! and feeds them to each repository's build manager. No error escapes a
//! scheduler tick; a repository that fails to poll is retried on the
//! next one.

use std::time::Duration;

use bellows_core::client::PollerClient;
use bellows_core::context::Context;
use bellows_core::db::repository::{RepositoryRepo, RevisionRepo};
use bellows_core::manager::BuildManager;
use bellows_core::models::{Repository, Revision};
use bellows_core::Result;
use tokio::sync::watch;

/// Runs the poll loop until the shutdown signal flips.
pub async fn run(ctx: Context, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(ctx.settings.poll_interval_secs);
    tracing::info!("Poll scheduler started (interval {:?})", interval);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Poll scheduler received shutdown signal");
                    break;
                }
            }
            _ = tokio::time::sleep(interval) => {
                tick(&ctx).await;
            }
        }
    }

    tracing::info!("Poll scheduler stopped");
}

/// One scheduler tick: polls every repository.
pub async fn tick(ctx: &Context) {
    let repositories = match RepositoryRepo::list(&ctx.pool).await {
        Ok(repositories) => repositories,
        Err(e) => {
            tracing::error!("Failed to list repositories: {}", e);
            return;
        }
    };

    for repository in repositories {
        if let Err(e) = poll_repository(ctx, repository.clone()).await {
            tracing::error!("Failed to poll {}: {}", repository.url, e);
        }
    }
}

/// Polls one repository and adds builds for whatever revisions came back.
pub async fn poll_repository(ctx: &Context, repository: Repository) -> Result<()> {
    let mut client = PollerClient::connect(&ctx.settings).await?;
    let response = client.poll_repo(&ctx.pool, &repository, None).await?;

    let mut revisions = Vec::new();
    if let Some(entries) = response.get("revisions").and_then(|r| r.as_array()) {
        for entry in entries {
            match Revision::from_poller(repository.id.clone(), entry) {
                Ok(revision) => {
                    RevisionRepo::create(&ctx.pool, &revision).await?;
                    revisions.push(revision);
                }
                Err(e) => {
                    tracing::error!("Bad revision from poller for {}: {}", repository.url, e);
                }
            }
        }
    }

    if revisions.is_empty() {
        return Ok(());
    }

    tracing::info!(
        "{} new revisions for {}",
        revisions.len(),
        repository.url
    );
    let mut manager = BuildManager::new(ctx.clone(), repository);
    manager.add_builds(&revisions).await
}

/// Reschedules buildsets holding pending builds. Called once at process
/// start.
pub async fn recover_pending(ctx: &Context) {
    let repositories = match RepositoryRepo::list(&ctx.pool).await {
        Ok(repositories) => repositories,
        Err(e) => {
            tracing::error!("Failed to list repositories: {}", e);
            return;
        }
    };

    for repository in repositories {
        let mut manager = BuildManager::new(ctx.clone(), repository.clone());
        if let Err(e) = manager.start_pending().await {
            tracing::error!(
                "Failed to reschedule pending builds for {}: {}",
                repository.url,
                e
            );
        }
    }
}
