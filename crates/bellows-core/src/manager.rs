//! BuildManager: turns revisions into buildsets and drives the
//! per-repository consumer loop.
//!
//! Each repository has its own FIFO of buildsets and at most one active
//! consumer. The consumer pops buildsets, assigns slaves and hands the
//! pending builds to a [`BuildExecuter`].

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::build_config::{self, BuilderConf};
use crate::context::Context;
use crate::db::{
    buildset::{BuildRepo, BuildSetRepo},
    repository::RevisionRepo,
};
use crate::error::{BellowsError, Result};
use crate::executer::BuildExecuter;
use crate::models::{
    Build, Builder, BuildSet, BuildSetStatus, BuildStatus, Repository, Revision,
};
use crate::signals::EventKind;
use crate::slave::Slave;

/// Controls which builds of one repository get executed, sequentially or
/// in parallel.
pub struct BuildManager {
    ctx: Context,
    pub repository: Repository,
}

impl BuildManager {
    pub fn new(ctx: Context, repository: Repository) -> Self {
        Self { ctx, repository }
    }

    /// Adds the builds for the given revisions to the repository queue.
    ///
    /// Revisions that opt out of builds are skipped. A revision without a
    /// build config gets a buildset in `no_config` status that is never
    /// queued. After all revisions, a notify-only-latest branch cancels
    /// the pending buildsets older than the newest one.
    pub async fn add_builds(&mut self, revisions: &[Revision]) -> Result<()> {
        let mut last_buildset: Option<BuildSet> = None;

        for revision in revisions {
            if !revision.create_builds() {
                continue;
            }

            let mut buildset = BuildSet::create(&self.ctx, &self.repository, revision).await?;

            let Some(raw_config) = &revision.config else {
                buildset
                    .update_status(&self.ctx.pool, Some(BuildSetStatus::NoConfig))
                    .await?;
                self.ctx.signals.send(
                    self.repository.id.clone(),
                    EventKind::BuildSetAdded,
                    json!({"id": buildset.id.to_string()}),
                );
                continue;
            };

            let conf = match build_config::load_config(raw_config) {
                Ok(conf) => conf,
                Err(e) => {
                    tracing::error!(
                        "Bad config for {} on {}: {}",
                        self.repository.id,
                        revision.commit,
                        e
                    );
                    serde_yaml::Value::Null
                }
            };

            let (builders, origin) = self.get_builders(revision, &conf).await?;
            self.add_builds_for_buildset(&mut buildset, &conf, Some((builders, origin)))
                .await?;
            last_buildset = Some(buildset);
        }

        if let Some(buildset) = last_buildset {
            if self.repository.notify_only_latest(&buildset.branch) {
                self.cancel_previous_pending(&buildset).await?;
            }
        }

        Ok(())
    }

    /// Resolves the builders for a revision from the build config.
    ///
    /// Returns the builders plus the branch they were derived from, which
    /// is the revision branch unless its config is empty and the revision
    /// declares a fallback. A malformed config logs and yields no
    /// builders.
    pub async fn get_builders(
        &self,
        revision: &Revision,
        conf: &serde_yaml::Value,
    ) -> Result<(Vec<Builder>, String)> {
        tracing::debug!(
            "Getting builders for {} on {}",
            self.repository.id,
            revision.commit
        );

        let mut origin = revision.branch.clone();
        let mut builders_conf =
            match build_config::list_builders_from_config(conf, &revision.branch) {
                Ok(confs) => confs,
                Err(e) => {
                    tracing::error!(
                        "Bad config for {} on {}: {}",
                        self.repository.id,
                        revision.commit,
                        e
                    );
                    return Ok((Vec::new(), origin));
                }
            };

        if builders_conf.is_empty() {
            if let Some(fallback) = &revision.builders_fallback {
                origin = fallback.clone();
                builders_conf =
                    match build_config::list_builders_from_config(conf, fallback) {
                        Ok(confs) => confs,
                        Err(e) => {
                            tracing::error!(
                                "Bad config for {} on {}: {}",
                                self.repository.id,
                                revision.commit,
                                e
                            );
                            return Ok((Vec::new(), origin));
                        }
                    };
            }
        }

        let builders_conf = filter_builders(
            builders_conf,
            &revision.builders_include,
            &revision.builders_exclude,
        );

        let mut builders = Vec::with_capacity(builders_conf.len());
        for (i, bconf) in builders_conf.iter().enumerate() {
            let mut builder = Builder::get_or_create(
                &self.ctx.pool,
                &self.repository.id,
                &bconf.name,
                i as i64,
            )
            .await?;
            builder.triggered_by = bconf.triggered_by.clone();
            builders.push(builder);
        }

        Ok((builders, origin))
    }

    /// Appends one build per builder to `buildset`, numbers them after
    /// the repository's highest build number, queues the buildset and
    /// wakes the consumer loop.
    pub async fn add_builds_for_buildset(
        &mut self,
        buildset: &mut BuildSet,
        conf: &serde_yaml::Value,
        builders: Option<(Vec<Builder>, String)>,
    ) -> Result<()> {
        let revision = RevisionRepo::get_by_id(&self.ctx.pool, &buildset.revision_id).await?;
        let (builders, origin) = match builders {
            Some(resolved) => resolved,
            None => self.get_builders(&revision, conf).await?,
        };

        let builder_names: Vec<&str> = builders.iter().map(|b| b.name.as_str()).collect();
        let mut last_build = BuildRepo::highest_number(&self.ctx.pool, &self.repository.id).await?;

        for builder in &builders {
            last_build += 1;
            let mut build = Build::new(
                self.repository.id.clone(),
                buildset.id.clone(),
                builder,
                &revision.branch,
                &revision.commit,
                last_build,
                Some(origin.clone()),
                revision.external.clone(),
            );
            // Rules pointing at builders excluded from this buildset
            // would deadlock the build; drop them before it is persisted.
            build
                .triggered_by
                .retain(|rule| builder_names.contains(&rule.builder_name.as_str()));

            buildset.add_build(&self.ctx, build).await?;
            tracing::debug!(
                "build {} added for named_tree {} on branch {}",
                last_build,
                revision.commit,
                revision.branch
            );
        }

        self.ctx
            .queue_push(&self.repository.id, buildset.id.clone());
        // The buildset-added signal goes out here, once all build
        // information is in place.
        self.ctx.signals.send(
            self.repository.id.clone(),
            EventKind::BuildSetAdded,
            json!({"id": buildset.id.to_string()}),
        );

        if !self.ctx.is_building(&self.repository.id) {
            self.launch_consumer();
        }
        Ok(())
    }

    /// Cancels one build by uuid. A build already in a terminal status is
    /// logged and left alone.
    pub async fn cancel_build(&self, build_uuid: &Uuid) -> Result<()> {
        let mut build = Build::get(&self.ctx.pool, build_uuid).await?;
        match build.cancel(&self.ctx).await {
            Ok(_) => Ok(()),
            Err(BellowsError::ImpossibleCancellation) => {
                tracing::warn!("Could not cancel build {}", build_uuid);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Cancels the builds of every buildset on this buildset's branch
    /// created before it that still has pending or running builds.
    pub async fn cancel_previous_pending(&self, buildset: &BuildSet) -> Result<()> {
        let earlier = BuildSetRepo::previous_with_active_builds(
            &self.ctx.pool,
            &self.repository.id,
            &buildset.branch,
            &buildset.created,
        )
        .await?;

        for buildset_id in earlier {
            let older = BuildSet::get(&self.ctx.pool, &buildset_id).await?;
            for build in &older.builds {
                let mut build = build.clone();
                match build.cancel(&self.ctx).await {
                    Ok(_) | Err(BellowsError::ImpossibleCancellation) => {}
                    Err(e) => {
                        tracing::error!("Error cancelling build {}: {}", build.uuid, e)
                    }
                }
            }
        }
        Ok(())
    }

    /// Schedules the buildsets that still hold pending builds and are not
    /// already queued. Called at process start.
    pub async fn start_pending(&mut self) -> Result<()> {
        let pending =
            BuildSetRepo::with_pending_builds(&self.ctx.pool, &self.repository.id).await?;

        let mut scheduled = false;
        for buildset_id in pending {
            if self.ctx.queue_contains(&self.repository.id, &buildset_id) {
                continue;
            }
            tracing::debug!(
                "scheduling pending buildset {} for {}",
                buildset_id,
                self.repository.id
            );
            self.ctx.queue_push(&self.repository.id, buildset_id);
            scheduled = true;
        }

        if scheduled && !self.ctx.is_building(&self.repository.id) {
            self.launch_consumer();
        }
        Ok(())
    }

    fn launch_consumer(&self) {
        let ctx = self.ctx.clone();
        let repository = self.repository.clone();
        self.ctx.tasks.spawn(async move {
            let repo_id = repository.id.clone();
            let mut manager = BuildManager::new(ctx, repository);
            if let Err(e) = manager.execute_builds().await {
                tracing::error!("Error executing builds for {}: {}", repo_id, e);
            }
        });
    }

    /// The consumer loop: drains this repository's buildset queue,
    /// running the pending builds of each buildset. On exit, idle
    /// on-demand slaves are stopped.
    pub async fn execute_builds(&mut self) -> Result<bool> {
        tracing::debug!("executing builds for {}", self.repository.id);

        let slaves = self.repository.slaves(&self.ctx.pool).await?;
        if slaves.is_empty() {
            tracing::debug!("No slaves. Can't execute builds.");
            return Ok(false);
        }

        self.ctx.set_is_building(&self.repository.id, true);
        let result = self.consume_queue().await;
        self.ctx.set_is_building(&self.repository.id, false);

        // Reload the slaves for fresh queue counters before deciding to
        // stop their instances.
        match self.repository.slaves(&self.ctx.pool).await {
            Ok(slaves) => {
                for slave in slaves {
                    if let Err(e) = slave.stop_instance(&self.ctx).await {
                        tracing::error!("Error stopping instance of {}: {}", slave.name, e);
                    }
                }
            }
            Err(e) => tracing::error!("Error listing slaves to stop: {}", e),
        }

        result?;
        Ok(true)
    }

    async fn consume_queue(&mut self) -> Result<()> {
        while let Some(buildset_id) = self.ctx.queue_pop(&self.repository.id) {
            let mut buildset = BuildSet::get(&self.ctx.pool, &buildset_id).await?;

            let mut to_run = Vec::new();
            for build in &buildset.builds {
                // Reload for the current status (e.g. cancelled from
                // outside while queued).
                let mut build = Build::get(&self.ctx.pool, &build.uuid).await?;
                self.set_slave(&mut build).await?;
                if build.status == BuildStatus::Pending {
                    to_run.push(build);
                }
            }

            if to_run.is_empty() {
                continue;
            }

            self.set_started_for_buildset(&mut buildset).await?;
            let executer = BuildExecuter::new(&self.ctx, &self.repository, to_run);
            executer.execute().await?;
            self.set_finished_for_buildset(&buildset).await?;
            tracing::debug!("builds for {} finished", self.repository.id);
        }
        Ok(())
    }

    /// Assigns the repository slave with the smallest queue to `build`.
    /// The repository must have at least one slave.
    async fn set_slave(&self, build: &mut Build) -> Result<Slave> {
        let slaves = self.repository.slaves(&self.ctx.pool).await?;
        let mut slave = slaves.into_iter().next().ok_or_else(|| {
            BellowsError::SlaveNotFound(format!("No slave found for {}", self.repository.id))
        })?;
        build.set_slave(&self.ctx, &mut slave).await?;
        Ok(slave)
    }

    async fn set_started_for_buildset(&mut self, buildset: &mut BuildSet) -> Result<()> {
        if buildset.started.is_some() {
            return Ok(());
        }

        buildset.started = Some(Utc::now());
        buildset.status = BuildSetStatus::Running;
        BuildSetRepo::save(&self.ctx.pool, buildset).await?;
        self.ctx.signals.send(
            self.repository.id.clone(),
            EventKind::BuildSetStarted,
            json!({"id": buildset.id.to_string()}),
        );
        buildset
            .notify(&self.ctx, EventKind::BuildSetStarted, Some(BuildSetStatus::Running))
            .await;
        self.repository
            .set_latest_buildset(&self.ctx.pool, &buildset.id)
            .await?;
        tracing::info!("Buildset {} started", buildset.id);
        Ok(())
    }

    async fn set_finished_for_buildset(&mut self, buildset: &BuildSet) -> Result<()> {
        // Reload so the aggregate status sees what the builds became.
        let mut buildset = BuildSet::get(&self.ctx.pool, &buildset.id).await?;

        let just_now = Utc::now();
        if buildset.finished.is_none() || buildset.finished < Some(just_now) {
            buildset.finished = Some(just_now);
            buildset.total_time = buildset
                .started
                .map(|started| (just_now - started).num_seconds());
            BuildSetRepo::save(&self.ctx.pool, &buildset).await?;
            buildset.update_status(&self.ctx.pool, None).await?;
            self.ctx.signals.send(
                self.repository.id.clone(),
                EventKind::BuildSetFinished,
                json!({"id": buildset.id.to_string()}),
            );
            buildset
                .notify(&self.ctx, EventKind::BuildSetFinished, None)
                .await;
            self.repository
                .set_latest_buildset(&self.ctx.pool, &buildset.id)
                .await?;
            tracing::info!("Buildset {} finished", buildset.id);
        }
        Ok(())
    }
}

fn filter_builders(
    builders_conf: Vec<BuilderConf>,
    include: &[String],
    exclude: &[String],
) -> Vec<BuilderConf> {
    if !include.is_empty() {
        builders_conf
            .into_iter()
            .filter(|b| include.contains(&b.name))
            .collect()
    } else if !exclude.is_empty() {
        builders_conf
            .into_iter()
            .filter(|b| !exclude.contains(&b.name))
            .collect()
    } else {
        builders_conf
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::models::{BranchConfig, BuildSetId};
    use crate::notifications::MemoryExchange;
    use crate::test_support::{
        mock_slave_server, seed_buildset, seed_repository, seed_repository_with_branches,
        seed_revision, seed_slave, test_context,
    };

    fn success_frames() -> Vec<Value> {
        vec![
            json!({"info_type": "build_info", "status": "running",
                   "started": null, "finished": null, "steps": []}),
            json!({"info_type": "build_info", "status": "success",
                   "started": null, "finished": null, "total_time": 0}),
        ]
    }

    fn fail_frames() -> Vec<Value> {
        vec![
            json!({"info_type": "build_info", "status": "running",
                   "started": null, "finished": null, "steps": []}),
            json!({"info_type": "build_info", "status": "fail",
                   "started": null, "finished": null, "total_time": 0}),
        ]
    }

    async fn wait_buildset_terminal(ctx: &Context, buildset_id: &BuildSetId) -> BuildSet {
        for _ in 0..200 {
            let buildset = BuildSet::get(&ctx.pool, buildset_id).await.unwrap();
            let done = !buildset.builds.is_empty()
                && buildset.builds.iter().all(|b| b.status.is_terminal())
                && buildset.finished.is_some();
            if done {
                return buildset;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("buildset {} did not finish in time", buildset_id);
    }

    fn event_types(exchange: &MemoryExchange) -> Vec<String> {
        exchange
            .messages()
            .iter()
            .filter_map(|m| m["event_type"].as_str().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_add_builds_runs_buildset_to_success() {
        let (ctx, notifications, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let port = mock_slave_server(vec![success_frames(), success_frames()]).await;
        seed_slave(&ctx, &repo, "127.0.0.1", port).await;
        let revision = seed_revision(
            &ctx,
            &repo,
            "master",
            Some("builders:\n  - name: a\n  - name: b\n"),
        )
        .await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();

        let ids = BuildSetRepo::list_ids_for_repository(&ctx.pool, &repo.id)
            .await
            .unwrap();
        let buildset = wait_buildset_terminal(&ctx, &ids[0]).await;
        // Let the trailing buildset-finished publication land.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(buildset.number, 1);
        assert_eq!(buildset.builds.len(), 2);
        assert_eq!(buildset.builds[0].number, 1);
        assert_eq!(buildset.builds[1].number, 2);
        assert_eq!(buildset.status, BuildSetStatus::Success);
        assert!(buildset.total_time.is_some());

        let events = event_types(&notifications);
        assert_eq!(events[0], "buildset-added");
        assert_eq!(events.last().unwrap(), "buildset-finished");
        let started_pos = events.iter().position(|e| e == "buildset-started").unwrap();
        let build_started: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| *e == "build-started")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(build_started.len(), 2);
        assert!(build_started.iter().all(|pos| *pos > started_pos));
        assert_eq!(events.iter().filter(|e| *e == "build-finished").count(), 2);
    }

    #[tokio::test]
    async fn test_add_builds_triggered_build_cancelled_on_fail() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let port = mock_slave_server(vec![fail_frames()]).await;
        seed_slave(&ctx, &repo, "127.0.0.1", port).await;
        let config = "builders:\n  - name: a\n  - name: b\n    triggered_by:\n      - builder_name: a\n        statuses: [success]\n";
        let revision = seed_revision(&ctx, &repo, "master", Some(config)).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();

        let ids = BuildSetRepo::list_ids_for_repository(&ctx.pool, &repo.id)
            .await
            .unwrap();
        let buildset = wait_buildset_terminal(&ctx, &ids[0]).await;

        assert_eq!(buildset.builds[0].status, BuildStatus::Fail);
        // b never ran: its trigger can't be satisfied anymore.
        assert_eq!(buildset.builds[1].status, BuildStatus::Cancelled);
        let full_b = Build::get(&ctx.pool, &buildset.builds[1].uuid).await.unwrap();
        assert!(full_b.steps.is_empty());
        // Cancelled outranks fail in the aggregate priority order.
        assert_eq!(buildset.status, BuildSetStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_add_builds_no_config_is_not_queued() {
        let (ctx, notifications, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        seed_slave(&ctx, &repo, "127.0.0.1", 7777).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();
        // Let the fire-and-forget notification land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(ctx.queue_len(&repo.id), 0);
        let events = event_types(&notifications);
        assert_eq!(events, vec!["buildset-added"]);
    }

    #[tokio::test]
    async fn test_skipped_revision_creates_nothing() {
        let (ctx, notifications, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let mut revision = seed_revision(&ctx, &repo, "master", None).await;
        revision.body = "small fix\n\nci: skip".to_string();

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();

        assert!(notifications.messages().is_empty());
        assert_eq!(ctx.queue_len(&repo.id), 0);
    }

    #[tokio::test]
    async fn test_build_numbers_are_monotone_across_buildsets() {
        let (ctx, _, _) = test_context().await;
        // No slaves: builds stay pending, only numbering matters here.
        let repo = seed_repository(&ctx, 0).await;
        let config = "builders:\n  - name: a\n  - name: b\n";
        let rev1 = seed_revision(&ctx, &repo, "master", Some(config)).await;
        let rev2 = seed_revision(&ctx, &repo, "master", Some(config)).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[rev1]).await.unwrap();
        manager.add_builds(&[rev2]).await.unwrap();

        let pending = BuildSetRepo::with_pending_builds(&ctx.pool, &repo.id)
            .await
            .unwrap();
        let mut numbers = Vec::new();
        for buildset_id in &pending {
            let buildset = BuildSet::get(&ctx.pool, buildset_id).await.unwrap();
            numbers.extend(buildset.builds.iter().map(|b| b.number));
        }
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_malformed_config_leaves_buildset_without_builds() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        seed_slave(&ctx, &repo, "127.0.0.1", 7777).await;
        let revision = seed_revision(&ctx, &repo, "master", Some("builders: nope\n")).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();

        let ids = BuildSetRepo::list_ids_for_repository(&ctx.pool, &repo.id)
            .await
            .unwrap();
        let buildset = BuildSet::get(&ctx.pool, &ids[0]).await.unwrap();
        assert!(buildset.builds.is_empty());
        assert_eq!(buildset.get_status(), BuildSetStatus::NoBuilds);
    }

    #[tokio::test]
    async fn test_triggered_by_filtered_to_known_builders() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let config = "builders:\n  - name: a\n  - name: b\n    triggered_by:\n      - builder_name: zz\n        statuses: [success]\n";
        let revision = seed_revision(&ctx, &repo, "master", Some(config)).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.add_builds(&[revision]).await.unwrap();

        let pending = BuildSetRepo::with_pending_builds(&ctx.pool, &repo.id)
            .await
            .unwrap();
        let buildset = BuildSet::get(&ctx.pool, &pending[0]).await.unwrap();
        // The rule pointed at a builder that is not part of the buildset;
        // keeping it would deadlock the build.
        assert!(buildset.builds[1].triggered_by.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_previous_pending_spares_the_newest() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository_with_branches(
            &ctx,
            0,
            vec![BranchConfig {
                name: "main".to_string(),
                notify_only_latest: true,
                builders_fallback: None,
            }],
        )
        .await;

        let rev1 = seed_revision(&ctx, &repo, "main", None).await;
        let rev2 = seed_revision(&ctx, &repo, "main", None).await;
        let rev3 = seed_revision(&ctx, &repo, "main", None).await;
        let bs1 = seed_buildset(&ctx, &repo, &rev1, &["a"]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let bs2 = seed_buildset(&ctx, &repo, &rev2, &["a"]).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let bs3 = seed_buildset(&ctx, &repo, &rev3, &["a"]).await;

        let manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.cancel_previous_pending(&bs3).await.unwrap();

        let stored1 = BuildSet::get(&ctx.pool, &bs1.id).await.unwrap();
        let stored2 = BuildSet::get(&ctx.pool, &bs2.id).await.unwrap();
        let stored3 = BuildSet::get(&ctx.pool, &bs3.id).await.unwrap();
        assert_eq!(stored1.builds[0].status, BuildStatus::Cancelled);
        assert_eq!(stored2.builds[0].status, BuildStatus::Cancelled);
        assert_eq!(stored3.builds[0].status, BuildStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_build_from_terminal_is_impossible() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;
        let buildset = seed_buildset(&ctx, &repo, &revision, &["a"]).await;

        let mut build = Build::get(&ctx.pool, &buildset.builds[0].uuid).await.unwrap();
        build.status = BuildStatus::Success;
        build.update(&ctx.pool).await.unwrap();

        let mut build = Build::get(&ctx.pool, &build.uuid).await.unwrap();
        let err = build.cancel(&ctx).await.unwrap_err();
        assert!(matches!(err, BellowsError::ImpossibleCancellation));

        // The manager swallows it.
        let manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.cancel_build(&build.uuid).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_pending_queues_unqueued_buildsets() {
        let (ctx, _, _) = test_context().await;
        // No slaves, so the consumer gives up and the queue is observable.
        let repo = seed_repository(&ctx, 0).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;
        let buildset = seed_buildset(&ctx, &repo, &revision, &["a"]).await;

        let mut manager = BuildManager::new(ctx.clone(), repo.clone());
        manager.start_pending().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(ctx.queue_contains(&repo.id, &buildset.id));

        // A second call does not queue it twice.
        manager.start_pending().await.unwrap();
        assert_eq!(ctx.queue_len(&repo.id), 1);
    }

    #[test]
    fn test_filter_builders_include_wins() {
        let confs = vec![
            BuilderConf {
                name: "a".to_string(),
                triggered_by: vec![],
            },
            BuilderConf {
                name: "b".to_string(),
                triggered_by: vec![],
            },
        ];

        let filtered = filter_builders(
            confs.clone(),
            &["a".to_string()],
            &["a".to_string(), "b".to_string()],
        );
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");

        let filtered = filter_builders(confs.clone(), &[], &["b".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "a");

        let filtered = filter_builders(confs, &[], &[]);
        assert_eq!(filtered.len(), 2);
    }
}
