//! BuildExecuter: concurrent execution of one buildset's builds.
//!
//! The executer decides which builds may start right now, under two
//! constraints: the repository's parallel_builds cap and each build's
//! trigger rules. Builds whose rules can never be satisfied are
//! cancelled. Statuses changed from outside (an external cancel) are
//! picked up by reloading the buildset after every admission pass.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::context::{Context, MAX_PROCESS_TASKS};
use crate::error::{BellowsError, Result};
use crate::models::{Build, BuildSet, BuildStatus, Readiness, Repository, RepositoryId};
use crate::slave::Slave;

/// How often `execute` polls for the internal queue to drain.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs the builds of one buildset.
pub struct BuildExecuter {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Context,
    repository_id: RepositoryId,
    /// The input build list. Admission passes iterate it; the queue below
    /// tracks which of them still wait or run.
    builds: Vec<Build>,
    queue: Mutex<Vec<Uuid>>,
    /// Builds already handed to a worker, so an admission pass never
    /// launches the same build twice.
    launched: Mutex<HashSet<Uuid>>,
    running: AtomicUsize,
}

impl BuildExecuter {
    pub fn new(ctx: &Context, repository: &Repository, builds: Vec<Build>) -> Self {
        let queue = builds.iter().map(|b| b.uuid).collect();
        Self {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                repository_id: repository.id.clone(),
                builds,
                queue: Mutex::new(queue),
                launched: Mutex::new(HashSet::new()),
                running: AtomicUsize::new(0),
            }),
        }
    }

    /// Schedules the first admission pass and waits until every build
    /// left the internal queue.
    pub async fn execute(&self) -> Result<bool> {
        tracing::debug!("Executing builds for {}", self.inner.repository_id);
        schedule_admission(&self.inner);

        while !self.inner.queue.lock().unwrap().is_empty() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            // With nothing in flight only a new admission pass can move
            // the queue, so keep one coming.
            if self.inner.running.load(Ordering::SeqCst) == 0 {
                schedule_admission(&self.inner);
            }
        }

        tracing::debug!("Builds for {} done!", self.inner.repository_id);
        Ok(true)
    }

    #[cfg(test)]
    fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }
}

fn schedule_admission(inner: &Arc<Inner>) {
    let inner = inner.clone();
    let tasks = inner.ctx.tasks.clone();
    tasks.spawn(async move {
        if let Err(e) = admission_pass(&inner).await {
            tracing::error!(
                "Admission pass failed for {}: {}",
                inner.repository_id,
                e
            );
        }
    });
}

/// One admission pass: re-reads the repository for its live
/// parallel_builds value and starts every build that is ready and under
/// the cap. Builds whose trigger rules became unsatisfiable are
/// cancelled and dropped.
async fn admission_pass(inner: &Arc<Inner>) -> Result<()> {
    let repository = Repository::get(&inner.ctx.pool, &inner.repository_id).await?;

    for build in &inner.builds {
        if !inner.queue.lock().unwrap().contains(&build.uuid) {
            continue;
        }
        if inner.launched.lock().unwrap().contains(&build.uuid) {
            continue;
        }

        let mut build = build.clone();
        match build.is_ready2run(&inner.ctx.pool).await? {
            Readiness::Ready => {
                // Advisory process-wide cap on concurrent stream sessions.
                if inner.ctx.running_builds() >= MAX_PROCESS_TASKS {
                    continue;
                }
                // Admission passes may overlap; the cap bump and the
                // launched-set insert are what decide the winner.
                if !try_admit(inner, repository.parallel_builds) {
                    continue;
                }
                if !inner.launched.lock().unwrap().insert(build.uuid) {
                    inner.running.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }

                let worker_inner = inner.clone();
                inner.ctx.tasks.spawn(async move {
                    run_build(worker_inner, build).await;
                });
            }
            Readiness::Impossible => {
                if let Err(e) = build.cancel(&inner.ctx).await {
                    tracing::warn!("Could not cancel untriggerable build {}: {}", build.uuid, e);
                }
                inner.queue.lock().unwrap().retain(|uuid| uuid != &build.uuid);
            }
            Readiness::NotReady => {}
        }
    }

    handle_queue_changes(inner).await
}

/// Reserves a running slot. With a cap, the increment only happens while
/// the count is under it.
fn try_admit(inner: &Arc<Inner>, parallel_builds: i64) -> bool {
    if parallel_builds == 0 {
        inner.running.fetch_add(1, Ordering::SeqCst);
        return true;
    }
    inner
        .running
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |running| {
            if (running as i64) < parallel_builds {
                Some(running + 1)
            } else {
                None
            }
        })
        .is_ok()
}

/// Build statuses may be changed from outside (e.g. a build was
/// cancelled); drop those builds from the internal queue.
async fn handle_queue_changes(inner: &Arc<Inner>) -> Result<()> {
    let Some(first) = inner.builds.first() else {
        return Ok(());
    };

    let buildset = BuildSet::get(&inner.ctx.pool, &first.buildset_id).await?;
    for build in &buildset.builds {
        let queued = matches!(
            build.status,
            BuildStatus::Pending | BuildStatus::Preparing | BuildStatus::Running
        );
        if !queued {
            inner.queue.lock().unwrap().retain(|uuid| uuid != &build.uuid);
        }
    }
    Ok(())
}

/// Runs one build on its slave, turning any failure into a terminal
/// exception status, then schedules a follow-up admission pass.
async fn run_build(inner: Arc<Inner>, mut build: Build) {
    inner.ctx.add_running_build();

    if let Err(e) = dispatch_to_slave(&inner, &mut build).await {
        let trace = e.to_string();
        tracing::debug!("Build {} raised: {}", build.uuid, trace);
        if let Err(persist) = build
            .set_unknown_exception(&inner.ctx.pool, &trace)
            .await
        {
            tracing::error!(
                "Failed to persist exception for build {}: {}",
                build.uuid,
                persist
            );
        }
    }

    inner.queue.lock().unwrap().retain(|uuid| uuid != &build.uuid);
    inner.ctx.remove_running_build();
    inner.running.fetch_sub(1, Ordering::SeqCst);
    schedule_admission(&inner);
}

async fn dispatch_to_slave(inner: &Arc<Inner>, build: &mut Build) -> Result<()> {
    let slave_id = build.slave_id.clone().ok_or_else(|| {
        BellowsError::SlaveNotFound(format!("build {} has no slave assigned", build.uuid))
    })?;
    let mut slave = Slave::get(&inner.ctx.pool, &slave_id).await?;
    let repository = Repository::get(&inner.ctx.pool, &inner.repository_id).await?;

    let mut envvars = repository.envvars.clone();
    if build.external.is_none() {
        // A failing secrets service must not block builds; they proceed
        // with an empty secret set.
        match repository.get_secrets(&inner.ctx.settings).await {
            Ok(secrets) => envvars.extend(secrets),
            Err(e) => {
                tracing::error!("{}", e);
                tracing::error!("secrets not available");
            }
        }
    }

    slave.build(&inner.ctx, build, envvars).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use serde_json::json;

    use super::*;
    use crate::models::{BuildSet, BuildSetStatus, BuildTrigger};
    use crate::test_support::{
        mock_slave_server, mock_slave_server_with_delay, seed_buildset, seed_repository,
        seed_revision, seed_slave, test_context,
    };

    fn success_frames() -> Vec<serde_json::Value> {
        vec![
            json!({"info_type": "build_info", "status": "running",
                   "started": null, "finished": null, "steps": []}),
            json!({"info_type": "build_info", "status": "success",
                   "started": null, "finished": null, "total_time": 0}),
        ]
    }

    fn fail_frames() -> Vec<serde_json::Value> {
        vec![
            json!({"info_type": "build_info", "status": "running",
                   "started": null, "finished": null, "steps": []}),
            json!({"info_type": "build_info", "status": "fail",
                   "started": null, "finished": null, "total_time": 0}),
        ]
    }

    #[tokio::test]
    async fn test_parallel_builds_cap_is_respected() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 1).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;
        let buildset = seed_buildset(&ctx, &repo, &revision, &["a", "b", "c"]).await;

        // One slave per build so the cap, not the slave lock, is what
        // bounds concurrency.
        let mut builds = Vec::new();
        for build in &buildset.builds {
            let port = mock_slave_server_with_delay(vec![success_frames()], 200).await;
            let mut slave = seed_slave(&ctx, &repo, "127.0.0.1", port).await;
            let mut build = Build::get(&ctx.pool, &build.uuid).await.unwrap();
            build.set_slave(&ctx, &mut slave).await.unwrap();
            builds.push(build);
        }

        let executer = BuildExecuter::new(&ctx, &repo, builds);
        let done = AtomicBool::new(false);
        let mut max_running = 0;

        let run = async {
            executer.execute().await.unwrap();
            done.store(true, Ordering::SeqCst);
        };
        let sample = async {
            while !done.load(Ordering::SeqCst) {
                max_running = max_running.max(executer.running());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::join!(run, sample);

        assert_eq!(max_running, 1);

        let stored = BuildSet::get(&ctx.pool, &buildset.id).await.unwrap();
        assert!(stored
            .builds
            .iter()
            .all(|b| b.status == BuildStatus::Success));
    }

    #[tokio::test]
    async fn test_unsatisfiable_trigger_cancels_build() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;
        let buildset = seed_buildset(&ctx, &repo, &revision, &["a", "b"]).await;

        let port = mock_slave_server(vec![fail_frames()]).await;
        let mut slave = seed_slave(&ctx, &repo, "127.0.0.1", port).await;

        let mut build_a = Build::get(&ctx.pool, &buildset.builds[0].uuid).await.unwrap();
        build_a.set_slave(&ctx, &mut slave).await.unwrap();

        let mut build_b = Build::get(&ctx.pool, &buildset.builds[1].uuid).await.unwrap();
        build_b.triggered_by = vec![BuildTrigger {
            builder_name: "a".to_string(),
            statuses: vec![BuildStatus::Success],
        }];
        build_b.update(&ctx.pool).await.unwrap();
        build_b.set_slave(&ctx, &mut slave).await.unwrap();

        let executer = BuildExecuter::new(&ctx, &repo, vec![build_a, build_b]);
        executer.execute().await.unwrap();

        let stored = BuildSet::get(&ctx.pool, &buildset.id).await.unwrap();
        assert_eq!(stored.builds[0].status, BuildStatus::Fail);
        assert_eq!(stored.builds[1].status, BuildStatus::Cancelled);
        // Cancelled outranks fail in the aggregate priority order.
        assert_eq!(stored.get_status(), BuildSetStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_externally_cancelled_build_leaves_the_queue() {
        let (ctx, _, _) = test_context().await;
        let repo = seed_repository(&ctx, 0).await;
        let revision = seed_revision(&ctx, &repo, "master", None).await;
        let buildset = seed_buildset(&ctx, &repo, &revision, &["a", "b"]).await;

        let port = mock_slave_server(vec![success_frames()]).await;
        let mut slave = seed_slave(&ctx, &repo, "127.0.0.1", port).await;

        let mut build_a = Build::get(&ctx.pool, &buildset.builds[0].uuid).await.unwrap();
        build_a.set_slave(&ctx, &mut slave).await.unwrap();

        // Cancelled from outside before the executer ever saw it.
        let mut build_b = Build::get(&ctx.pool, &buildset.builds[1].uuid).await.unwrap();
        build_b.status = BuildStatus::Cancelled;
        build_b.update(&ctx.pool).await.unwrap();

        let executer = BuildExecuter::new(&ctx, &repo, vec![build_a, build_b]);
        executer.execute().await.unwrap();

        let stored = BuildSet::get(&ctx.pool, &buildset.id).await.unwrap();
        assert_eq!(stored.builds[0].status, BuildStatus::Success);
        assert_eq!(stored.builds[1].status, BuildStatus::Cancelled);
    }
}
