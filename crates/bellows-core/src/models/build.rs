//! Build model.
//!
//! A build is one builder's execution for one revision: a set of steps
//! carried out by a slave. The master stores the data and drives the
//! lifecycle; the slave does the work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::context::Context;
use crate::db::{buildset::BuildRepo, DbPool};
use crate::error::{BellowsError, Result};
use crate::models::{
    Builder, BuilderId, BuildSet, BuildSetId, BuildStep, ExternalRevision, RepositoryId,
    StepStatus,
};
use crate::signals::EventKind;
use crate::slave::{Slave, SlaveId};

/// Status of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Preparing,
    Running,
    Fail,
    Success,
    Exception,
    Warning,
    Cancelled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Preparing => "preparing",
            BuildStatus::Running => "running",
            BuildStatus::Fail => "fail",
            BuildStatus::Success => "success",
            BuildStatus::Exception => "exception",
            BuildStatus::Warning => "warning",
            BuildStatus::Cancelled => "cancelled",
        }
    }

    /// Priority used to aggregate build statuses into a buildset status.
    /// Lower is higher priority.
    pub fn priority(&self) -> u8 {
        match self {
            BuildStatus::Running => 0,
            BuildStatus::Cancelled => 1,
            BuildStatus::Exception => 2,
            BuildStatus::Fail => 3,
            BuildStatus::Warning => 4,
            BuildStatus::Success => 5,
            BuildStatus::Preparing => 6,
            BuildStatus::Pending => 7,
        }
    }

    /// Returns true if the build reached a final status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Fail
                | BuildStatus::Success
                | BuildStatus::Exception
                | BuildStatus::Warning
                | BuildStatus::Cancelled
        )
    }
}

impl From<StepStatus> for BuildStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Running => BuildStatus::Running,
            StepStatus::Fail => BuildStatus::Fail,
            StepStatus::Success => BuildStatus::Success,
            StepStatus::Exception => BuildStatus::Exception,
            StepStatus::Warning => BuildStatus::Warning,
            StepStatus::Cancelled => BuildStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(BuildStatus::Pending),
            "preparing" => Ok(BuildStatus::Preparing),
            "running" => Ok(BuildStatus::Running),
            "fail" => Ok(BuildStatus::Fail),
            "success" => Ok(BuildStatus::Success),
            "exception" => Ok(BuildStatus::Exception),
            "warning" => Ok(BuildStatus::Warning),
            "cancelled" => Ok(BuildStatus::Cancelled),
            _ => Err(format!("Unknown build status: {}", s)),
        }
    }
}

/// A rule requiring a sibling builder to finish with one of the given
/// statuses before this build may start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTrigger {
    pub builder_name: String,
    pub statuses: Vec<BuildStatus>,
}

/// Result of a trigger-rule check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// All trigger rules are satisfied; the build may start.
    Ready,
    /// Some rule is not decided yet (or the build is not pending anymore).
    NotReady,
    /// A sibling finished with a status outside the rule. The rules can
    /// never be satisfied and the build must be cancelled.
    Impossible,
}

/// One builder's execution for one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub uuid: Uuid,
    pub buildset_id: BuildSetId,
    pub repository_id: RepositoryId,
    pub builder_id: BuilderId,
    /// Name of the builder, denormalized from the builders table on load.
    pub builder_name: String,
    /// The slave that will carry the build. Assigned at dispatch time.
    pub slave_id: Option<SlaveId>,
    /// Sequential number for builds in the repository.
    pub number: i64,
    /// Position of the build inside its buildset.
    pub build_index: i64,
    pub branch: String,
    /// Identifier of the commit: a sha, a tag name, etc.
    pub named_tree: String,
    pub status: BuildStatus,
    /// Branch the builders list was derived from. May differ from the
    /// build branch when a fallback applied.
    pub builders_from: Option<String>,
    pub triggered_by: Vec<BuildTrigger>,
    pub external: Option<ExternalRevision>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub total_time: Option<i64>,
    pub steps: Vec<BuildStep>,
}

impl Build {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository_id: RepositoryId,
        buildset_id: BuildSetId,
        builder: &Builder,
        branch: &str,
        named_tree: &str,
        number: i64,
        builders_from: Option<String>,
        external: Option<ExternalRevision>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            buildset_id,
            repository_id,
            builder_id: builder.id.clone(),
            builder_name: builder.name.clone(),
            slave_id: None,
            number,
            build_index: 0,
            branch: branch.to_string(),
            named_tree: named_tree.to_string(),
            status: BuildStatus::Pending,
            builders_from,
            triggered_by: builder.triggered_by.clone(),
            external,
            started: None,
            finished: None,
            total_time: None,
            steps: Vec::new(),
        }
    }

    /// Loads a build by its uuid.
    pub async fn get(pool: &DbPool, uuid: &Uuid) -> Result<Self> {
        BuildRepo::get_by_uuid(pool, uuid).await
    }

    /// Persists the build's mutable fields as an atomic partial update.
    /// Fails with [`BellowsError::StaleUpdate`] when the stored build row
    /// is gone, so a late writer can't resurrect it.
    pub async fn update(&self, pool: &DbPool) -> Result<()> {
        BuildRepo::update(pool, self).await
    }

    /// The buildset that owns this build.
    pub async fn get_buildset(&self, pool: &DbPool) -> Result<BuildSet> {
        BuildSet::get(pool, &self.buildset_id).await
    }

    /// The build output: each step's command followed by its output.
    pub fn output(&self) -> String {
        let mut out = String::new();
        for step in &self.steps {
            out.push_str(&step.command);
            out.push('\n');
            out.push_str(&step.output);
            out.push_str("\n\n");
        }
        out
    }

    pub fn find_step(&self, uuid: &Uuid) -> Option<&BuildStep> {
        self.steps.iter().find(|s| &s.uuid == uuid)
    }

    pub fn find_step_mut(&mut self, uuid: &Uuid) -> Option<&mut BuildStep> {
        self.steps.iter_mut().find(|s| &s.uuid == uuid)
    }

    /// Message payload published for build lifecycle events.
    pub fn to_message(&self, event_type: &str) -> Value {
        json!({
            "uuid": self.uuid.to_string(),
            "status": self.status.as_str(),
            "branch": self.branch,
            "named_tree": self.named_tree,
            "number": self.number,
            "builder": {"id": self.builder_id.to_string(), "name": self.builder_name},
            "steps": self.steps.iter()
                .map(|s| s.to_message(&self.repository_id, event_type))
                .collect::<Vec<_>>(),
            "started": self.started.map(|dt| dt.to_rfc3339()),
            "finished": self.finished.map(|dt| dt.to_rfc3339()),
            "total_time": self.total_time,
            "output": self.output(),
            "external": self.external,
            "repository_id": self.repository_id.to_string(),
            "event_type": event_type,
        })
    }

    /// Publishes a lifecycle event for this build on both exchanges.
    pub async fn notify(&self, ctx: &Context, event: EventKind) {
        ctx.exchanges.publish(self.to_message(event.as_str())).await;
    }

    /// Cancels the build.
    ///
    /// A pending build is cancelled synchronously: dequeued from its slave
    /// and marked cancelled. For a running build the cancel request is
    /// forwarded to the slave and the terminal status arrives through the
    /// stream. Any other status raises
    /// [`BellowsError::ImpossibleCancellation`].
    pub async fn cancel(&mut self, ctx: &Context) -> Result<bool> {
        if !matches!(self.status, BuildStatus::Pending | BuildStatus::Running) {
            return Err(BellowsError::ImpossibleCancellation);
        }

        if self.status == BuildStatus::Running {
            let slave_id = match &self.slave_id {
                Some(id) => id.clone(),
                None => {
                    tracing::error!("Running build {} has no slave", self.uuid);
                    return Ok(false);
                }
            };
            let slave = Slave::get(&ctx.pool, &slave_id).await?;
            if let Err(e) = slave.cancel_build(ctx, self).await {
                tracing::error!("Error cancelling running build {}: {}", self.uuid, e);
                return Ok(false);
            }
            return Ok(true);
        }

        if let Some(slave_id) = &self.slave_id {
            let mut slave = Slave::get(&ctx.pool, slave_id).await?;
            slave.dequeue_build(ctx, self).await?;
        }

        self.status = BuildStatus::Cancelled;
        self.update(&ctx.pool).await?;
        ctx.signals.send(
            self.repository_id.clone(),
            EventKind::BuildCancelled,
            json!({"uuid": self.uuid.to_string()}),
        );
        self.notify(ctx, EventKind::BuildCancelled).await;

        Ok(true)
    }

    /// Assigns `slave` to this build and puts the build on its queue.
    pub async fn set_slave(&mut self, ctx: &Context, slave: &mut Slave) -> Result<()> {
        tracing::debug!("Adding slave {} to build {}", slave.name, self.uuid);
        self.slave_id = Some(slave.id.clone());
        self.update(&ctx.pool).await?;
        slave.enqueue_build(ctx, self).await?;
        Ok(())
    }

    /// Checks whether all trigger conditions are met. Without trigger
    /// rules the build is ready as soon as it is pending.
    pub async fn is_ready2run(&mut self, pool: &DbPool) -> Result<Readiness> {
        let stored = match Self::get(pool, &self.uuid).await {
            Ok(b) => b,
            Err(BellowsError::BuildNotFound(_)) => {
                tracing::warn!("build {} does not exist. not ready to run", self.uuid);
                return Ok(Readiness::NotReady);
            }
            Err(e) => return Err(e),
        };

        self.status = stored.status;
        if self.status != BuildStatus::Pending {
            return Ok(Readiness::NotReady);
        }

        if self.triggered_by.is_empty() {
            return Ok(Readiness::Ready);
        }

        self.check_build_rules(pool).await
    }

    /// Marks the build with exception status and appends a synthetic step
    /// carrying `output` (typically an error trace).
    pub async fn set_unknown_exception(&mut self, pool: &DbPool, output: &str) -> Result<()> {
        let now = Utc::now();
        self.status = BuildStatus::Exception;
        self.started.get_or_insert(now);
        self.finished.get_or_insert(now);

        let mut step = BuildStep::new(
            self.repository_id.clone(),
            "exception",
            "",
            self.steps.len() as i64,
        );
        step.status = StepStatus::Exception;
        step.output = output.to_string();
        step.started = Some(now);
        step.finished = Some(now);

        BuildRepo::append_step(pool, &self.uuid, &step).await?;
        self.steps.push(step);
        self.update(pool).await?;
        Ok(())
    }

    async fn check_build_rules(&self, pool: &DbPool) -> Result<Readiness> {
        let rules: std::collections::HashMap<&str, &Vec<BuildStatus>> = self
            .triggered_by
            .iter()
            .map(|t| (t.builder_name.as_str(), &t.statuses))
            .collect();

        let buildset = self.get_buildset(pool).await?;
        let mut satisfied = 0;
        for sibling in &buildset.builds {
            if sibling.uuid == self.uuid {
                continue;
            }

            let rule = match rules.get(sibling.builder_name.as_str()) {
                // No rule for this builder, or the sibling hasn't been
                // decided yet: not taken into account.
                Some(_) if !sibling.status.is_terminal() => continue,
                None => continue,
                Some(statuses) => statuses,
            };

            if !rule.contains(&sibling.status) {
                // The sibling finished with a status other than the ones
                // that trigger this build.
                return Ok(Readiness::Impossible);
            }

            satisfied += 1;
        }

        if satisfied == self.triggered_by.len() {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::NotReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_priority_order() {
        let mut statuses = vec![
            BuildStatus::Pending,
            BuildStatus::Success,
            BuildStatus::Running,
            BuildStatus::Fail,
        ];
        statuses.sort_by_key(|s| s.priority());
        assert_eq!(statuses[0], BuildStatus::Running);
        assert_eq!(statuses[3], BuildStatus::Pending);
    }

    #[test]
    fn test_is_terminal() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Preparing.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Fail.is_terminal());
        assert!(BuildStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_output_concatenates_steps() {
        let repo_id = RepositoryId::new();
        let builder = Builder::new(repo_id.clone(), "b1", 0);
        let mut build = Build::new(
            repo_id.clone(),
            BuildSetId::new(),
            &builder,
            "main",
            "v0.1",
            1,
            None,
            None,
        );

        let mut step = BuildStep::new(repo_id.clone(), "ls", "ls", 0);
        step.output = "somefile.txt\n".to_string();
        build.steps.push(step);

        assert_eq!(build.output(), "ls\nsomefile.txt\n\n\n");
    }

    #[tokio::test]
    async fn test_is_ready2run_follows_sibling_statuses() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        let repo = crate::test_support::seed_repository(&ctx, 0).await;
        let revision = crate::test_support::seed_revision(&ctx, &repo, "master", None).await;
        let buildset =
            crate::test_support::seed_buildset(&ctx, &repo, &revision, &["a", "b"]).await;

        let mut sibling = Build::get(&ctx.pool, &buildset.builds[0].uuid).await.unwrap();
        let mut build = Build::get(&ctx.pool, &buildset.builds[1].uuid).await.unwrap();
        build.triggered_by = vec![BuildTrigger {
            builder_name: "a".to_string(),
            statuses: vec![BuildStatus::Success],
        }];
        build.update(&ctx.pool).await.unwrap();

        // Sibling still pending: not ready yet.
        let mut build = Build::get(&ctx.pool, &build.uuid).await.unwrap();
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::NotReady
        );

        // Sibling finished inside the rule: ready.
        sibling.status = BuildStatus::Success;
        sibling.update(&ctx.pool).await.unwrap();
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::Ready
        );

        // Sibling finished outside the rule: never satisfiable.
        sibling.status = BuildStatus::Fail;
        sibling.update(&ctx.pool).await.unwrap();
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::Impossible
        );
    }

    #[tokio::test]
    async fn test_is_ready2run_without_rules() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        let repo = crate::test_support::seed_repository(&ctx, 0).await;
        let revision = crate::test_support::seed_revision(&ctx, &repo, "master", None).await;
        let buildset = crate::test_support::seed_buildset(&ctx, &repo, &revision, &["a"]).await;

        let mut build = Build::get(&ctx.pool, &buildset.builds[0].uuid).await.unwrap();
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::Ready
        );

        // Not pending anymore: not ready.
        build.status = BuildStatus::Running;
        build.update(&ctx.pool).await.unwrap();
        let mut build = Build::get(&ctx.pool, &build.uuid).await.unwrap();
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::NotReady
        );
    }

    #[tokio::test]
    async fn test_is_ready2run_missing_build() {
        let (ctx, _, _) = crate::test_support::test_context().await;
        let repo = crate::test_support::seed_repository(&ctx, 0).await;
        let builder = Builder::new(repo.id.clone(), "a", 0);
        let mut build = Build::new(
            repo.id.clone(),
            BuildSetId::new(),
            &builder,
            "master",
            "v0.1",
            1,
            None,
            None,
        );
        assert_eq!(
            build.is_ready2run(&ctx.pool).await.unwrap(),
            Readiness::NotReady
        );
    }

    #[test]
    fn test_to_message_shape() {
        let repo_id = RepositoryId::new();
        let builder = Builder::new(repo_id.clone(), "b1", 0);
        let build = Build::new(
            repo_id,
            BuildSetId::new(),
            &builder,
            "main",
            "v0.1",
            3,
            Some("main".to_string()),
            None,
        );

        let msg = build.to_message("build-added");
        assert_eq!(msg["number"], 3);
        assert_eq!(msg["status"], "pending");
        assert_eq!(msg["builder"]["name"], "b1");
        assert_eq!(msg["event_type"], "build-added");
    }
}
