//! Buildset model: the list of builds produced by one revision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use ulid::Ulid;

use crate::context::Context;
use crate::db::{
    buildset::{BuildRepo, BuildSetRepo},
    DbPool,
};
use crate::error::Result;
use crate::models::{Build, BuildStatus, RepositoryId, Repository, Revision, RevisionId};
use crate::signals::EventKind;

/// Unique identifier for a buildset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildSetId(pub Ulid);

impl BuildSetId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for BuildSetId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a buildset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSetStatus {
    /// The revision produced no builds (empty builder list).
    NoBuilds,
    /// The revision carries no build config at all.
    NoConfig,
    Pending,
    Preparing,
    Running,
    Fail,
    Success,
    Exception,
    Warning,
    Cancelled,
}

impl BuildSetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildSetStatus::NoBuilds => "no_builds",
            BuildSetStatus::NoConfig => "no_config",
            BuildSetStatus::Pending => "pending",
            BuildSetStatus::Preparing => "preparing",
            BuildSetStatus::Running => "running",
            BuildSetStatus::Fail => "fail",
            BuildSetStatus::Success => "success",
            BuildSetStatus::Exception => "exception",
            BuildSetStatus::Warning => "warning",
            BuildSetStatus::Cancelled => "cancelled",
        }
    }
}

impl From<BuildStatus> for BuildSetStatus {
    fn from(status: BuildStatus) -> Self {
        match status {
            BuildStatus::Pending => BuildSetStatus::Pending,
            BuildStatus::Preparing => BuildSetStatus::Preparing,
            BuildStatus::Running => BuildSetStatus::Running,
            BuildStatus::Fail => BuildSetStatus::Fail,
            BuildStatus::Success => BuildSetStatus::Success,
            BuildStatus::Exception => BuildSetStatus::Exception,
            BuildStatus::Warning => BuildSetStatus::Warning,
            BuildStatus::Cancelled => BuildSetStatus::Cancelled,
        }
    }
}

impl std::fmt::Display for BuildSetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BuildSetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "no_builds" => Ok(BuildSetStatus::NoBuilds),
            "no_config" => Ok(BuildSetStatus::NoConfig),
            "pending" => Ok(BuildSetStatus::Pending),
            "preparing" => Ok(BuildSetStatus::Preparing),
            "running" => Ok(BuildSetStatus::Running),
            "fail" => Ok(BuildSetStatus::Fail),
            "success" => Ok(BuildSetStatus::Success),
            "exception" => Ok(BuildSetStatus::Exception),
            "warning" => Ok(BuildSetStatus::Warning),
            "cancelled" => Ok(BuildSetStatus::Cancelled),
            _ => Err(format!("Unknown buildset status: {}", s)),
        }
    }
}

/// Container for all builds produced from one revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    pub repository_id: RepositoryId,
    pub revision_id: RevisionId,
    /// Sequential number for buildsets in the repository.
    pub number: i64,
    pub commit: String,
    pub commit_date: DateTime<Utc>,
    pub commit_body: String,
    pub branch: String,
    pub author: String,
    pub title: String,
    pub status: BuildSetStatus,
    pub created: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// Total time spent in the buildset, in whole seconds.
    pub total_time: Option<i64>,
    /// Builds, in creation order. Loaded without their step lists; use
    /// [`Build::get`] for the full record of one build.
    pub builds: Vec<Build>,
}

impl BuildSet {
    /// Creates and persists a new buildset for `revision`, assigning the
    /// next number in the repository. Publishes `buildset-added` on the
    /// exchanges as a fire-and-forget task.
    pub async fn create(
        ctx: &Context,
        repository: &Repository,
        revision: &Revision,
    ) -> Result<Self> {
        let number = BuildSetRepo::next_number(&ctx.pool, &repository.id).await?;
        let buildset = Self {
            id: BuildSetId::new(),
            repository_id: repository.id.clone(),
            revision_id: revision.id.clone(),
            number,
            commit: revision.commit.clone(),
            commit_date: revision.commit_date,
            commit_body: revision.body.clone(),
            branch: revision.branch.clone(),
            author: revision.author.clone(),
            title: revision.title.clone(),
            status: BuildSetStatus::Pending,
            created: Utc::now(),
            started: None,
            finished: None,
            total_time: None,
            builds: Vec::new(),
        };
        BuildSetRepo::create(&ctx.pool, &buildset).await?;

        let exchanges = ctx.exchanges.clone();
        let msg = buildset.to_message("buildset-added", None);
        ctx.tasks.spawn(async move {
            exchanges.publish(msg).await;
        });

        Ok(buildset)
    }

    pub async fn get(pool: &DbPool, id: &BuildSetId) -> Result<Self> {
        BuildSetRepo::get_by_id(pool, id).await
    }

    /// The status of the buildset, aggregated from its builds: the
    /// highest-priority status present among them.
    pub fn get_status(&self) -> BuildSetStatus {
        let highest = self
            .builds
            .iter()
            .map(|b| b.status)
            .min_by_key(|s| s.priority());
        match highest {
            Some(status) => status.into(),
            None => BuildSetStatus::NoBuilds,
        }
    }

    /// The pending builds of the buildset.
    pub fn pending_builds(&self) -> Vec<&Build> {
        self.builds
            .iter()
            .filter(|b| b.status == BuildStatus::Pending)
            .collect()
    }

    /// Persists the buildset with `status`, or with the aggregate of its
    /// builds when none is given.
    pub async fn update_status(
        &mut self,
        pool: &DbPool,
        status: Option<BuildSetStatus>,
    ) -> Result<()> {
        let status = status.unwrap_or_else(|| self.get_status());
        tracing::debug!("Updating buildset {} status to {}", self.id, status);
        self.status = status;
        BuildSetRepo::save(pool, self).await
    }

    /// Appends `build` to the buildset, persisting it and emitting
    /// `build-added`.
    pub async fn add_build(&mut self, ctx: &Context, mut build: Build) -> Result<()> {
        build.build_index = self.builds.len() as i64;
        BuildRepo::create(&ctx.pool, &build).await?;
        ctx.signals.send(
            self.repository_id.clone(),
            EventKind::BuildAdded,
            json!({"uuid": build.uuid.to_string()}),
        );
        build.notify(ctx, EventKind::BuildAdded).await;
        self.builds.push(build);
        Ok(())
    }

    /// Message payload published for buildset lifecycle events.
    pub fn to_message(&self, event_type: &str, status: Option<BuildSetStatus>) -> Value {
        json!({
            "id": self.id.to_string(),
            "number": self.number,
            "commit": self.commit,
            "commit_date": self.commit_date.to_rfc3339(),
            "commit_body": self.commit_body,
            "branch": self.branch,
            "author": self.author,
            "title": self.title,
            "status": status.unwrap_or(self.status).as_str(),
            "created": self.created.to_rfc3339(),
            "started": self.started.map(|dt| dt.to_rfc3339()),
            "finished": self.finished.map(|dt| dt.to_rfc3339()),
            "total_time": self.total_time,
            "builds": self.builds.iter()
                .map(|b| b.to_message(event_type))
                .collect::<Vec<_>>(),
            "repository_id": self.repository_id.to_string(),
            "event_type": event_type,
        })
    }

    /// Publishes a lifecycle event for this buildset on both exchanges.
    pub async fn notify(
        &self,
        ctx: &Context,
        event: EventKind,
        status: Option<BuildSetStatus>,
    ) {
        tracing::debug!("notifying buildset {}", event);
        ctx.exchanges
            .publish(self.to_message(event.as_str(), status))
            .await;
    }
}
