//! Builder model.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::db::{builder::BuilderRepo, DbPool};
use crate::error::Result;
use crate::models::{BuildTrigger, RepositoryId};

/// Position for builders whose config doesn't declare one. Sorts after
/// every declared position.
pub const DEFAULT_POSITION: i64 = 10000;

/// Unique identifier for a builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuilderId(pub Ulid);

impl BuilderId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for BuilderId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuilderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A named recipe from the build config. One builder produces one build
/// per revision it applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Builder {
    pub id: BuilderId,
    pub repository_id: RepositoryId,
    pub name: String,
    /// Display order in the waterfall, taken from the definition order in
    /// the build config.
    pub position: i64,
    /// Trigger rules from the config, scoped to the revision being
    /// processed. Never persisted.
    #[serde(skip)]
    pub triggered_by: Vec<BuildTrigger>,
}

impl Builder {
    pub fn new(repository_id: RepositoryId, name: &str, position: i64) -> Self {
        Self {
            id: BuilderId::new(),
            repository_id,
            name: name.to_string(),
            position,
            triggered_by: Vec::new(),
        }
    }

    /// Returns the builder matching (repository, name), creating it if
    /// needed. An existing builder whose declared position changed is
    /// updated in place.
    pub async fn get_or_create(
        pool: &DbPool,
        repository_id: &RepositoryId,
        name: &str,
        position: i64,
    ) -> Result<Self> {
        BuilderRepo::get_or_create(pool, repository_id, name, position).await
    }

    /// The builder's display status: the highest-priority status among its
    /// builds in the most recent buildset, or `idle` when it never built.
    pub async fn status(&self, pool: &DbPool) -> Result<String> {
        let statuses = BuilderRepo::latest_build_statuses(pool, &self.id).await?;
        let status = statuses
            .into_iter()
            .min_by_key(|s| s.priority())
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| "idle".to_string());
        Ok(status)
    }
}
