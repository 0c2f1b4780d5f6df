//! Repository read/update model.
//!
//! Repository CRUD lives outside the orchestration core; this is the view
//! of a repository the core needs to schedule builds: slaves, parallelism,
//! branch policies and environment.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::client::SecretsClient;
use crate::config::Settings;
use crate::db::{repository::RepositoryRepo, slave::SlaveRepo, DbPool};
use crate::error::Result;
use crate::models::BuildSetId;
use crate::slave::Slave;

/// Unique identifier for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(pub Ulid);

impl RepositoryId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RepositoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-branch scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    /// When true, a new buildset on this branch cancels earlier pending
    /// buildsets of the same branch.
    #[serde(default)]
    pub notify_only_latest: bool,
    /// Branch to take builders from when the revision's own branch has
    /// none configured.
    #[serde(default)]
    pub builders_fallback: Option<String>,
}

/// A repository whose revisions produce buildsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepositoryId,
    pub name: String,
    pub url: String,
    pub vcs_type: String,
    /// Maximum builds of this repository running at once. Zero means
    /// unlimited.
    pub parallel_builds: i64,
    /// Environment passed to every build of this repository.
    pub envvars: HashMap<String, String>,
    pub branches: Vec<BranchConfig>,
    pub latest_buildset: Option<BuildSetId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    pub async fn get(pool: &DbPool, id: &RepositoryId) -> Result<Self> {
        RepositoryRepo::get_by_id(pool, id).await
    }

    /// Re-reads the repository row, picking up live counters and config
    /// changed from outside.
    pub async fn reload(&mut self, pool: &DbPool) -> Result<()> {
        *self = RepositoryRepo::get_by_id(pool, &self.id).await?;
        Ok(())
    }

    /// The slaves attached to this repository.
    pub async fn slaves(&self, pool: &DbPool) -> Result<Vec<Slave>> {
        SlaveRepo::list_for_repository(pool, &self.id).await
    }

    pub fn branch_config(&self, branch: &str) -> Option<&BranchConfig> {
        self.branches.iter().find(|b| b.name == branch)
    }

    /// Whether only the latest buildset of `branch` should be kept pending.
    pub fn notify_only_latest(&self, branch: &str) -> bool {
        self.branch_config(branch)
            .map(|b| b.notify_only_latest)
            .unwrap_or(false)
    }

    pub async fn set_latest_buildset(
        &mut self,
        pool: &DbPool,
        buildset_id: &BuildSetId,
    ) -> Result<()> {
        self.latest_buildset = Some(buildset_id.clone());
        RepositoryRepo::set_latest_buildset(pool, &self.id, buildset_id).await
    }

    /// Fetches the secrets owned by this repository from the secrets
    /// service.
    pub async fn get_secrets(&self, settings: &Settings) -> Result<HashMap<String, String>> {
        let mut client = SecretsClient::connect(settings).await?;
        client.get_secrets(&[self.id.to_string()]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with_branches(branches: Vec<BranchConfig>) -> Repository {
        Repository {
            id: RepositoryId::new(),
            name: "repo".to_string(),
            url: "git@somewhere/repo.git".to_string(),
            vcs_type: "git".to_string(),
            parallel_builds: 0,
            envvars: HashMap::new(),
            branches,
            latest_buildset: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_notify_only_latest_configured_branch() {
        let repo = repo_with_branches(vec![BranchConfig {
            name: "main".to_string(),
            notify_only_latest: true,
            builders_fallback: None,
        }]);
        assert!(repo.notify_only_latest("main"));
    }

    #[test]
    fn test_notify_only_latest_unknown_branch_defaults_off() {
        let repo = repo_with_branches(vec![]);
        assert!(!repo.notify_only_latest("feature/x"));
    }
}
