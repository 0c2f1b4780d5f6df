//! Repository revision read model.
//!
//! Revisions are produced by the poller service; the core only consumes
//! them to decide which builds to create.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{BellowsError, Result};
use crate::models::RepositoryId;

/// Unique identifier for a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub Ulid);

impl RevisionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for RevisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Revision info for builds whose code lives outside the repository
/// (e.g. a pull request from a fork).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRevision {
    pub url: String,
    pub name: String,
    pub branch: String,
    pub into: String,
}

/// A revision on some branch of a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub id: RevisionId,
    pub repository_id: RepositoryId,
    pub branch: String,
    pub commit: String,
    pub commit_date: DateTime<Utc>,
    pub author: String,
    pub title: String,
    pub body: String,
    /// Raw build config content at this revision, if any.
    pub config: Option<String>,
    /// Branch to take builders from when this revision's branch has none.
    pub builders_fallback: Option<String>,
    /// Builder names to include (whitelist). Include wins over exclude.
    pub builders_include: Vec<String>,
    /// Builder names to exclude (blacklist).
    pub builders_exclude: Vec<String>,
    pub external: Option<ExternalRevision>,
}

impl Revision {
    /// Whether this revision should produce builds at all. Commits can
    /// opt out with a ci-skip directive in the body.
    pub fn create_builds(&self) -> bool {
        let body = self.body.to_lowercase();
        !(body.contains("ci: skip") || body.contains("ci:skip"))
    }

    /// Builds a revision from a poller response entry.
    pub fn from_poller(repository_id: RepositoryId, value: &Value) -> Result<Self> {
        let branch = value
            .get("branch")
            .and_then(Value::as_str)
            .ok_or_else(|| BellowsError::Client("revision without branch".to_string()))?;
        let commit = value
            .get("commit")
            .and_then(Value::as_str)
            .ok_or_else(|| BellowsError::Client("revision without commit".to_string()))?;
        let commit_date = value
            .get("commit_date")
            .and_then(Value::as_str)
            .map(|s| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| BellowsError::DateParse {
                        field: "revision.commit_date",
                        message: e.to_string(),
                    })
            })
            .transpose()?
            .unwrap_or_else(Utc::now);

        let str_list = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let external = value
            .get("external")
            .filter(|v| !v.is_null())
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()?;

        Ok(Self {
            id: RevisionId::new(),
            repository_id,
            branch: branch.to_string(),
            commit: commit.to_string(),
            commit_date,
            author: str_of(value, "author"),
            title: str_of(value, "title"),
            body: str_of(value, "body"),
            config: value
                .get("config")
                .and_then(Value::as_str)
                .map(str::to_string),
            builders_fallback: value
                .get("builders_fallback")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            builders_include: str_list("builders_include"),
            builders_exclude: str_list("builders_exclude"),
            external,
        })
    }
}

fn str_of(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision(body: &str) -> Revision {
        Revision {
            id: RevisionId::new(),
            repository_id: RepositoryId::new(),
            branch: "main".to_string(),
            commit: "abc123".to_string(),
            commit_date: Utc::now(),
            author: "someone".to_string(),
            title: "a change".to_string(),
            body: body.to_string(),
            config: None,
            builders_fallback: None,
            builders_include: vec![],
            builders_exclude: vec![],
            external: None,
        }
    }

    #[test]
    fn test_create_builds() {
        assert!(revision("fix the frobnicator").create_builds());
        assert!(!revision("typo fix\n\nci: skip").create_builds());
        assert!(!revision("CI:SKIP please").create_builds());
    }

    #[test]
    fn test_from_poller() {
        let value = json!({
            "branch": "main",
            "commit": "deadbeef",
            "commit_date": "2024-10-23T22:53:11+00:00",
            "author": "someone",
            "title": "a change",
            "body": "longer text",
            "config": "builders:\n  - name: a\n",
            "builders_fallback": "master",
        });

        let rev = Revision::from_poller(RepositoryId::new(), &value).unwrap();
        assert_eq!(rev.branch, "main");
        assert_eq!(rev.commit, "deadbeef");
        assert!(rev.config.is_some());
        assert_eq!(rev.builders_fallback.as_deref(), Some("master"));
        assert!(rev.external.is_none());
    }

    #[test]
    fn test_from_poller_missing_commit_is_an_error() {
        let value = json!({"branch": "main"});
        assert!(Revision::from_poller(RepositoryId::new(), &value).is_err());
    }
}
