//! Client to the poller daemon.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::Connection;
use crate::config::Settings;
use crate::db::repository::RevisionRepo;
use crate::db::DbPool;
use crate::error::Result;
use crate::models::Repository;

/// A client to the poller, which watches repositories for new revisions.
pub struct PollerClient {
    conn: Connection,
    token: String,
    conffile: String,
}

impl PollerClient {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let conn = Connection::connect(&settings.poller_host, settings.poller_port).await?;
        Ok(Self {
            conn,
            token: settings.poller_token.clone(),
            conffile: settings.build_config_filename.clone(),
        })
    }

    /// Requests a poll of `repo`. Returns the poller's response body,
    /// whose `revisions` list holds the new revisions found.
    pub async fn poll_repo(
        &mut self,
        pool: &DbPool,
        repo: &Repository,
        external: Option<Value>,
    ) -> Result<Value> {
        let known_branches = RevisionRepo::known_branches(pool, &repo.id).await?;
        let since = RevisionRepo::last_commit_dates(pool, &repo.id).await?;
        let branches_conf: HashMap<&str, Value> = repo
            .branches
            .iter()
            .map(|b| {
                (
                    b.name.as_str(),
                    json!({
                        "notify_only_latest": b.notify_only_latest,
                        "builders_fallback": b.builders_fallback,
                    }),
                )
            })
            .collect();

        let body = json!({
            "repo_id": repo.id.to_string(),
            "url": repo.url,
            "vcs_type": repo.vcs_type,
            "known_branches": known_branches,
            "since": since
                .iter()
                .map(|(branch, dt)| (branch.clone(), format_since(dt)))
                .collect::<HashMap<String, String>>(),
            "branches_conf": branches_conf,
            "external": external,
            "conffile": self.conffile,
        });

        tracing::debug!("Polling code for {}", repo.url);
        let token = self.token.clone();
        let response = self.conn.request2server("poll", body, &token).await?;
        tracing::debug!("Poll for {} finished", repo.url);
        Ok(response)
    }
}

fn format_since(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}
