//! Database operations for repositories and revisions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{fmt_dt, parse_dt, parse_opt_dt, DbPool};
use crate::error::{BellowsError, Result};
use crate::models::{BuildSetId, Repository, RepositoryId, Revision, RevisionId};
use crate::slave::SlaveId;

/// Repository database operations.
pub struct RepositoryRepo;

impl RepositoryRepo {
    pub async fn create(pool: &DbPool, repo: &Repository) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (
                id, name, url, vcs_type, parallel_builds, envvars, branches,
                latest_buildset, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(repo.id.to_string())
        .bind(&repo.name)
        .bind(&repo.url)
        .bind(&repo.vcs_type)
        .bind(repo.parallel_builds)
        .bind(serde_json::to_string(&repo.envvars)?)
        .bind(serde_json::to_string(&repo.branches)?)
        .bind(repo.latest_buildset.as_ref().map(|id| id.to_string()))
        .bind(fmt_dt(&repo.created_at))
        .bind(fmt_dt(&repo.updated_at))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(pool: &DbPool, id: &RepositoryId) -> Result<Repository> {
        let row = sqlx::query(
            r#"
            SELECT id, name, url, vcs_type, parallel_builds, envvars, branches,
                   latest_buildset, created_at, updated_at
            FROM repositories
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BellowsError::RepositoryNotFound(id.to_string()))?;

        Self::row_to_repository(&row)
    }

    pub async fn list(pool: &DbPool) -> Result<Vec<Repository>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, url, vcs_type, parallel_builds, envvars, branches,
                   latest_buildset, created_at, updated_at
            FROM repositories
            ORDER BY created_at
            "#,
        )
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_repository).collect()
    }

    pub async fn set_latest_buildset(
        pool: &DbPool,
        id: &RepositoryId,
        buildset_id: &BuildSetId,
    ) -> Result<()> {
        sqlx::query("UPDATE repositories SET latest_buildset = ?, updated_at = ? WHERE id = ?")
            .bind(buildset_id.to_string())
            .bind(fmt_dt(&Utc::now()))
            .bind(id.to_string())
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Attaches a slave to a repository.
    pub async fn add_slave(pool: &DbPool, id: &RepositoryId, slave_id: &SlaveId) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO repository_slaves (repository_id, slave_id) VALUES (?, ?)",
        )
        .bind(id.to_string())
        .bind(slave_id.to_string())
        .execute(pool)
        .await?;

        Ok(())
    }

    fn row_to_repository(row: &sqlx::sqlite::SqliteRow) -> Result<Repository> {
        let id_str: String = row.get("id");
        let envvars_str: String = row.get("envvars");
        let branches_str: String = row.get("branches");
        let latest: Option<String> = row.get("latest_buildset");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");

        Ok(Repository {
            id: RepositoryId::from_string(&id_str)?,
            name: row.get("name"),
            url: row.get("url"),
            vcs_type: row.get("vcs_type"),
            parallel_builds: row.get("parallel_builds"),
            envvars: serde_json::from_str(&envvars_str)?,
            branches: serde_json::from_str(&branches_str)?,
            latest_buildset: latest.as_deref().map(BuildSetId::from_string).transpose()?,
            created_at: parse_dt("repository.created_at", &created_at)?,
            updated_at: parse_dt("repository.updated_at", &updated_at)?,
        })
    }
}

/// Revision database operations.
pub struct RevisionRepo;

impl RevisionRepo {
    pub async fn create(pool: &DbPool, revision: &Revision) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO revisions (
                id, repository_id, branch, commit_sha, commit_date, author,
                title, body, config, builders_fallback, builders_include,
                builders_exclude, external, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(revision.id.to_string())
        .bind(revision.repository_id.to_string())
        .bind(&revision.branch)
        .bind(&revision.commit)
        .bind(fmt_dt(&revision.commit_date))
        .bind(&revision.author)
        .bind(&revision.title)
        .bind(&revision.body)
        .bind(&revision.config)
        .bind(&revision.builders_fallback)
        .bind(serde_json::to_string(&revision.builders_include)?)
        .bind(serde_json::to_string(&revision.builders_exclude)?)
        .bind(
            revision
                .external
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(fmt_dt(&Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(pool: &DbPool, id: &RevisionId) -> Result<Revision> {
        let row = sqlx::query(
            r#"
            SELECT id, repository_id, branch, commit_sha, commit_date, author,
                   title, body, config, builders_fallback, builders_include,
                   builders_exclude, external
            FROM revisions
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BellowsError::BuildSetNotFound(format!("revision {}", id)))?;

        let id_str: String = row.get("id");
        let repo_str: String = row.get("repository_id");
        let commit_date: String = row.get("commit_date");
        let include_str: String = row.get("builders_include");
        let exclude_str: String = row.get("builders_exclude");
        let external_str: Option<String> = row.get("external");

        Ok(Revision {
            id: RevisionId::from_string(&id_str)?,
            repository_id: RepositoryId::from_string(&repo_str)?,
            branch: row.get("branch"),
            commit: row.get("commit_sha"),
            commit_date: parse_dt("revision.commit_date", &commit_date)?,
            author: row.get::<Option<String>, _>("author").unwrap_or_default(),
            title: row.get::<Option<String>, _>("title").unwrap_or_default(),
            body: row.get::<Option<String>, _>("body").unwrap_or_default(),
            config: row.get("config"),
            builders_fallback: row.get("builders_fallback"),
            builders_include: serde_json::from_str(&include_str)?,
            builders_exclude: serde_json::from_str(&exclude_str)?,
            external: external_str
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
        })
    }

    /// Branches this repository has seen revisions on.
    pub async fn known_branches(pool: &DbPool, repository_id: &RepositoryId) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT DISTINCT branch FROM revisions WHERE repository_id = ?")
                .bind(repository_id.to_string())
                .fetch_all(pool)
                .await?;

        Ok(rows.iter().map(|r| r.get("branch")).collect())
    }

    /// The latest known commit date per branch, used as the `since` marker
    /// in poll requests.
    pub async fn last_commit_dates(
        pool: &DbPool,
        repository_id: &RepositoryId,
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let rows = sqlx::query(
            r#"
            SELECT branch, MAX(commit_date) AS last_date
            FROM revisions
            WHERE repository_id = ?
            GROUP BY branch
            "#,
        )
        .bind(repository_id.to_string())
        .fetch_all(pool)
        .await?;

        let mut dates = HashMap::new();
        for row in rows {
            let branch: String = row.get("branch");
            let last: Option<String> = row.get("last_date");
            if let Some(dt) = parse_opt_dt("revision.commit_date", last)? {
                dates.insert(branch, dt);
            }
        }
        Ok(dates)
    }
}
