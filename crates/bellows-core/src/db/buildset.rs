//! Database operations for buildsets, builds and build steps.
//!
//! The buildset is the ownership root: builds and steps are child rows of
//! it. Mutating one embedded build is an `UPDATE ... WHERE uuid = ?`; a
//! zero-rows-affected outcome means the owning document is gone and
//! surfaces as [`BellowsError::StaleUpdate`], so a late writer can never
//! resurrect a removed build.

use sqlx::Row;
use uuid::Uuid;

use super::{fmt_dt, parse_dt, parse_opt_dt, DbPool};
use crate::error::{BellowsError, Result};
use crate::models::{
    Build, BuildSet, BuildSetId, BuildStep, BuilderId, RepositoryId, RevisionId,
};
use crate::slave::SlaveId;

/// Buildset database operations.
pub struct BuildSetRepo;

impl BuildSetRepo {
    pub async fn create(pool: &DbPool, buildset: &BuildSet) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO buildsets (
                id, repository_id, revision_id, number, commit_sha, commit_date,
                commit_body, branch, author, title, status, created_at,
                started_at, finished_at, total_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(buildset.id.to_string())
        .bind(buildset.repository_id.to_string())
        .bind(buildset.revision_id.to_string())
        .bind(buildset.number)
        .bind(&buildset.commit)
        .bind(fmt_dt(&buildset.commit_date))
        .bind(&buildset.commit_body)
        .bind(&buildset.branch)
        .bind(&buildset.author)
        .bind(&buildset.title)
        .bind(buildset.status.as_str())
        .bind(fmt_dt(&buildset.created))
        .bind(buildset.started.as_ref().map(fmt_dt))
        .bind(buildset.finished.as_ref().map(fmt_dt))
        .bind(buildset.total_time)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Persists the buildset's mutable fields.
    pub async fn save(pool: &DbPool, buildset: &BuildSet) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE buildsets
            SET status = ?, started_at = ?, finished_at = ?, total_time = ?
            WHERE id = ?
            "#,
        )
        .bind(buildset.status.as_str())
        .bind(buildset.started.as_ref().map(fmt_dt))
        .bind(buildset.finished.as_ref().map(fmt_dt))
        .bind(buildset.total_time)
        .bind(buildset.id.to_string())
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(pool: &DbPool, id: &BuildSetId) -> Result<BuildSet> {
        let row = sqlx::query(
            r#"
            SELECT id, repository_id, revision_id, number, commit_sha, commit_date,
                   commit_body, branch, author, title, status, created_at,
                   started_at, finished_at, total_time
            FROM buildsets
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BellowsError::BuildSetNotFound(id.to_string()))?;

        let mut buildset = Self::row_to_buildset(&row)?;
        buildset.builds = BuildRepo::list_for_buildset(pool, id).await?;
        Ok(buildset)
    }

    /// The next buildset number for a repository.
    pub async fn next_number(pool: &DbPool, repository_id: &RepositoryId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(number), 0) AS highest FROM buildsets WHERE repository_id = ?",
        )
        .bind(repository_id.to_string())
        .fetch_one(pool)
        .await?;

        let highest: i64 = row.get("highest");
        Ok(highest + 1)
    }

    /// Buildsets of (repository, branch) created before `created`, still
    /// holding pending or running builds. Ordered oldest first.
    pub async fn previous_with_active_builds(
        pool: &DbPool,
        repository_id: &RepositoryId,
        branch: &str,
        created: &chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<BuildSetId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT bs.id, bs.created_at
            FROM buildsets bs
            JOIN builds b ON b.buildset_id = bs.id
            WHERE bs.repository_id = ?
              AND bs.branch = ?
              AND bs.created_at < ?
              AND b.status IN ('pending', 'running')
            ORDER BY bs.created_at
            "#,
        )
        .bind(repository_id.to_string())
        .bind(branch)
        .bind(fmt_dt(created))
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                BuildSetId::from_string(&id).map_err(Into::into)
            })
            .collect()
    }

    /// All buildset ids of a repository, oldest first.
    pub async fn list_ids_for_repository(
        pool: &DbPool,
        repository_id: &RepositoryId,
    ) -> Result<Vec<BuildSetId>> {
        let rows = sqlx::query(
            "SELECT id FROM buildsets WHERE repository_id = ? ORDER BY created_at",
        )
        .bind(repository_id.to_string())
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                BuildSetId::from_string(&id).map_err(Into::into)
            })
            .collect()
    }

    /// Buildsets of a repository that still hold pending builds, oldest
    /// first. Used to reschedule work at process start.
    pub async fn with_pending_builds(
        pool: &DbPool,
        repository_id: &RepositoryId,
    ) -> Result<Vec<BuildSetId>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT bs.id, bs.created_at
            FROM buildsets bs
            JOIN builds b ON b.buildset_id = bs.id
            WHERE bs.repository_id = ? AND b.status = 'pending'
            ORDER BY bs.created_at
            "#,
        )
        .bind(repository_id.to_string())
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                BuildSetId::from_string(&id).map_err(Into::into)
            })
            .collect()
    }

    fn row_to_buildset(row: &sqlx::sqlite::SqliteRow) -> Result<BuildSet> {
        let id: String = row.get("id");
        let repository_id: String = row.get("repository_id");
        let revision_id: String = row.get("revision_id");
        let status: String = row.get("status");
        let commit_date: String = row.get("commit_date");
        let created_at: String = row.get("created_at");

        Ok(BuildSet {
            id: BuildSetId::from_string(&id)?,
            repository_id: RepositoryId::from_string(&repository_id)?,
            revision_id: RevisionId::from_string(&revision_id)?,
            number: row.get("number"),
            commit: row.get("commit_sha"),
            commit_date: parse_dt("buildset.commit_date", &commit_date)?,
            commit_body: row
                .get::<Option<String>, _>("commit_body")
                .unwrap_or_default(),
            branch: row.get("branch"),
            author: row.get::<Option<String>, _>("author").unwrap_or_default(),
            title: row.get::<Option<String>, _>("title").unwrap_or_default(),
            status: status
                .parse()
                .map_err(|e: String| BellowsError::Configuration(e))?,
            created: parse_dt("buildset.created_at", &created_at)?,
            started: parse_opt_dt("buildset.started_at", row.get("started_at"))?,
            finished: parse_opt_dt("buildset.finished_at", row.get("finished_at"))?,
            total_time: row.get("total_time"),
            builds: Vec::new(),
        })
    }
}

/// Build database operations.
pub struct BuildRepo;

impl BuildRepo {
    pub async fn create(pool: &DbPool, build: &Build) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (
                uuid, buildset_id, repository_id, builder_id, slave_id, number,
                build_index, branch, named_tree, status, builders_from,
                triggered_by, external, started_at, finished_at, total_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(build.uuid.to_string())
        .bind(build.buildset_id.to_string())
        .bind(build.repository_id.to_string())
        .bind(build.builder_id.to_string())
        .bind(build.slave_id.as_ref().map(|id| id.to_string()))
        .bind(build.number)
        .bind(build.build_index)
        .bind(&build.branch)
        .bind(&build.named_tree)
        .bind(build.status.as_str())
        .bind(&build.builders_from)
        .bind(serde_json::to_string(&build.triggered_by)?)
        .bind(
            build
                .external
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(build.started.as_ref().map(fmt_dt))
        .bind(build.finished.as_ref().map(fmt_dt))
        .bind(build.total_time)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Atomic partial update of one embedded build, located by uuid.
    pub async fn update(pool: &DbPool, build: &Build) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE builds
            SET slave_id = ?, status = ?, builders_from = ?, triggered_by = ?,
                started_at = ?, finished_at = ?, total_time = ?
            WHERE uuid = ?
            "#,
        )
        .bind(build.slave_id.as_ref().map(|id| id.to_string()))
        .bind(build.status.as_str())
        .bind(&build.builders_from)
        .bind(serde_json::to_string(&build.triggered_by)?)
        .bind(build.started.as_ref().map(fmt_dt))
        .bind(build.finished.as_ref().map(fmt_dt))
        .bind(build.total_time)
        .bind(build.uuid.to_string())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BellowsError::StaleUpdate(format!(
                "build {} was not saved to the database; it can't be updated",
                build.uuid
            )));
        }

        Ok(())
    }

    /// Appends a step to a build. Runs in a transaction that re-verifies
    /// the owning build row, failing with [`BellowsError::StaleUpdate`]
    /// when the build is gone.
    pub async fn append_step(pool: &DbPool, build_uuid: &Uuid, step: &BuildStep) -> Result<()> {
        let mut tx = pool.begin().await?;

        let owner = sqlx::query("SELECT 1 FROM builds WHERE uuid = ?")
            .bind(build_uuid.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        if owner.is_none() {
            return Err(BellowsError::StaleUpdate(format!(
                "build {} was not saved to the database; it can't be updated",
                build_uuid
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO build_steps (
                uuid, build_uuid, repository_id, name, command, status, output,
                step_index, started_at, finished_at, total_time
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step.uuid.to_string())
        .bind(build_uuid.to_string())
        .bind(step.repository_id.to_string())
        .bind(&step.name)
        .bind(&step.command)
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(step.index)
        .bind(step.started.as_ref().map(fmt_dt))
        .bind(step.finished.as_ref().map(fmt_dt))
        .bind(step.total_time)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_by_uuid(pool: &DbPool, uuid: &Uuid) -> Result<Build> {
        let row = sqlx::query(
            r#"
            SELECT b.uuid, b.buildset_id, b.repository_id, b.builder_id,
                   b.slave_id, b.number, b.build_index, b.branch, b.named_tree,
                   b.status, b.builders_from, b.triggered_by, b.external,
                   b.started_at, b.finished_at, b.total_time,
                   bl.name AS builder_name
            FROM builds b
            JOIN builders bl ON bl.id = b.builder_id
            WHERE b.uuid = ?
            "#,
        )
        .bind(uuid.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| BellowsError::BuildNotFound(uuid.to_string()))?;

        let mut build = Self::row_to_build(&row)?;
        build.steps = BuildStepRepo::list_for_build(pool, uuid).await?;
        Ok(build)
    }

    /// Builds of a buildset in creation order, without their step lists.
    pub async fn list_for_buildset(
        pool: &DbPool,
        buildset_id: &BuildSetId,
    ) -> Result<Vec<Build>> {
        let rows = sqlx::query(
            r#"
            SELECT b.uuid, b.buildset_id, b.repository_id, b.builder_id,
                   b.slave_id, b.number, b.build_index, b.branch, b.named_tree,
                   b.status, b.builders_from, b.triggered_by, b.external,
                   b.started_at, b.finished_at, b.total_time,
                   bl.name AS builder_name
            FROM builds b
            JOIN builders bl ON bl.id = b.builder_id
            WHERE b.buildset_id = ?
            ORDER BY b.build_index
            "#,
        )
        .bind(buildset_id.to_string())
        .fetch_all(pool)
        .await?;

        rows.iter().map(Self::row_to_build).collect()
    }

    fn row_to_build(row: &sqlx::sqlite::SqliteRow) -> Result<Build> {
        let uuid: String = row.get("uuid");
        let buildset_id: String = row.get("buildset_id");
        let repository_id: String = row.get("repository_id");
        let builder_id: String = row.get("builder_id");
        let slave_id: Option<String> = row.get("slave_id");
        let status: String = row.get("status");
        let triggered_by: String = row.get("triggered_by");
        let external: Option<String> = row.get("external");

        Ok(Build {
            uuid: uuid.parse()?,
            buildset_id: BuildSetId::from_string(&buildset_id)?,
            repository_id: RepositoryId::from_string(&repository_id)?,
            builder_id: BuilderId::from_string(&builder_id)?,
            builder_name: row.get("builder_name"),
            slave_id: slave_id.as_deref().map(SlaveId::from_string).transpose()?,
            number: row.get("number"),
            build_index: row.get("build_index"),
            branch: row.get("branch"),
            named_tree: row.get("named_tree"),
            status: status
                .parse()
                .map_err(|e: String| BellowsError::Configuration(e))?,
            builders_from: row.get("builders_from"),
            triggered_by: serde_json::from_str(&triggered_by)?,
            external: external.as_deref().map(serde_json::from_str).transpose()?,
            started: parse_opt_dt("build.started_at", row.get("started_at"))?,
            finished: parse_opt_dt("build.finished_at", row.get("finished_at"))?,
            total_time: row.get("total_time"),
            steps: Vec::new(),
        })
    }

    /// The highest build number assigned in a repository, 0 when none.
    pub async fn highest_number(pool: &DbPool, repository_id: &RepositoryId) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(number), 0) AS highest FROM builds WHERE repository_id = ?",
        )
        .bind(repository_id.to_string())
        .fetch_one(pool)
        .await?;

        Ok(row.get("highest"))
    }
}

/// Build step database operations.
pub struct BuildStepRepo;

impl BuildStepRepo {
    /// Atomic partial update of one step, located by uuid.
    pub async fn update(pool: &DbPool, step: &BuildStep) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE build_steps
            SET name = ?, command = ?, status = ?, output = ?, step_index = ?,
                started_at = ?, finished_at = ?, total_time = ?
            WHERE uuid = ?
            "#,
        )
        .bind(&step.name)
        .bind(&step.command)
        .bind(step.status.as_str())
        .bind(&step.output)
        .bind(step.index)
        .bind(step.started.as_ref().map(fmt_dt))
        .bind(step.finished.as_ref().map(fmt_dt))
        .bind(step.total_time)
        .bind(step.uuid.to_string())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BellowsError::StaleUpdate(format!(
                "step {} was not saved to the database; it can't be updated",
                step.uuid
            )));
        }

        Ok(())
    }

    /// Appends an output chunk to a step in a single conditional update.
    pub async fn append_output(pool: &DbPool, uuid: &Uuid, chunk: &str) -> Result<()> {
        let result = sqlx::query("UPDATE build_steps SET output = output || ? WHERE uuid = ?")
            .bind(chunk)
            .bind(uuid.to_string())
            .execute(pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(BellowsError::StaleUpdate(format!(
                "step {} was not saved to the database; it can't be updated",
                uuid
            )));
        }

        Ok(())
    }

    /// Steps of a build, ordered by their index.
    pub async fn list_for_build(pool: &DbPool, build_uuid: &Uuid) -> Result<Vec<BuildStep>> {
        let rows = sqlx::query(
            r#"
            SELECT uuid, repository_id, name, command, status, output,
                   step_index, started_at, finished_at, total_time
            FROM build_steps
            WHERE build_uuid = ?
            ORDER BY step_index
            "#,
        )
        .bind(build_uuid.to_string())
        .fetch_all(pool)
        .await?;

        rows.iter()
            .map(|row| {
                let uuid: String = row.get("uuid");
                let repository_id: String = row.get("repository_id");
                let status: String = row.get("status");

                Ok(BuildStep {
                    uuid: uuid.parse()?,
                    repository_id: RepositoryId::from_string(&repository_id)?,
                    name: row.get("name"),
                    command: row.get("command"),
                    status: status
                        .parse()
                        .map_err(|e: String| BellowsError::Configuration(e))?,
                    output: row.get("output"),
                    index: row.get("step_index"),
                    started: parse_opt_dt("step.started_at", row.get("started_at"))?,
                    finished: parse_opt_dt("step.finished_at", row.get("finished_at"))?,
                    total_time: row.get("total_time"),
                })
            })
            .collect()
    }
}
