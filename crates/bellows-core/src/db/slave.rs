//! Database operations for slaves.

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use super::{fmt_dt, DbPool};
use crate::error::{BellowsError, Result};
use crate::models::RepositoryId;
use crate::slave::{Slave, SlaveId, DYNAMIC_HOST};

const SLAVE_COLUMNS: &str = "id, name, host, port, token, use_ssl, validate_cert, \
     on_demand, instance_type, instance_confs, queue_count, running_count, \
     enqueued_builds, running_repos";

/// Slave database operations.
pub struct SlaveRepo;

impl SlaveRepo {
    pub async fn create(pool: &DbPool, slave: &Slave) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO slaves (
                id, name, host, port, token, use_ssl, validate_cert, on_demand,
                instance_type, instance_confs, queue_count, running_count,
                enqueued_builds, running_repos, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(slave.id.to_string())
        .bind(&slave.name)
        .bind(stored_host(slave))
        .bind(slave.port)
        .bind(&slave.token)
        .bind(slave.use_ssl)
        .bind(slave.validate_cert)
        .bind(slave.on_demand)
        .bind(slave.instance_type.map(|t| t.as_str().to_string()))
        .bind(serde_json::to_string(&slave.instance_confs)?)
        .bind(slave.queue_count)
        .bind(slave.running_count)
        .bind(serde_json::to_string(&slave.enqueued_builds)?)
        .bind(serde_json::to_string(&slave.running_repos)?)
        .bind(fmt_dt(&Utc::now()))
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn get_by_id(pool: &DbPool, id: &SlaveId) -> Result<Slave> {
        let query = format!("SELECT {} FROM slaves WHERE id = ?", SLAVE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| BellowsError::SlaveNotFound(id.to_string()))?;

        Self::row_to_slave(&row)
    }

    /// The slaves attached to a repository, least loaded first.
    pub async fn list_for_repository(
        pool: &DbPool,
        repository_id: &RepositoryId,
    ) -> Result<Vec<Slave>> {
        let query = format!(
            r#"
            SELECT {}
            FROM slaves s
            JOIN repository_slaves rs ON rs.slave_id = s.id
            WHERE rs.repository_id = ?
            ORDER BY s.queue_count
            "#,
            SLAVE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(repository_id.to_string())
            .fetch_all(pool)
            .await?;

        rows.iter().map(Self::row_to_slave).collect()
    }

    /// Persists the queue accounting of a slave. Callers hold the slave's
    /// write-lock.
    pub async fn set_queue(
        pool: &DbPool,
        id: &SlaveId,
        enqueued_builds: &[Uuid],
        queue_count: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE slaves SET enqueued_builds = ?, queue_count = ? WHERE id = ?")
            .bind(serde_json::to_string(enqueued_builds)?)
            .bind(queue_count)
            .bind(id.to_string())
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Persists the running-repos accounting of a slave. Callers hold the
    /// slave's write-lock.
    pub async fn set_running(
        pool: &DbPool,
        id: &SlaveId,
        running_repos: &[String],
        running_count: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE slaves SET running_repos = ?, running_count = ? WHERE id = ?")
            .bind(serde_json::to_string(running_repos)?)
            .bind(running_count)
            .bind(id.to_string())
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Persists the host resolved for an on-demand slave.
    pub async fn set_host(pool: &DbPool, id: &SlaveId, host: &str) -> Result<()> {
        sqlx::query("UPDATE slaves SET host = ? WHERE id = ?")
            .bind(host)
            .bind(id.to_string())
            .execute(pool)
            .await?;

        Ok(())
    }

    fn row_to_slave(row: &sqlx::sqlite::SqliteRow) -> Result<Slave> {
        let id: String = row.get("id");
        let instance_type: Option<String> = row.get("instance_type");
        let instance_confs: String = row.get("instance_confs");
        let enqueued_builds: String = row.get("enqueued_builds");
        let running_repos: String = row.get("running_repos");

        Ok(Slave::from_stored(
            SlaveId::from_string(&id)?,
            row.get("name"),
            row.get("host"),
            row.get::<i64, _>("port") as u16,
            row.get("token"),
            row.get("use_ssl"),
            row.get("validate_cert"),
            row.get("on_demand"),
            instance_type
                .as_deref()
                .map(|t| {
                    t.parse()
                        .map_err(|e: String| BellowsError::Configuration(e))
                })
                .transpose()?,
            serde_json::from_str(&instance_confs)?,
            row.get("queue_count"),
            row.get("running_count"),
            serde_json::from_str(&enqueued_builds)?,
            serde_json::from_str(&running_repos)?,
        ))
    }
}

/// On-demand slaves without a resolved address are stored with the
/// DYNAMIC_HOST sentinel instead of an empty host.
fn stored_host(slave: &Slave) -> String {
    if slave.on_demand && slave.host.is_empty() {
        DYNAMIC_HOST.to_string()
    } else {
        slave.host.clone()
    }
}
