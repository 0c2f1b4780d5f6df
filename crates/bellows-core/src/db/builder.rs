//! Database operations for builders.

use sqlx::Row;

use super::DbPool;
use crate::error::Result;
use crate::models::{Builder, BuilderId, BuildStatus, RepositoryId};

/// Builder database operations.
pub struct BuilderRepo;

impl BuilderRepo {
    /// Returns the builder matching (repository, name), creating it if it
    /// does not exist. When it exists with a different position, the
    /// position is updated in place.
    pub async fn get_or_create(
        pool: &DbPool,
        repository_id: &RepositoryId,
        name: &str,
        position: i64,
    ) -> Result<Builder> {
        let row = sqlx::query(
            "SELECT id, position FROM builders WHERE repository_id = ? AND name = ?",
        )
        .bind(repository_id.to_string())
        .bind(name)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            let id_str: String = row.get("id");
            let stored_position: i64 = row.get("position");
            let id = BuilderId::from_string(&id_str)?;

            if stored_position != position {
                sqlx::query("UPDATE builders SET position = ? WHERE id = ?")
                    .bind(position)
                    .bind(id.to_string())
                    .execute(pool)
                    .await?;
            }

            return Ok(Builder {
                id,
                repository_id: repository_id.clone(),
                name: name.to_string(),
                position,
                triggered_by: Vec::new(),
            });
        }

        let builder = Builder::new(repository_id.clone(), name, position);
        sqlx::query(
            "INSERT INTO builders (id, repository_id, name, position) VALUES (?, ?, ?, ?)",
        )
        .bind(builder.id.to_string())
        .bind(repository_id.to_string())
        .bind(name)
        .bind(position)
        .execute(pool)
        .await?;

        Ok(builder)
    }

    /// Statuses of this builder's builds in the most recent buildset that
    /// contains any. Empty when the builder never built.
    pub async fn latest_build_statuses(
        pool: &DbPool,
        builder_id: &BuilderId,
    ) -> Result<Vec<BuildStatus>> {
        let rows = sqlx::query(
            r#"
            SELECT b.status
            FROM builds b
            WHERE b.builder_id = ?
              AND b.buildset_id = (
                SELECT bs.id FROM buildsets bs
                JOIN builds b2 ON b2.buildset_id = bs.id
                WHERE b2.builder_id = ?
                ORDER BY bs.created_at DESC
                LIMIT 1
              )
            "#,
        )
        .bind(builder_id.to_string())
        .bind(builder_id.to_string())
        .fetch_all(pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get::<String, _>("status").parse().ok())
            .collect())
    }
}
