//! Named distributed write-locks.
//!
//! Slave mutations (queue accounting, host resolution, the build entry
//! point) are serialized by a named lock held in the store, so every
//! master process contends on the same row. A lock row carries an expiry
//! so a crashed holder never wedges the fabric.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use ulid::Ulid;

use crate::db::DbPool;
use crate::error::Result;

/// How long a held lock stays valid before a crashed holder is evicted.
/// Must outlast a slave build session, which holds its lock for the whole
/// stream.
const LOCK_TTL: chrono::Duration = chrono::Duration::seconds(3600);

/// A named write-lock.
pub struct Lock {
    pool: DbPool,
    name: String,
}

impl Lock {
    pub fn new(pool: &DbPool, name: impl Into<String>) -> Self {
        Self {
            pool: pool.clone(),
            name: name.into(),
        }
    }

    /// Acquires the lock, retrying with jitter until it is free. Waiters
    /// may queue behind a long build session; only a crashed holder's TTL
    /// expiry breaks the wait.
    pub async fn acquire_write(&self) -> Result<LockGuard> {
        let holder = Ulid::new().to_string();

        loop {
            let now = Utc::now();

            sqlx::query("DELETE FROM locks WHERE name = ? AND expires_at < ?")
                .bind(&self.name)
                .bind(now.to_rfc3339())
                .execute(&self.pool)
                .await?;

            let result = sqlx::query(
                "INSERT OR IGNORE INTO locks (name, holder, expires_at) VALUES (?, ?, ?)",
            )
            .bind(&self.name)
            .bind(&holder)
            .bind((now + LOCK_TTL).to_rfc3339())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                return Ok(LockGuard {
                    pool: self.pool.clone(),
                    name: self.name.clone(),
                    holder,
                    released: false,
                });
            }

            let jitter = rand::thread_rng().gen_range(50..150);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }
}

/// A held lock. Release it explicitly; dropping it without releasing
/// schedules the release on the runtime as a backstop.
pub struct LockGuard {
    pool: DbPool,
    name: String,
    holder: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        tokio::spawn(async move {
            let _ = sqlx::query("DELETE FROM locks WHERE name = ? AND holder = ?")
                .bind(&name)
                .bind(&holder)
                .execute(&pool)
                .await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, run_migrations};

    async fn test_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = test_pool().await;
        let lock = Lock::new(&pool, "slave-1");

        let guard = lock.acquire_write().await.unwrap();
        guard.release().await.unwrap();

        // Free again after release.
        let guard = lock.acquire_write().await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_contention_waits_for_release() {
        let pool = test_pool().await;
        let lock_a = Lock::new(&pool, "slave-1");
        let lock_b = Lock::new(&pool, "slave-1");

        let guard = lock_a.acquire_write().await.unwrap();

        let contender = tokio::spawn(async move { lock_b.acquire_write().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!contender.is_finished());

        guard.release().await.unwrap();
        let guard_b = contender.await.unwrap().unwrap();
        guard_b.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_independent_names_dont_contend() {
        let pool = test_pool().await;
        let guard_a = Lock::new(&pool, "slave-1").acquire_write().await.unwrap();
        let guard_b = Lock::new(&pool, "slave-2").acquire_write().await.unwrap();
        guard_a.release().await.unwrap();
        guard_b.release().await.unwrap();
    }
}
