//! Durable cross-reference between remote identities and local accounts
//!
//! One row per remote identity. The local account id starts out NULL and
//! is assigned exactly once; a set id is never overwritten, which is the
//! correctness guarantee under concurrent linking (not serialization).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

/// Cross-reference row mapping one remote identity to at most one local
/// account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct IdentityLink {
    /// External provider's subject identifier; primary correlation key
    pub remote_id: String,
    /// Linked local account, absent until linking completes
    pub local_account_id: Option<i64>,
    /// First observation of this remote identity
    pub created_at: DateTime<Utc>,
}

/// Repository contract for the cross-reference table
///
/// Any relational store with a unique constraint on `remote_id`
/// satisfies it.
#[async_trait]
pub trait IdentityLinkRepository: Send + Sync {
    /// Look up by remote identity
    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<IdentityLink>, sqlx::Error>;

    /// Look up by linked local account
    async fn find_by_local_account_id(
        &self,
        local_account_id: i64,
    ) -> Result<Option<IdentityLink>, sqlx::Error>;

    /// Create the row for a first-seen remote identity.
    ///
    /// Concurrent first-time logins for the same identity must converge
    /// on one row: an insert that loses the race reloads and returns the
    /// winner's row instead of failing.
    async fn insert(&self, remote_id: &str) -> Result<IdentityLink, sqlx::Error>;

    /// Assign the local account id, only if none is set yet.
    ///
    /// Returns `true` when this call performed the assignment, `false`
    /// when the row was already linked (to anything) or does not exist.
    async fn update_local_account_id(
        &self,
        remote_id: &str,
        local_account_id: i64,
    ) -> Result<bool, sqlx::Error>;
}

/// Postgres-backed repository over the `user_xref` table
///
/// Table layout: `remote_id TEXT PRIMARY KEY, local_account_id BIGINT
/// NULL, created_at TIMESTAMPTZ NOT NULL`.
pub struct PgIdentityLinkRepository {
    pool: PgPool,
}

impl PgIdentityLinkRepository {
    /// Create a repository over the given pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityLinkRepository for PgIdentityLinkRepository {
    async fn find_by_remote_id(&self, remote_id: &str) -> Result<Option<IdentityLink>, sqlx::Error> {
        sqlx::query_as::<_, IdentityLink>(
            r"
            SELECT remote_id, local_account_id, created_at
            FROM user_xref
            WHERE remote_id = $1
            ",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_local_account_id(
        &self,
        local_account_id: i64,
    ) -> Result<Option<IdentityLink>, sqlx::Error> {
        sqlx::query_as::<_, IdentityLink>(
            r"
            SELECT remote_id, local_account_id, created_at
            FROM user_xref
            WHERE local_account_id = $1
            ",
        )
        .bind(local_account_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn insert(&self, remote_id: &str) -> Result<IdentityLink, sqlx::Error> {
        // DO NOTHING + reload: a lost race converges on the existing row
        let inserted = sqlx::query_as::<_, IdentityLink>(
            r"
            INSERT INTO user_xref (remote_id, local_account_id, created_at)
            VALUES ($1, NULL, NOW())
            ON CONFLICT (remote_id) DO NOTHING
            RETURNING remote_id, local_account_id, created_at
            ",
        )
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(row) => Ok(row),
            None => self
                .find_by_remote_id(remote_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound),
        }
    }

    async fn update_local_account_id(
        &self,
        remote_id: &str,
        local_account_id: i64,
    ) -> Result<bool, sqlx::Error> {
        // The NULL guard makes the assignment immutable after first set
        let result = sqlx::query(
            r"
            UPDATE user_xref
            SET local_account_id = $2
            WHERE remote_id = $1 AND local_account_id IS NULL
            ",
        )
        .bind(remote_id)
        .bind(local_account_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryIdentityLinkRepository;

    #[tokio::test]
    async fn test_insert_is_idempotent_per_remote_id() {
        let repo = MemoryIdentityLinkRepository::default();

        let first = repo.insert("ext-123").await.unwrap();
        let second = repo.insert("ext-123").await.unwrap();

        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(repo.row_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_logins_create_one_row() {
        let repo = std::sync::Arc::new(MemoryIdentityLinkRepository::default());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let repo = std::sync::Arc::clone(&repo);
                tokio::spawn(async move { repo.insert("ext-race").await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(repo.row_count(), 1);
    }

    #[tokio::test]
    async fn test_update_only_assigns_when_unset() {
        let repo = MemoryIdentityLinkRepository::default();
        repo.insert("ext-123").await.unwrap();

        assert!(repo.update_local_account_id("ext-123", 42).await.unwrap());
        // already linked: second assignment is refused, row unchanged
        assert!(!repo.update_local_account_id("ext-123", 99).await.unwrap());

        let row = repo.find_by_remote_id("ext-123").await.unwrap().unwrap();
        assert_eq!(row.local_account_id, Some(42));
    }

    #[tokio::test]
    async fn test_update_missing_row_writes_nothing() {
        let repo = MemoryIdentityLinkRepository::default();
        assert!(!repo.update_local_account_id("ext-absent", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_find_by_local_account_id() {
        let repo = MemoryIdentityLinkRepository::default();
        repo.insert("ext-a").await.unwrap();
        repo.insert("ext-b").await.unwrap();
        repo.update_local_account_id("ext-b", 7).await.unwrap();

        let found = repo.find_by_local_account_id(7).await.unwrap().unwrap();
        assert_eq!(found.remote_id, "ext-b");
        assert!(repo.find_by_local_account_id(8).await.unwrap().is_none());
    }
}
