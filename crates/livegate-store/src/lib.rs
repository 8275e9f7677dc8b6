//! livegate-store — SQLite persistence for calibrated liveness thresholds.
//!
//! One record per user. A new enrollment replaces the stored record
//! wholesale. Missing or unreadable records surface as `None` so callers
//! fall back to the engine's default bounds.

use std::path::Path;

use livegate_core::PersonalizedThresholds;
use rusqlite::OptionalExtension;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("threshold encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("refusing to store non-finite thresholds")]
    NonFiniteThresholds,
    #[error("failed to create database directory: {0}")]
    Io(#[source] std::io::Error),
}

/// SQLite-backed store for [`PersonalizedThresholds`], keyed by user.
#[derive(Clone)]
pub struct ThresholdStore {
    conn: Connection,
}

impl ThresholdStore {
    /// Open (or create) the database at the given path and run migrations.
    ///
    /// `:memory:` opens a private in-memory database.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
            }
        }

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS thresholds (
                     user TEXT PRIMARY KEY,
                     calculation_date TEXT NOT NULL,
                     payload TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "threshold store opened");
        Ok(Self { conn })
    }

    /// Store thresholds for `user`, replacing any previous record.
    pub async fn save(
        &self,
        user: &str,
        thresholds: &PersonalizedThresholds,
    ) -> Result<(), StoreError> {
        if !thresholds.is_finite() {
            return Err(StoreError::NonFiniteThresholds);
        }

        let payload = serde_json::to_string(thresholds)?;
        let calculation_date = thresholds.calculation_date.to_rfc3339();
        let updated_at = chrono::Utc::now().to_rfc3339();
        let user = user.to_string();
        let log_user = user.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO thresholds (user, calculation_date, payload, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(user) DO UPDATE SET
                         calculation_date = excluded.calculation_date,
                         payload = excluded.payload,
                         updated_at = excluded.updated_at",
                    rusqlite::params![user, calculation_date, payload, updated_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(user = %log_user, "personalized thresholds saved");
        Ok(())
    }

    /// Load thresholds for `user`.
    ///
    /// Absence, database errors and undecodable payloads all yield `None`:
    /// the caller then uses default bounds.
    pub async fn load(&self, user: &str) -> Option<PersonalizedThresholds> {
        let key = user.to_string();
        let payload = self
            .conn
            .call(move |conn| {
                let payload = conn
                    .query_row(
                        "SELECT payload FROM thresholds WHERE user = ?1",
                        [&key],
                        |row| row.get::<_, String>(0),
                    )
                    .optional()?;
                Ok(payload)
            })
            .await;

        let payload = match payload {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!(user, "no personalized thresholds stored");
                return None;
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "threshold lookup failed — using defaults");
                return None;
            }
        };

        match serde_json::from_str::<PersonalizedThresholds>(&payload) {
            Ok(t) if t.is_finite() => Some(t),
            Ok(_) => {
                tracing::warn!(user, "stored thresholds are non-finite — using defaults");
                None
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "stored thresholds undecodable — using defaults");
                None
            }
        }
    }

    /// Remove the record for `user`. Returns whether one existed.
    pub async fn remove(&self, user: &str) -> Result<bool, StoreError> {
        let user = user.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute("DELETE FROM thresholds WHERE user = ?1", [&user])?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List stored records (metadata only), ordered by user.
    pub async fn list(&self) -> Result<Vec<ThresholdInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT user, calculation_date, updated_at
                     FROM thresholds ORDER BY user",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(ThresholdInfo {
                        user: row.get(0)?,
                        calculation_date: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                })?;
                let infos = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(infos)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// Metadata about a stored threshold record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThresholdInfo {
    pub user: String,
    pub calculation_date: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn thresholds(min_mean_depth: f32) -> PersonalizedThresholds {
        PersonalizedThresholds {
            calculation_date: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            min_mean_depth,
            max_mean_depth: 0.62,
            min_std_dev: 0.021,
            min_range: 0.07,
            min_edge_std_dev: 0.018,
            min_center_std_dev: 0.006,
            max_gradient_mean: 0.031,
            min_gradient_std_dev: 0.0042,
        }
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        let saved = thresholds(0.41);
        store.save("alice", &saved).await.unwrap();

        let loaded = store.load("alice").await.unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(
            loaded.min_gradient_std_dev.to_bits(),
            saved.min_gradient_std_dev.to_bits()
        );
    }

    #[tokio::test]
    async fn test_missing_user_is_none() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        assert!(store.load("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_save_replaces_whole_record() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        store.save("alice", &thresholds(0.41)).await.unwrap();
        let mut newer = thresholds(0.45);
        newer.max_gradient_mean = 0.02;
        store.save("alice", &newer).await.unwrap();

        assert_eq!(store.load("alice").await.unwrap(), newer);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_non_finite() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        let err = store
            .save("alice", &thresholds(f32::NAN))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonFiniteThresholds));
        assert!(store.load("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_none() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        store
            .conn
            .call(|conn| {
                conn.execute(
                    "INSERT INTO thresholds (user, calculation_date, payload, updated_at)
                     VALUES ('mallory', 'x', '{not json', 'x')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(store.load("mallory").await.is_none());
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let store = ThresholdStore::open(Path::new(":memory:")).await.unwrap();
        store.save("alice", &thresholds(0.41)).await.unwrap();
        store.save("bob", &thresholds(0.8)).await.unwrap();

        assert!(!store.remove("carol").await.unwrap());
        assert!(store.remove("alice").await.unwrap());
        assert!(store.load("alice").await.is_none());
        assert!((store.load("bob").await.unwrap().min_mean_depth - 0.8).abs() < 1e-6);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].user, "bob");
        assert!(listed[0].calculation_date.starts_with("2026-03-01"));
    }
}
