//! Experiment archive persistence.
//!
//! A completed (or deliberately archived) experiment is stored as one
//! JSONB [`ExperimentArchive`] blob together with a few plain columns for
//! listing. Saving the same experiment again replaces its archive.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use vcweb_core::ExperimentArchive;
use vcweb_types::{ExperimentId, ExperimenterId};

use crate::error::DbError;

/// Operations on the `experiment_archives` table.
pub struct ArchiveStore<'a> {
    pool: &'a PgPool,
}

impl<'a> ArchiveStore<'a> {
    /// Create a new archive store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace the archive of `archive.id`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the archive cannot be encoded,
    /// or [`DbError::Postgres`] if the upsert fails.
    pub async fn save(&self, archive: &ExperimentArchive) -> Result<(), DbError> {
        let blob = serde_json::to_value(archive)?;
        let round = i64::from(archive.current_round_sequence_number);

        sqlx::query(
            r"INSERT INTO experiment_archives
                (id, experimenter_id, name, status, current_round_sequence_number, archive, archived_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7)
              ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                current_round_sequence_number = EXCLUDED.current_round_sequence_number,
                archive = EXCLUDED.archive,
                archived_at = EXCLUDED.archived_at",
        )
        .bind(archive.id.into_inner())
        .bind(archive.experimenter.into_inner())
        .bind(&archive.name)
        .bind(archive.status.as_str())
        .bind(round)
        .bind(&blob)
        .bind(archive.archived_at)
        .execute(self.pool)
        .await?;

        tracing::info!(
            experiment_id = %archive.id,
            status = archive.status.as_str(),
            "Saved experiment archive"
        );
        Ok(())
    }

    /// Load the archive of one experiment.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails, or
    /// [`DbError::Serialization`] if the stored blob does not decode.
    pub async fn load(&self, id: ExperimentId) -> Result<Option<ExperimentArchive>, DbError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as(r"SELECT archive FROM experiment_archives WHERE id = $1")
                .bind(id.into_inner())
                .fetch_optional(self.pool)
                .await?;

        row.map(|(blob,)| decode_archive(blob)).transpose()
    }

    /// Archive summaries, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list(&self, limit: i64) -> Result<Vec<ArchiveRow>, DbError> {
        let rows = sqlx::query_as::<_, ArchiveRow>(
            r"SELECT id, experimenter_id, name, status, current_round_sequence_number, archived_at
              FROM experiment_archives
              ORDER BY archived_at DESC
              LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }

    /// Archive summaries of one experimenter, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_for_experimenter(
        &self,
        experimenter: ExperimenterId,
    ) -> Result<Vec<ArchiveRow>, DbError> {
        let rows = sqlx::query_as::<_, ArchiveRow>(
            r"SELECT id, experimenter_id, name, status, current_round_sequence_number, archived_at
              FROM experiment_archives
              WHERE experimenter_id = $1
              ORDER BY archived_at DESC",
        )
        .bind(experimenter.into_inner())
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete an archive. Returns whether a row was removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the delete fails.
    pub async fn delete(&self, id: ExperimentId) -> Result<bool, DbError> {
        let result = sqlx::query(r"DELETE FROM experiment_archives WHERE id = $1")
            .bind(id.into_inner())
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn decode_archive(blob: serde_json::Value) -> Result<ExperimentArchive, DbError> {
    Ok(serde_json::from_value(blob)?)
}

/// A listing row from the `experiment_archives` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArchiveRow {
    /// Experiment id.
    pub id: Uuid,
    /// Owning experimenter.
    pub experimenter_id: Uuid,
    /// Configuration name.
    pub name: String,
    /// Status when archived (`COMPLETED` etc).
    pub status: String,
    /// Round the experiment was on.
    pub current_round_sequence_number: i64,
    /// When the archive was written.
    pub archived_at: DateTime<Utc>,
}
