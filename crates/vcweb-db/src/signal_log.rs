//! Append-only log of experiment signals.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;
use vcweb_types::{ExperimentId, Signal};

use crate::error::DbError;

/// Operations on the `experiment_signals` table.
pub struct SignalLogStore<'a> {
    pool: &'a PgPool,
}

impl<'a> SignalLogStore<'a> {
    /// Create a new signal log bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Append signals in one transaction, in the order given.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if a payload cannot be encoded,
    /// or [`DbError::Postgres`] if an insert fails. Nothing is written on
    /// error.
    pub async fn append(&self, signals: &[Signal]) -> Result<(), DbError> {
        if signals.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for signal in signals {
            let payload = serde_json::to_value(signal)?;
            sqlx::query(
                r"INSERT INTO experiment_signals (experiment_id, signal, payload, raised_at)
                  VALUES ($1, $2, $3, $4)",
            )
            .bind(signal.experiment().into_inner())
            .bind(signal.name())
            .bind(&payload)
            .bind(signal.time())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(count = signals.len(), "Appended signals");
        Ok(())
    }

    /// Signals of one experiment in emission order, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn list_for_experiment(
        &self,
        experiment: ExperimentId,
        limit: i64,
    ) -> Result<Vec<SignalRow>, DbError> {
        let rows = sqlx::query_as::<_, SignalRow>(
            r"SELECT id, experiment_id, signal, payload, raised_at
              FROM experiment_signals
              WHERE experiment_id = $1
              ORDER BY id
              LIMIT $2",
        )
        .bind(experiment.into_inner())
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }
}

/// A row from the `experiment_signals` table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SignalRow {
    /// Insertion order.
    pub id: i64,
    /// Experiment that raised the signal.
    pub experiment_id: Uuid,
    /// Signal name (`round_started` etc).
    pub signal: String,
    /// The serialized signal.
    pub payload: serde_json::Value,
    /// When the signal was raised.
    pub raised_at: DateTime<Utc>,
}

impl SignalRow {
    /// Decode the stored payload.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Serialization`] if the payload does not decode.
    pub fn decode(&self) -> Result<Signal, DbError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
