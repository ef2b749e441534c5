// Evaluation metrics repository
// Works on a checked-out connection so callers control the pool scope.

use crate::errors::DatabaseError;
use crate::models::{EvaluationMetric, EvaluationSummary};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::instrument;

/// Repository for the `evaluation_metrics` table
pub struct EvaluationRepository;

impl EvaluationRepository {
    /// Persist one evaluation
    #[instrument(skip(conn, metric), fields(metric_id = %metric.id, safety = %metric.safety))]
    pub async fn insert(
        conn: &mut PgConnection,
        metric: &EvaluationMetric,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO evaluation_metrics (
                id, url_host, safety, confidence, reason_count, detector_micros, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(metric.id)
        .bind(&metric.url_host)
        .bind(metric.safety.as_str())
        .bind(i16::from(metric.confidence))
        .bind(metric.reason_count as i32)
        .bind(metric.detector_micros as i64)
        .bind(metric.recorded_at)
        .execute(&mut *conn)
        .await?;

        tracing::debug!("Evaluation metric recorded");
        Ok(())
    }

    /// Counts per verdict and mean confidence over every stored evaluation
    #[instrument(skip(conn))]
    pub async fn summary(conn: &mut PgConnection) -> Result<EvaluationSummary, DatabaseError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE safety = 'safe') AS safe,
                COUNT(*) FILTER (WHERE safety = 'suspicious') AS suspicious,
                COUNT(*) FILTER (WHERE safety = 'dangerous') AS dangerous,
                AVG(confidence)::DOUBLE PRECISION AS mean_confidence,
                MAX(recorded_at) AS last_recorded_at
            FROM evaluation_metrics
            "#,
        )
        .fetch_one(&mut *conn)
        .await?;

        Ok(EvaluationSummary {
            total: row.try_get("total")?,
            safe: row.try_get("safe")?,
            suspicious: row.try_get("suspicious")?,
            dangerous: row.try_get("dangerous")?,
            mean_confidence: row.try_get("mean_confidence")?,
            last_recorded_at: row.try_get("last_recorded_at")?,
        })
    }
}
