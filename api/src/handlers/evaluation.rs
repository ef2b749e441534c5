use axum::extract::State;

use crate::handlers::{ErrorResponse, SuccessResponse};
use crate::state::AppState;
use common::db::repositories::EvaluationRepository;
use common::models::EvaluationSummary;

/// Aggregate counts per verdict and mean confidence over all recorded scans
#[tracing::instrument(skip(state))]
pub async fn summary(
    State(state): State<AppState>,
) -> Result<SuccessResponse<EvaluationSummary>, ErrorResponse> {
    let retry_after = state.retry_after_seconds();
    let mut conn = state
        .pool
        .acquire()
        .await
        .map_err(|e| ErrorResponse::from_database_error(e.into(), retry_after))?;

    match EvaluationRepository::summary(&mut conn).await {
        Ok(summary) => {
            state.pool.release(conn);
            Ok(SuccessResponse::new(summary))
        }
        Err(e) => {
            if e.is_unavailable() {
                conn.discard();
            } else {
                state.pool.release(conn);
            }
            Err(ErrorResponse::from_database_error(e, retry_after))
        }
    }
}
