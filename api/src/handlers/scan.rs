use axum::{extract::rejection::JsonRejection, extract::State, Json};
use std::time::Instant;

use crate::handlers::ErrorResponse;
use crate::state::AppState;
use common::db::repositories::EvaluationRepository;
use common::models::{Assessment, EvaluationMetric, ScanRequest};
use common::scan::parse_target;
use common::telemetry;

/// Assess a URL submitted by the extension and record an evaluation metric.
///
/// Only the URL host is stored. A rejected insert is logged and the
/// assessment is still returned; an unreachable database is reported as `503`.
#[tracing::instrument(skip(state, payload), fields(host))]
pub async fn scan(
    State(state): State<AppState>,
    payload: Result<Json<ScanRequest>, JsonRejection>,
) -> Result<Json<Assessment>, ErrorResponse> {
    let Json(req) =
        payload.map_err(|rejection| ErrorResponse::new("validation_error", rejection.body_text()))?;

    let target = parse_target(&req.url)?;
    let host = target.host_str().unwrap_or_default().to_string();
    tracing::Span::current().record("host", host.as_str());

    let started = Instant::now();
    let assessment = state.detector.assess(&target, req.scan_data.as_ref());
    let elapsed = started.elapsed();
    telemetry::record_scan(assessment.safety, elapsed.as_secs_f64());

    let metric = EvaluationMetric::from_assessment(host, &assessment, elapsed.as_micros() as u64);

    let mut conn = state
        .pool
        .acquire()
        .await
        .map_err(|e| ErrorResponse::from_database_error(e.into(), state.retry_after_seconds()))?;

    match EvaluationRepository::insert(&mut conn, &metric).await {
        Ok(()) => state.pool.release(conn),
        Err(e) if e.is_unavailable() => {
            conn.discard();
            return Err(ErrorResponse::from_database_error(
                e,
                state.retry_after_seconds(),
            ));
        }
        Err(e) => {
            state.pool.release(conn);
            tracing::warn!(error = %e, "Failed to record evaluation metric");
        }
    }

    tracing::info!(
        safety = %assessment.safety,
        confidence = assessment.confidence,
        reasons = assessment.reasons.len(),
        "Scan completed"
    );

    Ok(Json(assessment))
}
