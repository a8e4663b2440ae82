use super::{ApiError, HttpAppState};
use crate::ingest::{check_api_key, snapshot_totals, validate_submission, Limits};
use crate::metrics::SubmissionOutcome;
use crate::payload::{FieldError, Submission, SubmissionAccepted, API_KEY_HEADER};
use crate::storage::format_ms;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::error::Category;
use tracing::{info, warn};

pub(super) async fn submit(
    State(state): State<HttpAppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<SubmissionAccepted>), ApiError> {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if !check_api_key(&state.settings.api_key, presented) {
        state.metrics.inc_submission(SubmissionOutcome::Unauthorized);
        warn!(has_key = presented.is_some(), "отклонена заявка с неверным API-ключом");
        return Err(ApiError::Unauthorized);
    }

    let sub: Submission = match serde_json::from_slice(&body) {
        Ok(sub) => sub,
        Err(err) => {
            state.metrics.inc_submission(SubmissionOutcome::Invalid);
            warn!(error = %err, "тело заявки не разобрано");
            // Broken JSON is a bad request; well-formed JSON of the wrong
            // shape is reported like any other field error.
            return Err(match err.classify() {
                Category::Data => {
                    ApiError::Validation(vec![FieldError::new("body", err.to_string())])
                }
                _ => ApiError::BadRequest(err.to_string()),
            });
        }
    };

    let limits = Limits {
        max_processes: state.settings.max_processes_per_snapshot,
    };
    if let Err(errors) = validate_submission(&sub, limits) {
        state.metrics.inc_submission(SubmissionOutcome::Invalid);
        warn!(
            hostname = %sub.hostname,
            errors = errors.len(),
            first = %errors[0],
            "заявка не прошла валидацию"
        );
        return Err(ApiError::Validation(errors));
    }

    let totals = snapshot_totals(&sub);
    let receipt = match state.store.ingest(sub, totals).await {
        Ok(receipt) => receipt,
        Err(err) => {
            state.metrics.inc_submission(SubmissionOutcome::Error);
            return Err(err.into());
        }
    };

    state.metrics.record_ingest(receipt.processes_count, receipt.active_hosts);
    info!(
        hostname = %receipt.hostname,
        snapshot_id = receipt.snapshot_id,
        processes = receipt.processes_count,
        "снимок процессов сохранён"
    );

    Ok((
        StatusCode::CREATED,
        Json(SubmissionAccepted {
            id: receipt.snapshot_id,
            host_id: receipt.host_id,
            hostname: receipt.hostname,
            timestamp: format_ms(receipt.captured_at_ms),
            processes_count: receipt.processes_count,
            status: "success".to_string(),
        }),
    ))
}
