use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{ApplicantId, ReviewVerdict, StageKind, StagePayload};
use super::liveness::{Challenge, LivenessError, SubmittedFrames};
use super::oracle::VerificationOracle;
use super::registry::{EnrollmentError, EnrollmentRegistry};
use super::repository::{ApplicantRepository, RepositoryError, ReviewQueueFilter};

/// Reviewer decision body for `POST /applicants/:applicant_id/decision`.
#[derive(Debug, Clone, Deserialize)]
pub struct DecisionRequest {
    pub reviewer_id: String,
    pub verdict: ReviewVerdict,
    #[serde(default)]
    pub reason_code: Option<String>,
}

/// One uploaded capture for `POST /applicants/:applicant_id/liveness-session`.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameUpload {
    pub challenge: Challenge,
    pub frame_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessSessionRequest {
    pub frames: Vec<FrameUpload>,
}

type Registry<R, O> = Arc<EnrollmentRegistry<R, O>>;

/// HTTP endpoints for applicants and reviewers.
pub fn onboarding_router<R, O>(registry: Registry<R, O>) -> Router
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    Router::new()
        .route(
            "/api/v1/onboarding/applicants",
            post(create_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id",
            get(applicant_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/stages/:stage",
            post(submit_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/stages/:stage/start",
            post(start_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/stages/:stage/retry",
            post(retry_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/liveness-session",
            post(liveness_session_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/decision",
            post(decision_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/applicants/:applicant_id/audit",
            get(audit_handler::<R, O>),
        )
        .route(
            "/api/v1/onboarding/review-queue",
            get(review_queue_handler::<R, O>),
        )
        .with_state(registry)
}

pub(crate) async fn create_handler<R, O>(State(registry): State<Registry<R, O>>) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    match registry
        .create_applicant()
        .and_then(|applicant_id| registry.get_applicant(&applicant_id))
    {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn applicant_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    match registry.get_applicant(&ApplicantId(applicant_id)) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn start_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path((applicant_id, raw_stage)): Path<(String, String)>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    let Some(stage) = StageKind::parse(&raw_stage) else {
        return unknown_stage(&raw_stage);
    };
    match registry
        .start_stage(&ApplicantId(applicant_id), stage)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record.view())).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn submit_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path((applicant_id, raw_stage)): Path<(String, String)>,
    Json(payload): Json<StagePayload>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    let Some(stage) = StageKind::parse(&raw_stage) else {
        return unknown_stage(&raw_stage);
    };
    match registry
        .submit_stage_payload(&ApplicantId(applicant_id), stage, payload)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record.view())).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn retry_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path((applicant_id, raw_stage)): Path<(String, String)>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    let Some(stage) = StageKind::parse(&raw_stage) else {
        return unknown_stage(&raw_stage);
    };
    match registry
        .retry_stage(&ApplicantId(applicant_id), stage)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record.view())).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn liveness_session_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path(applicant_id): Path<String>,
    Json(request): Json<LivenessSessionRequest>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    let frames = SubmittedFrames::new(
        request
            .frames
            .into_iter()
            .map(|upload| (upload.challenge, upload.frame_ref)),
    );
    match registry
        .run_liveness_session(&ApplicantId(applicant_id), &frames)
        .await
    {
        Ok(record) => (StatusCode::OK, Json(record.view())).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn decision_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path(applicant_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    match registry
        .decide(
            &ApplicantId(applicant_id),
            &request.reviewer_id,
            request.verdict,
            request.reason_code,
        )
        .await
    {
        Ok(decision) => (StatusCode::OK, Json(decision)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn review_queue_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Query(filter): Query<ReviewQueueFilter>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    match registry.list_pending_review(&filter) {
        Ok(applicants) => (StatusCode::OK, Json(applicants)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn audit_handler<R, O>(
    State(registry): State<Registry<R, O>>,
    Path(applicant_id): Path<String>,
) -> Response
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    match registry.audit_trail(&ApplicantId(applicant_id)) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(error) => error_response(error),
    }
}

fn unknown_stage(raw: &str) -> Response {
    let payload = json!({ "error": format!("unknown stage '{raw}'") });
    (StatusCode::NOT_FOUND, Json(payload)).into_response()
}

pub(crate) fn status_for(error: &EnrollmentError) -> StatusCode {
    match error {
        EnrollmentError::NotFound(_)
        | EnrollmentError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        EnrollmentError::Validation { .. }
        | EnrollmentError::PayloadMismatch { .. }
        | EnrollmentError::MissingReason
        | EnrollmentError::MissingReviewer
        | EnrollmentError::Liveness(LivenessError::Aborted(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        EnrollmentError::StageOrderViolation { .. }
        | EnrollmentError::InvalidTransition { .. }
        | EnrollmentError::AlreadyDecided(_)
        | EnrollmentError::NotReviewable { .. }
        | EnrollmentError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
        EnrollmentError::CheckTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        EnrollmentError::AllocatorExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        EnrollmentError::Liveness(_)
        | EnrollmentError::Allocation(_)
        | EnrollmentError::Repository(RepositoryError::Unavailable(_)) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: EnrollmentError) -> Response {
    let status = status_for(&error);
    let payload = match &error {
        EnrollmentError::Validation { stage, errors } => json!({
            "error": error.to_string(),
            "stage": stage,
            "field_errors": errors,
        }),
        EnrollmentError::StageOrderViolation { stage, blocked_by } => json!({
            "error": error.to_string(),
            "stage": stage,
            "blocked_by": blocked_by,
        }),
        EnrollmentError::CheckTimeout { stage, check } => json!({
            "error": error.to_string(),
            "stage": stage,
            "check": check,
            "retryable": true,
        }),
        _ => json!({ "error": error.to_string() }),
    };
    (status, Json(payload)).into_response()
}
