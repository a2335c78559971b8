use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::config::OnboardingConfig;
use crate::workflows::onboarding::domain::{
    Applicant, ApplicantId, DocumentType, IdDocuments, KycDetails, LivenessConsent, PersonalInfo,
    PhotoSubmission, StageKind, StagePayload,
};
use crate::workflows::onboarding::engine::EditPolicy;
use crate::workflows::onboarding::liveness::{
    CaptureAborted, CaptureFrame, Challenge, LivenessCapture,
};
use crate::workflows::onboarding::repository::{
    ApplicantRepository, RepositoryError, ReviewQueueFilter,
};
use crate::workflows::onboarding::{
    EnrollmentRegistry, FixedClock, InMemoryApplicantRepository, InMemoryAuditTrail,
    SequenceAllocator, SimulatedOracle,
};

pub(super) type TestRegistry = EnrollmentRegistry<InMemoryApplicantRepository, SimulatedOracle>;

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0)
        .single()
        .expect("valid timestamp")
}

pub(super) fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
}

pub(super) fn config() -> OnboardingConfig {
    OnboardingConfig {
        check_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(250),
        oracle_attempts: 3,
        challenge_window: Duration::from_secs(5),
        account_prefix: "SAV".to_string(),
        account_sequence_limit: 999,
        edit_policy: EditPolicy::CascadeInvalidate,
    }
}

/// Settings for multi-threaded runtimes, where virtual time is unavailable.
pub(super) fn fast_config() -> OnboardingConfig {
    OnboardingConfig {
        poll_interval: Duration::from_millis(1),
        ..config()
    }
}

pub(super) fn personal_info() -> PersonalInfo {
    PersonalInfo {
        full_name: "Amara Okafor".to_string(),
        date_of_birth: Some(date(1991, 6, 2)),
        email: "amara.okafor@example.org".to_string(),
        phone: "+234 803 555 0192".to_string(),
        address: "14 Marina Road, Lagos".to_string(),
        national_id: "NIN-48213977".to_string(),
    }
}

pub(super) fn kyc_details() -> KycDetails {
    KycDetails {
        document_type: Some(DocumentType::NationalId),
        document_number: "A1234567".to_string(),
        issuing_country: "NG".to_string(),
        issue_date: Some(date(2021, 5, 10)),
        expiry_date: Some(date(2031, 5, 9)),
        occupation: "Pharmacist".to_string(),
        source_of_funds: "Salary".to_string(),
        consent_confirmed: true,
    }
}

pub(super) fn id_documents(document_type: DocumentType) -> IdDocuments {
    IdDocuments {
        document_type: Some(document_type),
        front_image: "uploads/front.jpg".to_string(),
        back_image: match document_type {
            DocumentType::Passport => None,
            _ => Some("uploads/back.jpg".to_string()),
        },
        selfie_image: "uploads/selfie.jpg".to_string(),
    }
}

pub(super) fn liveness_consent() -> LivenessConsent {
    LivenessConsent {
        device_id: "device-7f3a".to_string(),
        capture_consent: true,
    }
}

pub(super) fn photo() -> PhotoSubmission {
    PhotoSubmission {
        photo_ref: "uploads/portrait.png".to_string(),
        content_type: "image/png".to_string(),
        size_bytes: 482_113,
    }
}

pub(super) fn payload_for(stage: StageKind) -> StagePayload {
    match stage {
        StageKind::PersonalInfo => StagePayload::PersonalInfo(personal_info()),
        StageKind::Kyc => StagePayload::Kyc(kyc_details()),
        StageKind::IdVerification => {
            StagePayload::IdVerification(id_documents(DocumentType::NationalId))
        }
        StageKind::Liveness => StagePayload::Liveness(liveness_consent()),
        StageKind::PhotoUpload => StagePayload::PhotoUpload(photo()),
    }
}

pub(super) struct Harness {
    pub(super) registry: Arc<TestRegistry>,
    pub(super) repository: Arc<InMemoryApplicantRepository>,
    pub(super) oracle: Arc<SimulatedOracle>,
    pub(super) audit: Arc<InMemoryAuditTrail>,
    pub(super) allocator: Arc<SequenceAllocator>,
    pub(super) clock: Arc<FixedClock>,
}

pub(super) fn harness(oracle: SimulatedOracle) -> Harness {
    harness_with(oracle, config(), SequenceAllocator::new("SAV", 999))
}

pub(super) fn harness_with(
    oracle: SimulatedOracle,
    config: OnboardingConfig,
    allocator: SequenceAllocator,
) -> Harness {
    let repository = Arc::new(InMemoryApplicantRepository::default());
    let oracle = Arc::new(oracle);
    let audit = Arc::new(InMemoryAuditTrail::default());
    let allocator = Arc::new(allocator);
    let clock = Arc::new(FixedClock::new(now()));
    let registry = EnrollmentRegistry::new(
        repository.clone(),
        oracle.clone(),
        allocator.clone(),
        audit.clone(),
        &config,
    )
    .with_clock(clock.clone());

    Harness {
        registry: Arc::new(registry),
        repository,
        oracle,
        audit,
        allocator,
        clock,
    }
}

pub(super) fn default_oracle() -> SimulatedOracle {
    SimulatedOracle::new(Duration::from_millis(500))
}

/// Drive an applicant through every stage up to and including `last`.
pub(super) async fn complete_through(harness: &Harness, applicant_id: &ApplicantId, last: StageKind) {
    for stage in StageKind::ordered()
        .into_iter()
        .take_while(|stage| stage.index() <= last.index())
    {
        harness
            .registry
            .submit_stage_payload(applicant_id, stage, payload_for(stage))
            .await
            .unwrap_or_else(|error| panic!("{stage} submission failed: {error}"));

        if stage == StageKind::Liveness {
            harness
                .registry
                .run_liveness_session(applicant_id, &PassingCapture)
                .await
                .expect("liveness session passes");
        }
    }
}

pub(super) async fn pending_review_applicant(harness: &Harness) -> ApplicantId {
    let applicant_id = harness.registry.create_applicant().expect("creates applicant");
    complete_through(harness, &applicant_id, StageKind::PhotoUpload).await;
    applicant_id
}

pub(super) fn stored(harness: &Harness, applicant_id: &ApplicantId) -> Applicant {
    harness
        .repository
        .fetch(applicant_id)
        .expect("fetch succeeds")
        .expect("applicant present")
}

pub(super) struct PassingCapture;

#[async_trait]
impl LivenessCapture for PassingCapture {
    async fn capture(&self, challenge: Challenge) -> Result<CaptureFrame, CaptureAborted> {
        Ok(CaptureFrame {
            reference: format!("frames/{}.jpg", challenge.key()),
        })
    }
}

/// Applicant closes the camera when `at` is requested.
pub(super) struct AbortingCapture {
    pub(super) at: Challenge,
}

#[async_trait]
impl LivenessCapture for AbortingCapture {
    async fn capture(&self, challenge: Challenge) -> Result<CaptureFrame, CaptureAborted> {
        if challenge == self.at {
            return Err(CaptureAborted {
                reason: "camera closed".to_string(),
            });
        }
        PassingCapture.capture(challenge).await
    }
}

pub(super) struct UnavailableRepository;

impl ApplicantRepository for UnavailableRepository {
    fn insert(&self, _applicant: Applicant) -> Result<Applicant, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _applicant: Applicant) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn pending_review(
        &self,
        _filter: &ReviewQueueFilter,
    ) -> Result<Vec<Applicant>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
