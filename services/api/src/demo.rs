use crate::infra::{build_registry, simulated_oracle, ConsoleCapture, ServiceRegistry, Wiring};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use clap::Args;
use coop_onboarding::config::OnboardingConfig;
use coop_onboarding::error::AppError;
use coop_onboarding::workflows::onboarding::{
    ApplicantId, AuditActor, Challenge, Clock, DocumentType, EnrollmentError, FixedClock,
    IdDocuments, KycDetails, LivenessConsent, PersonalInfo, PhotoSubmission, ReviewQueueFilter,
    ReviewVerdict, StageKind, StagePayload,
};
use std::sync::Arc;
use std::time::Duration;

const DEVICE_ID: &str = "demo-handset-01";

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Pin the demo clock to this date (YYYY-MM-DD). Defaults to the system clock.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
    /// Simulated verification latency in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub(crate) oracle_latency_ms: u64,
    /// Reject the applicant with this reason code instead of approving.
    #[arg(long)]
    pub(crate) reject: Option<String>,
    /// Make the named verification check never resolve (e.g. `sanctions_screening`).
    #[arg(long)]
    pub(crate) hang_check: Option<String>,
    /// Close the camera when this liveness challenge is requested.
    #[arg(long, value_parser = crate::infra::parse_challenge)]
    pub(crate) abandon_at: Option<Challenge>,
}

fn demo_config() -> OnboardingConfig {
    OnboardingConfig {
        check_timeout: Duration::from_secs(3),
        poll_interval: Duration::from_millis(50),
        challenge_window: Duration::from_secs(3),
        ..OnboardingConfig::default()
    }
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        today,
        oracle_latency_ms,
        reject,
        hang_check,
        abandon_at,
    } = args;

    let mut oracle = simulated_oracle(oracle_latency_ms);
    if let Some(check) = hang_check.as_deref() {
        oracle = oracle.hanging(check);
    }

    let clock: Option<Arc<dyn Clock>> =
        today.map(|date| Arc::new(FixedClock::new(date.and_time(NaiveTime::MIN).and_utc())) as _);
    let today = today.unwrap_or_else(|| Utc::now().date_naive());

    let config = demo_config();
    let wiring = build_registry(&config, oracle, clock);
    let registry = wiring.registry.clone();

    println!("Cooperative member onboarding demo");
    println!(
        "  Reference date: {} | edit policy: {} | oracle latency: {} ms",
        today,
        config.edit_policy.label(),
        oracle_latency_ms
    );

    let applicant_id = registry.create_applicant()?;
    println!("  Applicant created: {}", applicant_id);

    let capture = ConsoleCapture {
        device_id: DEVICE_ID.to_string(),
        abandon_at,
    };

    println!("\nStage progress");
    for stage in StageKind::ordered() {
        if !advance_stage(&registry, &applicant_id, stage, today, &capture).await? {
            return finish(&wiring, &applicant_id);
        }
    }

    let queue = registry.list_pending_review(&ReviewQueueFilter::default())?;
    println!("\nReview queue ({} waiting)", queue.len());
    for entry in &queue {
        println!(
            "  - {} submitted {}",
            entry.applicant_id,
            entry
                .submitted_for_review_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }

    let verdict = if reject.is_some() {
        ReviewVerdict::Rejected
    } else {
        ReviewVerdict::Approved
    };
    match registry
        .decide(&applicant_id, "reviewer-demo", verdict, reject)
        .await
    {
        Ok(decision) => println!("\nDecision: {}", decision.summary()),
        Err(err) => println!("\nDecision unavailable: {}", err),
    }

    finish(&wiring, &applicant_id)
}

/// Returns `false` when the applicant cannot move past `stage` in this run.
async fn advance_stage(
    registry: &ServiceRegistry,
    applicant_id: &ApplicantId,
    stage: StageKind,
    today: NaiveDate,
    capture: &ConsoleCapture,
) -> Result<bool, AppError> {
    let record = match registry
        .submit_stage_payload(applicant_id, stage, demo_payload(stage, today))
        .await
    {
        Ok(record) => record,
        Err(err @ EnrollmentError::CheckTimeout { .. }) => {
            println!("  {:<16} timed out: {}", stage.label(), err);
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };

    let record = if stage == StageKind::Liveness {
        println!("  {:<16} {}", stage.label(), record.status.label());
        match registry.run_liveness_session(applicant_id, capture).await {
            Ok(record) => record,
            Err(err) => {
                println!("  {:<16} session ended: {}", stage.label(), err);
                return Ok(false);
            }
        }
    } else {
        record
    };

    let passed = record
        .checks
        .iter()
        .filter(|check| !check.is_blocking_failure())
        .count();
    println!(
        "  {:<16} {} (attempt {}, {}/{} checks ok)",
        stage.label(),
        record.status.label(),
        record.attempt,
        passed,
        record.checks.len()
    );
    Ok(true)
}

fn finish(wiring: &Wiring, applicant_id: &ApplicantId) -> Result<(), AppError> {
    let entries = wiring.registry.audit_trail(applicant_id)?;
    println!("\nAudit trail");
    for entry in &entries {
        let actor = match &entry.actor {
            AuditActor::Applicant => "applicant".to_string(),
            AuditActor::Reviewer(id) => format!("reviewer:{id}"),
            AuditActor::System => "system".to_string(),
        };
        let event = serde_json::to_string(&entry.event)
            .unwrap_or_else(|err| format!("<unrenderable event: {err}>"));
        println!(
            "  #{:<3} {} {:<16} {}",
            entry.sequence,
            entry.recorded_at.format("%H:%M:%S"),
            actor,
            event
        );
    }

    println!(
        "\nOracle submissions: {} | audit entries recorded: {}",
        wiring.oracle.distinct_submissions(),
        wiring.audit.len()
    );

    match wiring.registry.get_applicant(applicant_id) {
        Ok(view) => match serde_json::to_string_pretty(&view) {
            Ok(json) => println!("\nApplicant status payload:\n{}", json),
            Err(err) => println!("\nApplicant status payload unavailable: {}", err),
        },
        Err(err) => println!("\nApplicant lookup failed: {}", err),
    }
    Ok(())
}

fn demo_payload(stage: StageKind, today: NaiveDate) -> StagePayload {
    match stage {
        StageKind::PersonalInfo => StagePayload::PersonalInfo(PersonalInfo {
            full_name: "Kwame Mensah".to_string(),
            date_of_birth: Some(today - ChronoDuration::days(34 * 365)),
            email: "kwame.mensah@example.org".to_string(),
            phone: "+233 24 555 0147".to_string(),
            address: "7 Ring Road East, Accra".to_string(),
            national_id: "GHA-712334905-3".to_string(),
        }),
        StageKind::Kyc => StagePayload::Kyc(KycDetails {
            document_type: Some(DocumentType::NationalId),
            document_number: "GH7123349".to_string(),
            issuing_country: "GH".to_string(),
            issue_date: Some(today - ChronoDuration::days(3 * 365)),
            expiry_date: Some(today + ChronoDuration::days(7 * 365)),
            occupation: "Civil engineer".to_string(),
            source_of_funds: "Salary".to_string(),
            consent_confirmed: true,
        }),
        StageKind::IdVerification => StagePayload::IdVerification(IdDocuments {
            document_type: Some(DocumentType::NationalId),
            front_image: "uploads/demo/id-front.jpg".to_string(),
            back_image: Some("uploads/demo/id-back.jpg".to_string()),
            selfie_image: "uploads/demo/selfie.jpg".to_string(),
        }),
        StageKind::Liveness => StagePayload::Liveness(LivenessConsent {
            device_id: DEVICE_ID.to_string(),
            capture_consent: true,
        }),
        StageKind::PhotoUpload => StagePayload::PhotoUpload(PhotoSubmission {
            photo_ref: "uploads/demo/portrait.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            size_bytes: 356_912,
        }),
    }
}
