use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use super::common::*;
use crate::workflows::onboarding::audit::{AuditActor, AuditEvent, AuditTrail};
use crate::workflows::onboarding::domain::{
    AccountNumber, CheckOutcome, CheckResult, DocumentType, KycDetails, MemberId, OverallStatus,
    ReviewVerdict, StageKind, StagePayload, StageStatus,
};
use crate::workflows::onboarding::liveness::{Challenge, LivenessError};
use crate::workflows::onboarding::repository::{RepositoryError, ReviewQueueFilter};
use crate::workflows::onboarding::validation::FieldErrorCode;
use crate::workflows::onboarding::{
    EditPolicy, EnrollmentError, EnrollmentRegistry, InMemoryAuditTrail, SequenceAllocator,
    SimulatedOracle, StageOutcome,
};

#[test]
fn create_applicant_records_draft_and_audit_entry() {
    let harness = harness(default_oracle());

    let applicant_id = harness.registry.create_applicant().expect("creates");
    let second = harness.registry.create_applicant().expect("creates");

    assert_eq!(applicant_id.0, "apl-000001");
    assert_ne!(applicant_id, second);
    let view = harness.registry.get_applicant(&applicant_id).expect("view");
    assert_eq!(view.overall_status, "draft");
    assert_eq!(view.current_stage, StageKind::PersonalInfo);

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].event, AuditEvent::ApplicantCreated);
    assert_eq!(trail[0].actor, AuditActor::Applicant);
}

#[test]
fn unknown_applicant_is_not_found() {
    let harness = harness(default_oracle());
    let missing = crate::workflows::onboarding::ApplicantId("apl-999999".to_string());

    assert!(matches!(
        harness.registry.get_applicant(&missing),
        Err(EnrollmentError::NotFound(id)) if id == missing
    ));
    assert!(matches!(
        harness.registry.audit_trail(&missing),
        Err(EnrollmentError::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn out_of_order_submission_is_rejected_without_side_effects() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    let before = stored(&harness, &applicant_id);

    match harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
    {
        Err(EnrollmentError::StageOrderViolation { stage, blocked_by }) => {
            assert_eq!(stage, StageKind::Kyc);
            assert_eq!(blocked_by, StageKind::PersonalInfo);
        }
        other => panic!("expected stage order violation, got {other:?}"),
    }

    assert_eq!(stored(&harness, &applicant_id), before);
    assert_eq!(harness.audit.for_applicant(&applicant_id).len(), 1);
    assert_eq!(harness.oracle.submit_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn future_issue_date_is_a_field_error() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;

    let payload = StagePayload::Kyc(KycDetails {
        issue_date: Some(date(2030, 1, 1)),
        expiry_date: Some(date(2040, 1, 1)),
        ..kyc_details()
    });
    match harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload)
        .await
    {
        Err(EnrollmentError::Validation { stage, errors }) => {
            assert_eq!(stage, StageKind::Kyc);
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].field, "issue_date");
            assert_eq!(errors[0].code, FieldErrorCode::InFuture);
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    let applicant = stored(&harness, &applicant_id);
    assert_eq!(applicant.stage(StageKind::Kyc).status, StageStatus::NotStarted);
    assert_eq!(harness.oracle.submit_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn kyc_completes_once_oracle_checks_pass() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;

    let record = harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("kyc verified");

    assert_eq!(record.status, StageStatus::Completed);
    let names: Vec<_> = record.checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["identity_registry", "sanctions_screening"]);
    assert!(record
        .checks
        .iter()
        .all(|check| check.outcome == CheckOutcome::Passed && check.confidence.is_some()));

    let view = harness.registry.get_applicant(&applicant_id).expect("view");
    assert_eq!(view.current_stage, StageKind::IdVerification);
    assert_eq!(view.overall_status, "in_progress");
}

#[tokio::test(start_paused = true)]
async fn failed_check_marks_stage_failed_and_retry_reopens_it() {
    let harness = harness(default_oracle().failing("sanctions_screening"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;

    let record = harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("outcome recorded");
    assert_eq!(record.status, StageStatus::Failed);

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    assert_eq!(
        trail.last().map(|entry| &entry.event),
        Some(&AuditEvent::StageFailed {
            stage: StageKind::Kyc,
            failed_checks: vec!["sanctions_screening".to_string()],
        })
    );

    assert!(matches!(
        harness
            .registry
            .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
            .await,
        Err(EnrollmentError::InvalidTransition {
            status: StageStatus::Failed,
            ..
        })
    ));

    let retried = harness
        .registry
        .retry_stage(&applicant_id, StageKind::Kyc)
        .await
        .expect("retry accepted");
    assert_eq!(retried.status, StageStatus::InProgress);
    assert!(retried.checks.is_empty());

    let checks = ["identity_registry", "sanctions_screening"]
        .into_iter()
        .map(|name| {
            let mut check = CheckResult::pending(name, true, now());
            check.resolve(true, Some(0.88), now());
            check
        })
        .collect();
    let record = harness
        .registry
        .record_stage_completion(&applicant_id, StageKind::Kyc, StageOutcome { checks })
        .await
        .expect("manual outcome recorded");
    assert_eq!(record.status, StageStatus::Completed);
}

fn reported(name: &str, mandatory: bool, passed: bool) -> CheckResult {
    let mut check = CheckResult::pending(name, mandatory, now());
    check.resolve(passed, Some(0.8), now());
    check
}

#[tokio::test(start_paused = true)]
async fn reported_outcome_cannot_downgrade_a_mandatory_check() {
    let harness = harness(default_oracle().failing("identity_registry"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;
    harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("outcome recorded");
    harness
        .registry
        .retry_stage(&applicant_id, StageKind::Kyc)
        .await
        .expect("retry accepted");

    let checks = vec![
        reported("identity_registry", false, false),
        reported("sanctions_screening", true, true),
    ];
    let record = harness
        .registry
        .record_stage_completion(&applicant_id, StageKind::Kyc, StageOutcome { checks })
        .await
        .expect("outcome recorded");

    assert_eq!(record.status, StageStatus::Failed);
    assert!(record.checks.iter().all(|check| check.mandatory));
    assert_eq!(
        stored(&harness, &applicant_id).stage(StageKind::Kyc).status,
        StageStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn reported_outcome_with_unknown_check_is_refused() {
    let harness = harness(default_oracle().failing("sanctions_screening"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;
    harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("outcome recorded");
    harness
        .registry
        .retry_stage(&applicant_id, StageKind::Kyc)
        .await
        .expect("retry accepted");
    let audit_before = harness.audit.for_applicant(&applicant_id).len();

    let checks = vec![
        reported("identity_registry", true, true),
        reported("sanctions_screening", true, true),
        reported("credit_bureau", true, true),
    ];
    assert!(matches!(
        harness
            .registry
            .record_stage_completion(&applicant_id, StageKind::Kyc, StageOutcome { checks })
            .await,
        Err(EnrollmentError::InvalidTransition {
            stage: StageKind::Kyc,
            ..
        })
    ));
    assert_eq!(
        stored(&harness, &applicant_id).stage(StageKind::Kyc).status,
        StageStatus::InProgress
    );
    assert_eq!(harness.audit.for_applicant(&applicant_id).len(), audit_before);
}

#[tokio::test(start_paused = true)]
async fn liveness_outcome_needs_every_challenge_in_order() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::IdVerification).await;
    harness
        .registry
        .submit_stage_payload(
            &applicant_id,
            StageKind::Liveness,
            payload_for(StageKind::Liveness),
        )
        .await
        .expect("consent accepted");

    let partial = vec![reported("look_straight", true, true)];
    let mut reversed: Vec<_> = Challenge::ordered()
        .iter()
        .map(|challenge| reported(challenge.key(), true, true))
        .collect();
    reversed.reverse();
    for checks in [partial, reversed, Vec::new()] {
        assert!(matches!(
            harness
                .registry
                .record_stage_completion(&applicant_id, StageKind::Liveness, StageOutcome { checks })
                .await,
            Err(EnrollmentError::InvalidTransition {
                stage: StageKind::Liveness,
                ..
            })
        ));
        assert_eq!(
            stored(&harness, &applicant_id).stage(StageKind::Liveness).status,
            StageStatus::InProgress
        );
    }

    let ended_on_failure = vec![
        reported("look_straight", true, true),
        reported("turn_left", true, false),
    ];
    let record = harness
        .registry
        .record_stage_completion(
            &applicant_id,
            StageKind::Liveness,
            StageOutcome {
                checks: ended_on_failure,
            },
        )
        .await
        .expect("failed session recorded");
    assert_eq!(record.status, StageStatus::Failed);

    harness
        .registry
        .retry_stage(&applicant_id, StageKind::Liveness)
        .await
        .expect("retry accepted");
    let full = Challenge::ordered()
        .iter()
        .map(|challenge| reported(challenge.key(), true, true))
        .collect();
    let record = harness
        .registry
        .record_stage_completion(&applicant_id, StageKind::Liveness, StageOutcome { checks: full })
        .await
        .expect("full session recorded");
    assert_eq!(record.status, StageStatus::Completed);
    assert_eq!(record.checks.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn resubmission_after_retry_uses_a_fresh_oracle_attempt() {
    let harness = harness(default_oracle().failing("photo_quality"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::Liveness).await;
    let before = harness.oracle.distinct_submissions();

    for _ in 0..2 {
        let record = harness
            .registry
            .submit_stage_payload(
                &applicant_id,
                StageKind::PhotoUpload,
                payload_for(StageKind::PhotoUpload),
            )
            .await
            .expect("outcome recorded");
        assert_eq!(record.status, StageStatus::Failed);
        harness
            .registry
            .retry_stage(&applicant_id, StageKind::PhotoUpload)
            .await
            .expect("retry accepted");
    }

    assert_eq!(harness.oracle.distinct_submissions(), before + 2);
    assert_eq!(
        stored(&harness, &applicant_id)
            .stage(StageKind::PhotoUpload)
            .attempt,
        2
    );
}

#[tokio::test(start_paused = true)]
async fn transient_oracle_outage_is_invisible_to_the_applicant() {
    let harness = harness(default_oracle().with_outages(1));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;

    let record = harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("kyc verified");

    assert_eq!(record.status, StageStatus::Completed);
    assert_eq!(harness.oracle.distinct_submissions(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_check_times_out_after_configured_bound() {
    let harness = harness(default_oracle().hanging("identity_registry"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::PersonalInfo).await;
    let started = tokio::time::Instant::now();

    match harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
    {
        Err(EnrollmentError::CheckTimeout { stage, check }) => {
            assert_eq!(stage, StageKind::Kyc);
            assert_eq!(check, "identity_registry");
        }
        other => panic!("expected check timeout, got {other:?}"),
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");

    let record = stored(&harness, &applicant_id).stage(StageKind::Kyc).clone();
    assert_eq!(record.status, StageStatus::Failed);
    let timed_out: Vec<_> = record
        .checks
        .iter()
        .filter(|check| check.timed_out)
        .map(|check| check.name.as_str())
        .collect();
    assert_eq!(timed_out, vec!["identity_registry"]);

    harness
        .registry
        .retry_stage(&applicant_id, StageKind::Kyc)
        .await
        .expect("timed out stage is retryable");
}

#[tokio::test(start_paused = true)]
async fn passport_mrz_failure_is_advisory() {
    let harness = harness(default_oracle().failing("mrz_readability"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::Kyc).await;

    let record = harness
        .registry
        .submit_stage_payload(
            &applicant_id,
            StageKind::IdVerification,
            StagePayload::IdVerification(id_documents(DocumentType::Passport)),
        )
        .await
        .expect("verified");

    assert_eq!(record.status, StageStatus::Completed);
    let mrz = record
        .checks
        .iter()
        .find(|check| check.name == "mrz_readability")
        .expect("advisory check recorded");
    assert_eq!(mrz.outcome, CheckOutcome::Failed);
    assert!(!mrz.mandatory);
}

#[tokio::test(start_paused = true)]
async fn liveness_window_elapse_fails_stage_with_timeout() {
    let harness = harness(SimulatedOracle::new(Duration::from_secs(2)).hanging("smile"));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::IdVerification).await;
    harness
        .registry
        .submit_stage_payload(
            &applicant_id,
            StageKind::Liveness,
            payload_for(StageKind::Liveness),
        )
        .await
        .expect("consent accepted");

    match harness
        .registry
        .run_liveness_session(&applicant_id, &PassingCapture)
        .await
    {
        Err(EnrollmentError::CheckTimeout { stage, check }) => {
            assert_eq!(stage, StageKind::Liveness);
            assert_eq!(check, "smile");
        }
        other => panic!("expected liveness timeout, got {other:?}"),
    }

    let record = stored(&harness, &applicant_id)
        .stage(StageKind::Liveness)
        .clone();
    assert_eq!(record.status, StageStatus::Failed);
    assert_eq!(record.checks.len(), 4);

    harness
        .registry
        .retry_stage(&applicant_id, StageKind::Liveness)
        .await
        .expect("liveness retryable");
}

#[tokio::test(start_paused = true)]
async fn aborted_liveness_session_is_discarded() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::IdVerification).await;
    harness
        .registry
        .submit_stage_payload(
            &applicant_id,
            StageKind::Liveness,
            payload_for(StageKind::Liveness),
        )
        .await
        .expect("consent accepted");
    let entries_before = harness.audit.for_applicant(&applicant_id).len();

    let outcome = harness
        .registry
        .run_liveness_session(
            &applicant_id,
            &AbortingCapture {
                at: Challenge::Smile,
            },
        )
        .await;
    assert!(matches!(
        outcome,
        Err(EnrollmentError::Liveness(LivenessError::Aborted(_)))
    ));

    let record = stored(&harness, &applicant_id)
        .stage(StageKind::Liveness)
        .clone();
    assert_eq!(record.status, StageStatus::InProgress);
    assert!(record.checks.is_empty());
    assert_eq!(harness.audit.for_applicant(&applicant_id).len(), entries_before);

    let record = harness
        .registry
        .run_liveness_session(&applicant_id, &PassingCapture)
        .await
        .expect("fresh session passes");
    assert_eq!(record.status, StageStatus::Completed);
    assert_eq!(record.checks.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn editing_earlier_stage_reopens_later_ones() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::IdVerification).await;

    harness
        .registry
        .submit_stage_payload(&applicant_id, StageKind::Kyc, payload_for(StageKind::Kyc))
        .await
        .expect("kyc re-verified");

    let applicant = stored(&harness, &applicant_id);
    assert_eq!(applicant.stage(StageKind::Kyc).status, StageStatus::Completed);
    assert_eq!(
        applicant.stage(StageKind::IdVerification).status,
        StageStatus::InProgress
    );
    assert!(matches!(
        harness
            .registry
            .start_stage(&applicant_id, StageKind::Liveness)
            .await,
        Err(EnrollmentError::StageOrderViolation {
            blocked_by: StageKind::IdVerification,
            ..
        })
    ));

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    assert!(trail.iter().any(|entry| entry.event
        == AuditEvent::StageCompleted {
            stage: StageKind::Kyc,
            submitted_for_review: false,
            reopened: vec![StageKind::IdVerification],
        }));
}

#[tokio::test(start_paused = true)]
async fn retain_policy_leaves_later_stages_completed() {
    let config = crate::config::OnboardingConfig {
        edit_policy: EditPolicy::RetainForwardStages,
        ..config()
    };
    let harness = harness_with(default_oracle(), config, SequenceAllocator::new("SAV", 999));
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::IdVerification).await;

    harness
        .registry
        .submit_stage_payload(
            &applicant_id,
            StageKind::PersonalInfo,
            payload_for(StageKind::PersonalInfo),
        )
        .await
        .expect("edit accepted");

    let applicant = stored(&harness, &applicant_id);
    assert_eq!(
        applicant.stage(StageKind::IdVerification).status,
        StageStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn start_stage_is_idempotent_and_audited_once() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");

    for _ in 0..2 {
        let record = harness
            .registry
            .start_stage(&applicant_id, StageKind::PersonalInfo)
            .await
            .expect("started");
        assert_eq!(record.status, StageStatus::InProgress);
    }

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    assert_eq!(trail.len(), 2);
    assert_eq!(
        trail[1].event,
        AuditEvent::StageStarted {
            stage: StageKind::PersonalInfo
        }
    );
    assert_eq!(
        harness
            .registry
            .get_applicant(&applicant_id)
            .expect("view")
            .overall_status,
        "in_progress"
    );
}

#[tokio::test(start_paused = true)]
async fn completing_every_stage_queues_applicant_for_review() {
    let harness = harness(default_oracle());
    let applicant_id = pending_review_applicant(&harness).await;

    let view = harness.registry.get_applicant(&applicant_id).expect("view");
    assert_eq!(view.overall_status, "pending_review");
    assert_eq!(view.submitted_for_review_at, Some(now()));

    let queue = harness
        .registry
        .list_pending_review(&ReviewQueueFilter::default())
        .expect("queue");
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].applicant_id, applicant_id);

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    assert!(trail.iter().any(|entry| entry.event
        == AuditEvent::StageCompleted {
            stage: StageKind::PhotoUpload,
            submitted_for_review: true,
            reopened: Vec::new(),
        }));
}

#[tokio::test(start_paused = true)]
async fn review_queue_is_oldest_first_and_filterable() {
    let harness = harness(default_oracle());
    let first = pending_review_applicant(&harness).await;
    harness.clock.advance(chrono::Duration::hours(2));
    let second = pending_review_applicant(&harness).await;
    let in_progress = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &in_progress, StageKind::Kyc).await;

    let queue = harness
        .registry
        .list_pending_review(&ReviewQueueFilter::default())
        .expect("queue");
    let ids: Vec<_> = queue.iter().map(|view| view.applicant_id.clone()).collect();
    assert_eq!(ids, vec![first.clone(), second.clone()]);

    let recent = harness
        .registry
        .list_pending_review(&ReviewQueueFilter {
            submitted_since: Some(now() + chrono::Duration::hours(1)),
            limit: None,
        })
        .expect("queue");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].applicant_id, second);

    let limited = harness
        .registry
        .list_pending_review(&ReviewQueueFilter {
            submitted_since: None,
            limit: Some(1),
        })
        .expect("queue");
    assert_eq!(limited[0].applicant_id, first);
}

#[tokio::test(start_paused = true)]
async fn approval_allocates_identifiers_exactly_once() {
    let harness = harness(default_oracle());
    let applicant_id = pending_review_applicant(&harness).await;

    let decision = harness
        .registry
        .decide(&applicant_id, "reviewer-ada", ReviewVerdict::Approved, None)
        .await
        .expect("approved");

    let identifiers = decision.identifiers.clone().expect("identifiers allocated");
    assert_eq!(identifiers.member_id, MemberId(1));
    assert_eq!(identifiers.account_number, AccountNumber("SAV2026001".to_string()));
    assert_eq!(decision.reviewer_id, "reviewer-ada");

    let applicant = stored(&harness, &applicant_id);
    assert_eq!(applicant.overall_status, OverallStatus::Approved);
    assert_eq!(applicant.decision.as_ref(), Some(&decision));

    match harness
        .registry
        .decide(&applicant_id, "reviewer-bo", ReviewVerdict::Rejected, Some("dup".into()))
        .await
    {
        Err(EnrollmentError::AlreadyDecided(id)) => assert_eq!(id, applicant_id),
        other => panic!("expected already decided, got {other:?}"),
    }
    assert_eq!(harness.allocator.snapshot().0, 1);

    let trail = harness.registry.audit_trail(&applicant_id).expect("trail");
    let last = trail.last().expect("entries");
    assert_eq!(last.actor, AuditActor::Reviewer("reviewer-ada".to_string()));
    assert_eq!(
        last.event,
        AuditEvent::Approved {
            member_id: MemberId(1),
            account_number: AccountNumber("SAV2026001".to_string()),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn rejection_requires_a_reason_code() {
    let harness = harness(default_oracle());
    let applicant_id = pending_review_applicant(&harness).await;

    for reason in [None, Some("   ".to_string())] {
        assert!(matches!(
            harness
                .registry
                .decide(&applicant_id, "reviewer-ada", ReviewVerdict::Rejected, reason)
                .await,
            Err(EnrollmentError::MissingReason)
        ));
    }
    assert_eq!(
        stored(&harness, &applicant_id).overall_status,
        OverallStatus::PendingReview
    );

    let decision = harness
        .registry
        .decide(
            &applicant_id,
            "reviewer-ada",
            ReviewVerdict::Rejected,
            Some("document_mismatch".to_string()),
        )
        .await
        .expect("rejected");
    assert_eq!(decision.reason_code.as_deref(), Some("document_mismatch"));
    assert!(decision.identifiers.is_none());
    assert_eq!(harness.allocator.snapshot().0, 0);

    assert!(matches!(
        harness
            .registry
            .retry_stage(&applicant_id, StageKind::PhotoUpload)
            .await,
        Err(EnrollmentError::AlreadyDecided(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn decision_requires_a_reviewer_id() {
    let harness = harness(default_oracle());
    let applicant_id = pending_review_applicant(&harness).await;
    let audit_before = harness.audit.for_applicant(&applicant_id).len();

    for reviewer in ["", "   "] {
        assert!(matches!(
            harness
                .registry
                .decide(&applicant_id, reviewer, ReviewVerdict::Approved, None)
                .await,
            Err(EnrollmentError::MissingReviewer)
        ));
    }

    let applicant = stored(&harness, &applicant_id);
    assert_eq!(applicant.overall_status, OverallStatus::PendingReview);
    assert!(applicant.decision.is_none());
    assert_eq!(harness.allocator.snapshot().0, 0);
    assert_eq!(harness.audit.for_applicant(&applicant_id).len(), audit_before);

    let decision = harness
        .registry
        .decide(&applicant_id, "  reviewer-ada ", ReviewVerdict::Approved, None)
        .await
        .expect("approved");
    assert_eq!(decision.reviewer_id, "reviewer-ada");
}

#[tokio::test(start_paused = true)]
async fn applicant_locks_are_dropped_once_no_longer_needed() {
    let harness = harness(default_oracle());
    let applicant_id = pending_review_applicant(&harness).await;
    assert_eq!(harness.registry.tracked_locks(), 1);

    harness
        .registry
        .decide(&applicant_id, "reviewer-ada", ReviewVerdict::Approved, None)
        .await
        .expect("approved");
    assert_eq!(harness.registry.tracked_locks(), 0);

    assert!(matches!(
        harness
            .registry
            .submit_stage_payload(
                &applicant_id,
                StageKind::PhotoUpload,
                payload_for(StageKind::PhotoUpload),
            )
            .await,
        Err(EnrollmentError::AlreadyDecided(_))
    ));
    let missing = crate::workflows::onboarding::ApplicantId("apl-999999".to_string());
    assert!(matches!(
        harness
            .registry
            .start_stage(&missing, StageKind::PersonalInfo)
            .await,
        Err(EnrollmentError::NotFound(_))
    ));
    assert_eq!(harness.registry.tracked_locks(), 0);
}

#[tokio::test(start_paused = true)]
async fn decision_before_review_is_refused() {
    let harness = harness(default_oracle());
    let applicant_id = harness.registry.create_applicant().expect("creates");
    complete_through(&harness, &applicant_id, StageKind::Kyc).await;

    assert!(matches!(
        harness
            .registry
            .decide(&applicant_id, "reviewer-ada", ReviewVerdict::Approved, None)
            .await,
        Err(EnrollmentError::NotReviewable {
            status: OverallStatus::InProgress,
            ..
        })
    ));
    assert_eq!(harness.allocator.snapshot().0, 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_account_sequence_leaves_applicant_pending() {
    let harness = harness_with(default_oracle(), config(), SequenceAllocator::new("SAV", 1));
    let first = pending_review_applicant(&harness).await;
    let second = pending_review_applicant(&harness).await;

    harness
        .registry
        .decide(&first, "reviewer-ada", ReviewVerdict::Approved, None)
        .await
        .expect("first approval fits");

    assert!(matches!(
        harness
            .registry
            .decide(&second, "reviewer-ada", ReviewVerdict::Approved, None)
            .await,
        Err(EnrollmentError::AllocatorExhausted { limit: 1, .. })
    ));
    let applicant = stored(&harness, &second);
    assert_eq!(applicant.overall_status, OverallStatus::PendingReview);
    assert!(applicant.decision.is_none());
}

#[test]
fn repository_outage_is_surfaced() {
    let registry = EnrollmentRegistry::new(
        Arc::new(UnavailableRepository),
        Arc::new(default_oracle()),
        Arc::new(SequenceAllocator::new("SAV", 999)),
        Arc::new(InMemoryAuditTrail::default()),
        &config(),
    );

    assert!(matches!(
        registry.create_applicant(),
        Err(EnrollmentError::Repository(RepositoryError::Unavailable(_)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_decisions_on_one_applicant_yield_a_single_decision() {
    let harness = harness_with(
        SimulatedOracle::new(Duration::ZERO),
        fast_config(),
        SequenceAllocator::new("SAV", 999),
    );
    let applicant_id = pending_review_applicant(&harness).await;

    let tasks: Vec<_> = (0..8)
        .map(|reviewer| {
            let registry = harness.registry.clone();
            let applicant_id = applicant_id.clone();
            tokio::spawn(async move {
                registry
                    .decide(
                        &applicant_id,
                        &format!("reviewer-{reviewer}"),
                        ReviewVerdict::Approved,
                        None,
                    )
                    .await
            })
        })
        .collect();

    let mut approvals = 0;
    for task in tasks {
        match task.await.expect("task completes") {
            Ok(_) => approvals += 1,
            Err(EnrollmentError::AlreadyDecided(_)) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    assert_eq!(approvals, 1);
    assert_eq!(harness.allocator.snapshot().0, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_approvals_receive_distinct_identifiers() {
    let harness = harness_with(
        SimulatedOracle::new(Duration::ZERO),
        fast_config(),
        SequenceAllocator::new("SAV", 999),
    );
    let mut applicants = Vec::new();
    for _ in 0..6 {
        applicants.push(pending_review_applicant(&harness).await);
    }

    let tasks: Vec<_> = applicants
        .iter()
        .cloned()
        .map(|applicant_id| {
            let registry = harness.registry.clone();
            tokio::spawn(async move {
                registry
                    .decide(&applicant_id, "reviewer-ada", ReviewVerdict::Approved, None)
                    .await
            })
        })
        .collect();

    let mut members = HashSet::new();
    let mut accounts = HashSet::new();
    for task in tasks {
        let decision = task.await.expect("task completes").expect("approved");
        let identifiers = decision.identifiers.expect("identifiers");
        members.insert(identifiers.member_id);
        accounts.insert(identifiers.account_number);
    }

    assert_eq!(members.len(), 6);
    assert_eq!(accounts.len(), 6);
    assert!(accounts
        .iter()
        .all(|account| account.0.starts_with("SAV2026")));
}
