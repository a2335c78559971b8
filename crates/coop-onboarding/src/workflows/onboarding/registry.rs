use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Datelike;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::allocator::{AllocationError, IdentifierAllocator};
use super::audit::{AuditActor, AuditEntry, AuditEvent, AuditTrail};
use super::clock::{Clock, SystemClock};
use super::domain::{
    AccountIdentifiers, Applicant, ApplicantId, ApplicantView, CheckResult, EnrollmentDecision,
    OverallStatus, ReviewVerdict, StageKind, StagePayload, StageRecord, StageStatus,
};
use super::engine::{CheckSpec, StageEngine, StageError, StageTransition, VerificationPlan};
use super::liveness::{ChallengeSequencer, LivenessCapture, LivenessError};
use super::oracle::{CheckKey, CheckRequest, VerificationOracle};
use super::repository::{ApplicantRepository, RepositoryError, ReviewQueueFilter};
use super::validation::FieldError;
use super::verification::CheckRunner;
use crate::config::OnboardingConfig;

/// Resolved checks reported for a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub checks: Vec<CheckResult>,
}

type ApplicantLock = Arc<tokio::sync::Mutex<()>>;

/// Aggregate root owning every applicant record and the review gate.
///
/// Mutations of one applicant are serialized through a per-applicant lock held for the whole
/// operation, including oracle waits; different applicants never contend.
pub struct EnrollmentRegistry<R, O> {
    repository: Arc<R>,
    oracle: Arc<O>,
    allocator: Arc<dyn IdentifierAllocator>,
    audit: Arc<dyn AuditTrail>,
    clock: Arc<dyn Clock>,
    engine: StageEngine,
    runner: CheckRunner,
    sequencer: ChallengeSequencer,
    applicant_sequence: AtomicU64,
    locks: Mutex<HashMap<ApplicantId, ApplicantLock>>,
}

impl<R, O> EnrollmentRegistry<R, O>
where
    R: ApplicantRepository + 'static,
    O: VerificationOracle + 'static,
{
    pub fn new(
        repository: Arc<R>,
        oracle: Arc<O>,
        allocator: Arc<dyn IdentifierAllocator>,
        audit: Arc<dyn AuditTrail>,
        config: &OnboardingConfig,
    ) -> Self {
        let sequencer = config.challenge_sequencer();
        Self {
            repository,
            oracle,
            allocator,
            audit,
            clock: Arc::new(SystemClock),
            engine: StageEngine::new(config.edit_policy)
                .with_challenges(sequencer.challenges().to_vec()),
            runner: config.check_runner(),
            sequencer,
            applicant_sequence: AtomicU64::new(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sequencer(mut self, sequencer: ChallengeSequencer) -> Self {
        self.engine = self
            .engine
            .clone()
            .with_challenges(sequencer.challenges().to_vec());
        self.sequencer = sequencer;
        self
    }

    /// Start a new onboarding in `Draft`.
    pub fn create_applicant(&self) -> Result<ApplicantId, EnrollmentError> {
        let sequence = self.applicant_sequence.fetch_add(1, Ordering::Relaxed);
        let applicant_id = ApplicantId(format!("apl-{sequence:06}"));
        let now = self.clock.now();

        let applicant = self
            .repository
            .insert(Applicant::new(applicant_id.clone(), now))?;
        self.audit.append(
            &applicant.applicant_id,
            AuditActor::Applicant,
            AuditEvent::ApplicantCreated,
            now,
        );

        info!(applicant_id = %applicant_id, "onboarding started");
        Ok(applicant_id)
    }

    pub fn get_applicant(&self, applicant_id: &ApplicantId) -> Result<ApplicantView, EnrollmentError> {
        Ok(self.load(applicant_id)?.view())
    }

    pub fn list_pending_review(
        &self,
        filter: &ReviewQueueFilter,
    ) -> Result<Vec<ApplicantView>, EnrollmentError> {
        Ok(self
            .repository
            .pending_review(filter)?
            .iter()
            .map(Applicant::view)
            .collect())
    }

    pub fn audit_trail(&self, applicant_id: &ApplicantId) -> Result<Vec<AuditEntry>, EnrollmentError> {
        self.load(applicant_id)?;
        Ok(self.audit.for_applicant(applicant_id))
    }

    /// Explicitly open a stage; opening an already open stage is a no-op.
    pub async fn start_stage(
        &self,
        applicant_id: &ApplicantId,
        stage: StageKind,
    ) -> Result<StageRecord, EnrollmentError> {
        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        if self.engine.start(&mut applicant, stage)? == StageTransition::Started {
            self.repository.update(applicant.clone())?;
            self.record(
                &applicant.applicant_id,
                AuditActor::Applicant,
                AuditEvent::StageStarted { stage },
            );
        }

        Ok(applicant.stage(stage).clone())
    }

    /// Validate a payload, run the stage's oracle checks, and persist the outcome.
    ///
    /// Returns `CheckTimeout` after persisting a `Failed` stage when a mandatory check did
    /// not resolve in time.
    pub async fn submit_stage_payload(
        &self,
        applicant_id: &ApplicantId,
        stage: StageKind,
        payload: StagePayload,
    ) -> Result<StageRecord, EnrollmentError> {
        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        let submission = self
            .engine
            .submit(&mut applicant, stage, payload, self.clock.now())?;
        self.repository.update(applicant.clone())?;

        let specs = match submission.plan {
            VerificationPlan::Oracle(specs) => specs,
            VerificationPlan::ValidationOnly | VerificationPlan::Challenges => {
                let event = match submission.transition {
                    StageTransition::Completed {
                        submitted_for_review,
                    } => AuditEvent::StageCompleted {
                        stage,
                        submitted_for_review,
                        reopened: submission.reopened,
                    },
                    _ => AuditEvent::StageAwaitingVerification {
                        stage,
                        attempt: submission.attempt,
                        reopened: submission.reopened,
                    },
                };
                self.record(&applicant.applicant_id, AuditActor::Applicant, event);
                return Ok(applicant.stage(stage).clone());
            }
        };

        let checks = self
            .run_checks(&applicant, stage, submission.attempt, &specs)
            .await;
        self.apply_outcome(&mut applicant, stage, checks, submission.reopened)
    }

    /// Record externally resolved checks for a stage (the lower-level completion path).
    pub async fn record_stage_completion(
        &self,
        applicant_id: &ApplicantId,
        stage: StageKind,
        outcome: StageOutcome,
    ) -> Result<StageRecord, EnrollmentError> {
        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        self.apply_outcome(&mut applicant, stage, outcome.checks, Vec::new())
    }

    /// Reset a failed stage to `InProgress` with its checks cleared.
    pub async fn retry_stage(
        &self,
        applicant_id: &ApplicantId,
        stage: StageKind,
    ) -> Result<StageRecord, EnrollmentError> {
        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        self.engine.retry(&mut applicant, stage)?;
        self.repository.update(applicant.clone())?;
        self.record(
            &applicant.applicant_id,
            AuditActor::Applicant,
            AuditEvent::StageRetried { stage },
        );

        Ok(applicant.stage(stage).clone())
    }

    /// Run one full liveness challenge session for the applicant.
    ///
    /// An aborted session is discarded: the stage keeps its status and a fresh session may be
    /// started immediately.
    pub async fn run_liveness_session<C>(
        &self,
        applicant_id: &ApplicantId,
        capture: &C,
    ) -> Result<StageRecord, EnrollmentError>
    where
        C: LivenessCapture + ?Sized,
    {
        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        let attempt = self
            .engine
            .begin_challenge_session(&mut applicant, StageKind::Liveness)?;
        self.repository.update(applicant.clone())?;

        let session = self.sequencer.start(applicant_id, attempt);
        let session = self
            .sequencer
            .run(session, self.oracle.as_ref(), capture, self.clock.as_ref())
            .await?;

        self.apply_outcome(
            &mut applicant,
            StageKind::Liveness,
            session.into_results(),
            Vec::new(),
        )
    }

    /// Approve or reject an applicant awaiting review. Approval allocates identifiers exactly
    /// once and persists them together with the decision.
    pub async fn decide(
        &self,
        applicant_id: &ApplicantId,
        reviewer_id: &str,
        verdict: ReviewVerdict,
        reason_code: Option<String>,
    ) -> Result<EnrollmentDecision, EnrollmentError> {
        let reviewer_id = reviewer_id.trim();
        if reviewer_id.is_empty() {
            return Err(EnrollmentError::MissingReviewer);
        }

        let lock = self.applicant_lock(applicant_id);
        let _guard = lock.lock().await;

        let mut applicant = self.load_undecided(applicant_id, &lock)?;
        if applicant.overall_status != OverallStatus::PendingReview {
            return Err(EnrollmentError::NotReviewable {
                applicant_id: applicant_id.clone(),
                status: applicant.overall_status,
            });
        }

        let reason_code = reason_code
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());
        let now = self.clock.now();

        let (identifiers, status, event) = match verdict {
            ReviewVerdict::Rejected => {
                let reason = reason_code.clone().ok_or(EnrollmentError::MissingReason)?;
                (
                    None,
                    OverallStatus::Rejected,
                    AuditEvent::Rejected {
                        reason_code: reason,
                    },
                )
            }
            ReviewVerdict::Approved => {
                let identifiers = self.allocate_identifiers(applicant_id, now.year())?;
                let event = AuditEvent::Approved {
                    member_id: identifiers.member_id,
                    account_number: identifiers.account_number.clone(),
                };
                (Some(identifiers), OverallStatus::Approved, event)
            }
        };

        let decision = EnrollmentDecision {
            verdict,
            reviewer_id: reviewer_id.to_string(),
            reason_code,
            decided_at: now,
            identifiers,
        };
        applicant.decision = Some(decision.clone());
        applicant.overall_status = status;

        if let Err(source) = self.repository.update(applicant) {
            error!(applicant_id = %applicant_id, %source, "failed to persist enrollment decision");
            return Err(source.into());
        }

        self.record(
            applicant_id,
            AuditActor::Reviewer(reviewer_id.to_string()),
            event,
        );
        // Decided applicants are immutable, so their lock is no longer needed.
        self.release_lock(applicant_id, &lock);
        info!(
            applicant_id = %applicant_id,
            reviewer_id,
            decision = %decision.summary(),
            "enrollment decided"
        );
        Ok(decision)
    }

    fn allocate_identifiers(
        &self,
        applicant_id: &ApplicantId,
        year: i32,
    ) -> Result<AccountIdentifiers, EnrollmentError> {
        let member_id = self.allocator.allocate_member_id().map_err(|source| {
            error!(applicant_id = %applicant_id, %source, "member id allocation failed");
            EnrollmentError::from(source)
        })?;
        let account_number = self
            .allocator
            .allocate_account_number(year)
            .map_err(|source| {
                error!(applicant_id = %applicant_id, %source, "account number allocation failed");
                EnrollmentError::from(source)
            })?;

        Ok(AccountIdentifiers {
            member_id,
            account_number,
        })
    }

    async fn run_checks(
        &self,
        applicant: &Applicant,
        stage: StageKind,
        attempt: u32,
        specs: &[CheckSpec],
    ) -> Vec<CheckResult> {
        let payload = applicant
            .stage(stage)
            .payload
            .as_ref()
            .and_then(|payload| serde_json::to_value(payload).ok())
            .unwrap_or(serde_json::Value::Null);

        let mut tasks = JoinSet::new();
        for spec in specs {
            let request = CheckRequest {
                key: CheckKey {
                    applicant_id: applicant.applicant_id.clone(),
                    stage,
                    check_name: spec.name.to_string(),
                    attempt,
                },
                payload: payload.clone(),
            };
            let oracle = self.oracle.clone();
            let clock = self.clock.clone();
            let runner = self.runner;
            let mandatory = spec.mandatory;
            tasks.spawn(async move {
                runner
                    .run(oracle.as_ref(), request, mandatory, clock.as_ref())
                    .await
            });
        }

        let mut results = Vec::with_capacity(specs.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_error) => {
                    error!(applicant_id = %applicant.applicant_id, %join_error, "verification task failed");
                }
            }
        }

        // A check whose task died is treated like one that never resolved.
        let now = self.clock.now();
        specs
            .iter()
            .map(|spec| {
                results
                    .iter()
                    .position(|result| result.name == spec.name)
                    .map(|index| results.swap_remove(index))
                    .unwrap_or_else(|| {
                        let mut missing = CheckResult::pending(spec.name, spec.mandatory, now);
                        missing.time_out(now);
                        missing
                    })
            })
            .collect()
    }

    fn apply_outcome(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
        checks: Vec<CheckResult>,
        reopened: Vec<StageKind>,
    ) -> Result<StageRecord, EnrollmentError> {
        let transition = self
            .engine
            .apply_checks(applicant, stage, checks, self.clock.now())?;
        self.repository.update(applicant.clone())?;

        let record = applicant.stage(stage).clone();
        let event = match transition {
            StageTransition::Completed {
                submitted_for_review,
            } => {
                if submitted_for_review {
                    info!(applicant_id = %applicant.applicant_id, "applicant queued for review");
                }
                AuditEvent::StageCompleted {
                    stage,
                    submitted_for_review,
                    reopened,
                }
            }
            StageTransition::Failed => AuditEvent::StageFailed {
                stage,
                failed_checks: record
                    .checks
                    .iter()
                    .filter(|check| check.is_blocking_failure())
                    .map(|check| check.name.clone())
                    .collect(),
            },
            _ => AuditEvent::StageAwaitingVerification {
                stage,
                attempt: record.attempt,
                reopened,
            },
        };
        self.record(&applicant.applicant_id, AuditActor::System, event);

        if record.status == StageStatus::Failed {
            if let Some(check) = record
                .checks
                .iter()
                .find(|check| check.mandatory && check.timed_out)
            {
                warn!(applicant_id = %applicant.applicant_id, %stage, check = %check.name, "stage failed on timeout");
                return Err(EnrollmentError::CheckTimeout {
                    stage,
                    check: check.name.clone(),
                });
            }
        }

        Ok(record)
    }

    fn record(&self, applicant_id: &ApplicantId, actor: AuditActor, event: AuditEvent) {
        self.audit
            .append(applicant_id, actor, event, self.clock.now());
    }

    fn load(&self, applicant_id: &ApplicantId) -> Result<Applicant, EnrollmentError> {
        self.repository
            .fetch(applicant_id)?
            .ok_or_else(|| EnrollmentError::NotFound(applicant_id.clone()))
    }

    /// Load an applicant that may still change. `lock` is the caller's held handle; it is
    /// released when the applicant turns out to be unknown or already decided.
    fn load_undecided(
        &self,
        applicant_id: &ApplicantId,
        lock: &ApplicantLock,
    ) -> Result<Applicant, EnrollmentError> {
        let applicant = match self.load(applicant_id) {
            Ok(applicant) => applicant,
            Err(error) => {
                if matches!(error, EnrollmentError::NotFound(_)) {
                    self.release_lock(applicant_id, lock);
                }
                return Err(error);
            }
        };
        if applicant.is_decided() {
            self.release_lock(applicant_id, lock);
            return Err(EnrollmentError::AlreadyDecided(applicant_id.clone()));
        }
        Ok(applicant)
    }

    fn applicant_lock(&self, applicant_id: &ApplicantId) -> ApplicantLock {
        self.lock_table()
            .entry(applicant_id.clone())
            .or_default()
            .clone()
    }

    /// Forget the lock of an applicant that is unknown or decided, unless another caller is
    /// still queued on it. Handles are only cloned under the table lock, so the count is exact.
    fn release_lock(&self, applicant_id: &ApplicantId, held: &ApplicantLock) {
        let mut table = self.lock_table();
        let idle = table
            .get(applicant_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, held) && Arc::strong_count(lock) == 2);
        if idle {
            table.remove(applicant_id);
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<ApplicantId, ApplicantLock>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[cfg(test)]
    pub(crate) fn tracked_locks(&self) -> usize {
        self.lock_table().len()
    }
}

/// Error raised by the enrollment registry.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("applicant {0} not found")]
    NotFound(ApplicantId),
    #[error("{stage} payload failed validation ({} field error(s))", .errors.len())]
    Validation {
        stage: StageKind,
        errors: Vec<FieldError>,
    },
    #[error("stage {stage} cannot advance before {blocked_by} is completed")]
    StageOrderViolation {
        stage: StageKind,
        blocked_by: StageKind,
    },
    #[error("a {received} payload cannot be submitted to the {expected} stage")]
    PayloadMismatch {
        expected: StageKind,
        received: StageKind,
    },
    #[error("stage {stage} is {}; cannot {action}", .status.label())]
    InvalidTransition {
        stage: StageKind,
        status: StageStatus,
        action: &'static str,
    },
    #[error("verification check {check} for {stage} timed out; please retry")]
    CheckTimeout { stage: StageKind, check: String },
    #[error("applicant {0} already has an enrollment decision")]
    AlreadyDecided(ApplicantId),
    #[error("applicant {applicant_id} is {} and cannot be reviewed", .status.label())]
    NotReviewable {
        applicant_id: ApplicantId,
        status: OverallStatus,
    },
    #[error("a reason code is required to reject an applicant")]
    MissingReason,
    #[error("a reviewer id is required to decide an applicant")]
    MissingReviewer,
    #[error("identifier space exhausted ({sequence} limit {limit}); operator intervention required")]
    AllocatorExhausted { sequence: String, limit: u64 },
    #[error("identifier allocation failed: {0}")]
    Allocation(AllocationError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<StageError> for EnrollmentError {
    fn from(error: StageError) -> Self {
        match error {
            StageError::OrderViolation { stage, blocked_by } => {
                Self::StageOrderViolation { stage, blocked_by }
            }
            StageError::PayloadMismatch { expected, received } => {
                Self::PayloadMismatch { expected, received }
            }
            StageError::Validation { stage, errors } => Self::Validation { stage, errors },
            StageError::InvalidTransition {
                stage,
                status,
                action,
            } => Self::InvalidTransition {
                stage,
                status,
                action,
            },
        }
    }
}

impl From<AllocationError> for EnrollmentError {
    fn from(error: AllocationError) -> Self {
        match error {
            AllocationError::Exhausted { sequence, limit } => {
                Self::AllocatorExhausted { sequence, limit }
            }
            other => Self::Allocation(other),
        }
    }
}
