//! Per-stage state machine.
//!
//! `NotStarted -> InProgress -> Completed`, with `InProgress -> Failed -> InProgress` on a
//! failed check followed by a retry. A stage may only start once its predecessor is
//! `Completed`, and it only completes when its payload validated and every mandatory check
//! passed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Applicant, CheckOutcome, CheckResult, DocumentType, OverallStatus, StageKind, StagePayload,
    StageStatus,
};
use super::liveness::Challenge;
use super::validation::{self, FieldError};

/// What happens to later `Completed` stages when an earlier completed stage is edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditPolicy {
    /// Reopen every later completed stage so it must be verified again.
    CascadeInvalidate,
    /// Leave later stages untouched; only the edited stage is reopened.
    RetainForwardStages,
}

impl EditPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cascade" | "cascade_invalidate" => Some(Self::CascadeInvalidate),
            "retain" | "retain_forward_stages" => Some(Self::RetainForwardStages),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::CascadeInvalidate => "cascade",
            Self::RetainForwardStages => "retain",
        }
    }
}

/// A verification sub-check a stage requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CheckSpec {
    pub name: &'static str,
    pub mandatory: bool,
}

impl CheckSpec {
    const fn mandatory(name: &'static str) -> Self {
        Self {
            name,
            mandatory: true,
        }
    }

    const fn advisory(name: &'static str) -> Self {
        Self {
            name,
            mandatory: false,
        }
    }
}

/// How a stage is verified once its payload validates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationPlan {
    /// Validation alone completes the stage.
    ValidationOnly,
    /// Oracle checks submitted with the payload.
    Oracle(Vec<CheckSpec>),
    /// A liveness challenge session supplies the checks.
    Challenges,
}

pub fn verification_plan(stage: StageKind, payload: Option<&StagePayload>) -> VerificationPlan {
    match stage {
        StageKind::PersonalInfo => VerificationPlan::ValidationOnly,
        StageKind::Kyc => VerificationPlan::Oracle(vec![
            CheckSpec::mandatory("identity_registry"),
            CheckSpec::mandatory("sanctions_screening"),
        ]),
        StageKind::IdVerification => {
            let mut checks = vec![
                CheckSpec::mandatory("document_authenticity"),
                CheckSpec::mandatory("face_match"),
            ];
            if let Some(StagePayload::IdVerification(documents)) = payload {
                if documents.document_type == Some(DocumentType::Passport) {
                    checks.push(CheckSpec::advisory("mrz_readability"));
                }
            }
            VerificationPlan::Oracle(checks)
        }
        StageKind::Liveness => VerificationPlan::Challenges,
        StageKind::PhotoUpload => {
            VerificationPlan::Oracle(vec![CheckSpec::mandatory("photo_quality")])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("stage {stage} cannot advance before {blocked_by} is completed")]
    OrderViolation {
        stage: StageKind,
        blocked_by: StageKind,
    },
    #[error("a {received} payload cannot be submitted to the {expected} stage")]
    PayloadMismatch {
        expected: StageKind,
        received: StageKind,
    },
    #[error("{stage} payload failed validation ({} field error(s))", .errors.len())]
    Validation {
        stage: StageKind,
        errors: Vec<FieldError>,
    },
    #[error("stage {stage} is {}; cannot {action}", .status.label())]
    InvalidTransition {
        stage: StageKind,
        status: StageStatus,
        action: &'static str,
    },
}

/// Observable effect of an engine operation, used for audit entries and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum StageTransition {
    Started,
    Unchanged,
    AwaitingVerification,
    Completed { submitted_for_review: bool },
    Failed,
    Retried,
}

/// Result of accepting a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub transition: StageTransition,
    pub attempt: u32,
    pub plan: VerificationPlan,
    /// Stages reopened by a cascade after editing a completed stage.
    pub reopened: Vec<StageKind>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEngine {
    edit_policy: EditPolicy,
    challenges: Vec<Challenge>,
}

impl Default for StageEngine {
    fn default() -> Self {
        Self::new(EditPolicy::CascadeInvalidate)
    }
}

impl StageEngine {
    pub fn new(edit_policy: EditPolicy) -> Self {
        Self {
            edit_policy,
            challenges: Challenge::ordered().to_vec(),
        }
    }

    /// Challenges a liveness session must confirm, in order, for the stage to complete.
    pub fn with_challenges(mut self, challenges: Vec<Challenge>) -> Self {
        self.challenges = challenges;
        self
    }

    pub fn edit_policy(&self) -> EditPolicy {
        self.edit_policy
    }

    pub fn start(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
    ) -> Result<StageTransition, StageError> {
        ensure_predecessor_completed(applicant, stage)?;

        match applicant.stage(stage).status {
            StageStatus::NotStarted => {
                open_stage(applicant, stage);
                Ok(StageTransition::Started)
            }
            StageStatus::InProgress | StageStatus::Completed => Ok(StageTransition::Unchanged),
            StageStatus::Failed => Err(StageError::InvalidTransition {
                stage,
                status: StageStatus::Failed,
                action: "start without a retry",
            }),
        }
    }

    /// Validate and store a payload. Nothing is mutated when an error is returned.
    pub fn submit(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
        payload: StagePayload,
        now: DateTime<Utc>,
    ) -> Result<Submission, StageError> {
        if payload.kind() != stage {
            return Err(StageError::PayloadMismatch {
                expected: stage,
                received: payload.kind(),
            });
        }
        ensure_predecessor_completed(applicant, stage)?;

        let status = applicant.stage(stage).status;
        if status == StageStatus::Failed {
            return Err(StageError::InvalidTransition {
                stage,
                status,
                action: "accept a payload before a retry",
            });
        }

        let errors = validation::validate(&payload, now.date_naive());
        if !errors.is_empty() {
            return Err(StageError::Validation { stage, errors });
        }

        let mut reopened = Vec::new();
        match status {
            StageStatus::NotStarted => open_stage(applicant, stage),
            StageStatus::Completed => reopened = self.reopen_for_edit(applicant, stage),
            StageStatus::InProgress | StageStatus::Failed => {}
        }

        let plan = verification_plan(stage, Some(&payload));
        let record = applicant.stage_mut(stage);
        record.payload = Some(payload);
        record.attempt += 1;
        record.completed_at = None;
        record.status = StageStatus::InProgress;
        record.checks = match &plan {
            VerificationPlan::Oracle(specs) => specs
                .iter()
                .map(|spec| CheckResult::pending(spec.name, spec.mandatory, now))
                .collect(),
            VerificationPlan::ValidationOnly | VerificationPlan::Challenges => Vec::new(),
        };
        let attempt = record.attempt;

        let transition = match plan {
            VerificationPlan::ValidationOnly => complete_stage(applicant, stage, now),
            VerificationPlan::Oracle(_) | VerificationPlan::Challenges => {
                refresh_overall(applicant, now);
                StageTransition::AwaitingVerification
            }
        };

        Ok(Submission {
            transition,
            attempt,
            plan,
            reopened,
        })
    }

    /// Prepare the liveness stage for a new challenge session, returning its attempt number.
    pub fn begin_challenge_session(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
    ) -> Result<u32, StageError> {
        ensure_predecessor_completed(applicant, stage)?;
        let record = applicant.stage(stage);
        if record.status != StageStatus::InProgress || record.payload.is_none() {
            return Err(StageError::InvalidTransition {
                stage,
                status: record.status,
                action: "begin a challenge session without an accepted payload",
            });
        }
        if verification_plan(stage, record.payload.as_ref()) != VerificationPlan::Challenges {
            return Err(StageError::InvalidTransition {
                stage,
                status: record.status,
                action: "run a challenge session",
            });
        }

        let record = applicant.stage_mut(stage);
        record.attempt += 1;
        record.checks.clear();
        Ok(record.attempt)
    }

    /// Apply resolved checks. Any failed mandatory check fails the stage; the stage
    /// completes once every required check has passed.
    ///
    /// Check names and their mandatory flag come from the stage's verification plan; a
    /// reported check the plan does not name is refused. Challenge results must follow the
    /// configured order and either cover every challenge or end at the failing one.
    pub fn apply_checks(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
        checks: Vec<CheckResult>,
        now: DateTime<Utc>,
    ) -> Result<StageTransition, StageError> {
        ensure_predecessor_completed(applicant, stage)?;

        let record = applicant.stage(stage);
        if record.status != StageStatus::InProgress {
            return Err(StageError::InvalidTransition {
                stage,
                status: record.status,
                action: "record a verification outcome",
            });
        }
        if record.payload.is_none() {
            return Err(StageError::InvalidTransition {
                stage,
                status: record.status,
                action: "record a verification outcome before a payload is accepted",
            });
        }

        let status = record.status;
        let plan = verification_plan(stage, record.payload.as_ref());
        let expected = self.expected_checks(&plan);
        let checks = conform_to_plan(stage, status, &expected, checks)?;

        if plan == VerificationPlan::Challenges {
            let in_order = checks
                .iter()
                .zip(&expected)
                .all(|(check, spec)| check.name == spec.name);
            let failure_before_end = checks
                .iter()
                .rev()
                .skip(1)
                .any(CheckResult::is_blocking_failure);
            let ended_early = checks.len() < expected.len()
                && !checks.last().is_some_and(CheckResult::is_blocking_failure);
            if !in_order || failure_before_end || ended_early {
                return Err(StageError::InvalidTransition {
                    stage,
                    status,
                    action: "record a partial or out-of-order challenge session",
                });
            }
        }

        let required_present = expected
            .iter()
            .filter(|spec| spec.mandatory)
            .all(|spec| checks.iter().any(|check| check.name == spec.name));

        let record = applicant.stage_mut(stage);
        record.checks = checks;

        if record.checks.iter().any(CheckResult::is_blocking_failure) {
            record.status = StageStatus::Failed;
            record.completed_at = None;
            return Ok(StageTransition::Failed);
        }

        let all_resolved = record
            .checks
            .iter()
            .filter(|check| check.mandatory)
            .all(|check| check.outcome != CheckOutcome::Pending);
        if required_present && all_resolved && record.mandatory_checks_passed() {
            Ok(complete_stage(applicant, stage, now))
        } else {
            Ok(StageTransition::AwaitingVerification)
        }
    }

    pub fn retry(
        &self,
        applicant: &mut Applicant,
        stage: StageKind,
    ) -> Result<StageTransition, StageError> {
        let record = applicant.stage_mut(stage);
        if record.status != StageStatus::Failed {
            return Err(StageError::InvalidTransition {
                stage,
                status: record.status,
                action: "retry",
            });
        }

        record.status = StageStatus::InProgress;
        record.checks.clear();
        record.completed_at = None;
        Ok(StageTransition::Retried)
    }

    fn expected_checks(&self, plan: &VerificationPlan) -> Vec<CheckSpec> {
        match plan {
            VerificationPlan::Oracle(specs) => specs.clone(),
            VerificationPlan::Challenges => self
                .challenges
                .iter()
                .map(|challenge| CheckSpec::mandatory(challenge.key()))
                .collect(),
            VerificationPlan::ValidationOnly => Vec::new(),
        }
    }

    fn reopen_for_edit(&self, applicant: &mut Applicant, stage: StageKind) -> Vec<StageKind> {
        let mut reopened = Vec::new();
        if self.edit_policy == EditPolicy::CascadeInvalidate {
            for record in applicant.stages.iter_mut().skip(stage.index() + 1) {
                if record.status == StageStatus::Completed {
                    record.status = StageStatus::InProgress;
                    record.checks.clear();
                    record.completed_at = None;
                    reopened.push(record.stage);
                }
            }
        }
        reopened
    }
}

/// Reject unknown or repeated check names and restore each check's mandatory flag from the
/// catalogue, whatever the reporter claimed.
fn conform_to_plan(
    stage: StageKind,
    status: StageStatus,
    expected: &[CheckSpec],
    mut checks: Vec<CheckResult>,
) -> Result<Vec<CheckResult>, StageError> {
    let mut seen = HashSet::new();
    for check in &mut checks {
        if !seen.insert(check.name.clone()) {
            return Err(StageError::InvalidTransition {
                stage,
                status,
                action: "record the same check twice",
            });
        }
        let Some(spec) = expected.iter().find(|spec| spec.name == check.name) else {
            return Err(StageError::InvalidTransition {
                stage,
                status,
                action: "record a check outside its verification plan",
            });
        };
        check.mandatory = spec.mandatory;
    }
    Ok(checks)
}

fn ensure_predecessor_completed(applicant: &Applicant, stage: StageKind) -> Result<(), StageError> {
    match stage.previous() {
        Some(previous) if applicant.stage(previous).status != StageStatus::Completed => {
            Err(StageError::OrderViolation {
                stage,
                blocked_by: previous,
            })
        }
        _ => Ok(()),
    }
}

fn open_stage(applicant: &mut Applicant, stage: StageKind) {
    applicant.stage_mut(stage).status = StageStatus::InProgress;
    applicant.current_stage_index = applicant.current_stage_index.max(stage.index());
    if applicant.overall_status == OverallStatus::Draft {
        applicant.overall_status = OverallStatus::InProgress;
    }
}

fn complete_stage(applicant: &mut Applicant, stage: StageKind, now: DateTime<Utc>) -> StageTransition {
    let record = applicant.stage_mut(stage);
    record.status = StageStatus::Completed;
    record.completed_at = Some(now);

    let last = StageKind::ordered().len() - 1;
    applicant.current_stage_index = applicant
        .current_stage_index
        .max((stage.index() + 1).min(last));

    let submitted_for_review = refresh_overall(applicant, now);
    StageTransition::Completed {
        submitted_for_review,
    }
}

/// Keep `overall_status` consistent with stage states; returns true when the applicant
/// just entered the review queue.
fn refresh_overall(applicant: &mut Applicant, now: DateTime<Utc>) -> bool {
    if applicant.all_stages_completed() {
        if applicant.overall_status != OverallStatus::PendingReview {
            applicant.overall_status = OverallStatus::PendingReview;
            applicant.submitted_for_review_at = Some(now);
            return true;
        }
        return false;
    }

    if applicant.overall_status == OverallStatus::PendingReview
        || applicant.overall_status == OverallStatus::Draft
    {
        applicant.overall_status = OverallStatus::InProgress;
        applicant.submitted_for_review_at = None;
    }
    false
}
