use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier assigned when onboarding starts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplicantId(pub String);

impl fmt::Display for ApplicantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pipeline stages in the order an applicant must complete them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    PersonalInfo,
    Kyc,
    IdVerification,
    Liveness,
    PhotoUpload,
}

impl StageKind {
    pub const fn ordered() -> [Self; 5] {
        [
            Self::PersonalInfo,
            Self::Kyc,
            Self::IdVerification,
            Self::Liveness,
            Self::PhotoUpload,
        ]
    }

    pub const fn index(self) -> usize {
        match self {
            Self::PersonalInfo => 0,
            Self::Kyc => 1,
            Self::IdVerification => 2,
            Self::Liveness => 3,
            Self::PhotoUpload => 4,
        }
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::PersonalInfo => "personal_info",
            Self::Kyc => "kyc",
            Self::IdVerification => "id_verification",
            Self::Liveness => "liveness",
            Self::PhotoUpload => "photo_upload",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::PersonalInfo => "Personal Information",
            Self::Kyc => "Know Your Customer",
            Self::IdVerification => "ID Verification",
            Self::Liveness => "Liveness Check",
            Self::PhotoUpload => "Photo Upload",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ordered()
            .into_iter()
            .find(|stage| stage.key().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn previous(self) -> Option<Self> {
        match self.index() {
            0 => None,
            index => Some(Self::ordered()[index - 1]),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub const fn label(self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

/// High level status tracked throughout the onboarding workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Draft,
    InProgress,
    PendingReview,
    Approved,
    Rejected,
}

impl OverallStatus {
    pub const fn label(self) -> &'static str {
        match self {
            OverallStatus::Draft => "draft",
            OverallStatus::InProgress => "in_progress",
            OverallStatus::PendingReview => "pending_review",
            OverallStatus::Approved => "approved",
            OverallStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pending,
    Passed,
    Failed,
}

/// One verification sub-check owned by a stage record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub outcome: CheckOutcome,
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timed_out: bool,
}

impl CheckResult {
    pub fn pending(name: impl Into<String>, mandatory: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            outcome: CheckOutcome::Pending,
            mandatory,
            confidence: None,
            started_at,
            resolved_at: None,
            timed_out: false,
        }
    }

    pub fn resolve(&mut self, passed: bool, confidence: Option<f32>, at: DateTime<Utc>) {
        self.outcome = if passed {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed
        };
        self.confidence = confidence;
        self.resolved_at = Some(at);
    }

    pub fn time_out(&mut self, at: DateTime<Utc>) {
        self.outcome = CheckOutcome::Failed;
        self.timed_out = true;
        self.resolved_at = Some(at);
    }

    pub fn is_blocking_failure(&self) -> bool {
        self.mandatory && self.outcome == CheckOutcome::Failed
    }
}

/// One record per pipeline stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageKind,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<StagePayload>,
    pub checks: Vec<CheckResult>,
    /// Incremented for every submission or liveness session; scopes oracle idempotency.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::NotStarted,
            payload: None,
            checks: Vec::new(),
            attempt: 0,
            completed_at: None,
        }
    }

    pub fn mandatory_checks_passed(&self) -> bool {
        self.checks
            .iter()
            .filter(|check| check.mandatory)
            .all(|check| check.outcome == CheckOutcome::Passed)
    }

    /// Status projection without the submitted payload.
    pub fn view(&self) -> StageView {
        StageView {
            stage: self.stage,
            label: self.stage.label(),
            status: self.status.label(),
            attempt: self.attempt,
            checks: self.checks.clone(),
            completed_at: self.completed_at,
        }
    }
}

/// A person's in-progress or completed onboarding record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Applicant {
    pub applicant_id: ApplicantId,
    pub stages: Vec<StageRecord>,
    pub current_stage_index: usize,
    pub overall_status: OverallStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_for_review_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<EnrollmentDecision>,
}

impl Applicant {
    pub fn new(applicant_id: ApplicantId, created_at: DateTime<Utc>) -> Self {
        Self {
            applicant_id,
            stages: StageKind::ordered().into_iter().map(StageRecord::new).collect(),
            current_stage_index: 0,
            overall_status: OverallStatus::Draft,
            created_at,
            submitted_for_review_at: None,
            decision: None,
        }
    }

    pub fn stage(&self, stage: StageKind) -> &StageRecord {
        &self.stages[stage.index()]
    }

    pub(crate) fn stage_mut(&mut self, stage: StageKind) -> &mut StageRecord {
        &mut self.stages[stage.index()]
    }

    pub fn all_stages_completed(&self) -> bool {
        self.stages
            .iter()
            .all(|record| record.status == StageStatus::Completed)
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn view(&self) -> ApplicantView {
        ApplicantView {
            applicant_id: self.applicant_id.clone(),
            overall_status: self.overall_status.label(),
            current_stage: StageKind::ordered()[self.current_stage_index],
            stages: self
                .stages
                .iter()
                .map(StageRecord::view)
                .collect(),
            submitted_for_review_at: self.submitted_for_review_at,
            decision: self.decision.clone(),
        }
    }
}

/// Read-only projection handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicantView {
    pub applicant_id: ApplicantId,
    pub overall_status: &'static str,
    pub current_stage: StageKind,
    pub stages: Vec<StageView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_for_review_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<EnrollmentDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    pub stage: StageKind,
    pub label: &'static str,
    pub status: &'static str,
    pub attempt: u32,
    pub checks: Vec<CheckResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Stage-specific data captured from the applicant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StagePayload {
    PersonalInfo(PersonalInfo),
    Kyc(KycDetails),
    IdVerification(IdDocuments),
    Liveness(LivenessConsent),
    PhotoUpload(PhotoSubmission),
}

impl StagePayload {
    pub fn kind(&self) -> StageKind {
        match self {
            StagePayload::PersonalInfo(_) => StageKind::PersonalInfo,
            StagePayload::Kyc(_) => StageKind::Kyc,
            StagePayload::IdVerification(_) => StageKind::IdVerification,
            StagePayload::Liveness(_) => StageKind::Liveness,
            StagePayload::PhotoUpload(_) => StageKind::PhotoUpload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalInfo {
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub national_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    NationalId,
    Passport,
    DriversLicense,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KycDetails {
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default)]
    pub document_number: String,
    #[serde(default)]
    pub issuing_country: String,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub expiry_date: Option<NaiveDate>,
    #[serde(default)]
    pub occupation: String,
    #[serde(default)]
    pub source_of_funds: String,
    #[serde(default)]
    pub consent_confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdDocuments {
    #[serde(default)]
    pub document_type: Option<DocumentType>,
    #[serde(default)]
    pub front_image: String,
    #[serde(default)]
    pub back_image: Option<String>,
    #[serde(default)]
    pub selfie_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConsent {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub capture_consent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoSubmission {
    #[serde(default)]
    pub photo_ref: String,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// Globally monotonic member number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Savings account number, formatted `{prefix}{year}{sequence:03}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountNumber(pub String);

impl AccountNumber {
    pub fn format(prefix: &str, year: i32, sequence: u32) -> Self {
        Self(format!("{prefix}{year}{sequence:03}"))
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifiers provisioned exactly once, at approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentifiers {
    pub member_id: MemberId,
    pub account_number: AccountNumber,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    Rejected,
}

/// Reviewer outcome for a fully staged applicant. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentDecision {
    pub verdict: ReviewVerdict,
    pub reviewer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<AccountIdentifiers>,
}

impl EnrollmentDecision {
    pub fn summary(&self) -> String {
        match (&self.verdict, &self.identifiers) {
            (ReviewVerdict::Approved, Some(ids)) => format!(
                "approved by {} as member {} ({})",
                self.reviewer_id, ids.member_id, ids.account_number
            ),
            (ReviewVerdict::Approved, None) => format!("approved by {}", self.reviewer_id),
            (ReviewVerdict::Rejected, _) => format!(
                "rejected by {}: {}",
                self.reviewer_id,
                self.reason_code.as_deref().unwrap_or("unspecified")
            ),
        }
    }
}
