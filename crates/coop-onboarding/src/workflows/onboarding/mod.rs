//! Cooperative member onboarding.
//!
//! Applicants move through five ordered stages (personal information, KYC, ID verification,
//! liveness, photo upload). Each stage validates its payload and, where required, waits on an
//! external verification oracle. Once every stage is completed the applicant enters the review
//! queue, and a reviewer approval allocates the permanent member ID and account number.

pub mod allocator;
pub mod audit;
pub mod clock;
pub mod domain;
pub mod engine;
pub mod liveness;
pub mod oracle;
pub mod registry;
pub mod repository;
pub mod router;
pub mod validation;
pub mod verification;

#[cfg(test)]
mod tests;

pub use allocator::{AllocationError, IdentifierAllocator, SequenceAllocator};
pub use audit::{AuditActor, AuditEntry, AuditEvent, AuditTrail, InMemoryAuditTrail};
pub use clock::{Clock, FixedClock, SystemClock};
pub use domain::{
    AccountIdentifiers, AccountNumber, Applicant, ApplicantId, ApplicantView, CheckOutcome,
    CheckResult, DocumentType, EnrollmentDecision, IdDocuments, KycDetails, LivenessConsent,
    MemberId, OverallStatus, PersonalInfo, PhotoSubmission, ReviewVerdict, StageKind,
    StagePayload, StageRecord, StageStatus, StageView,
};
pub use engine::{EditPolicy, StageEngine, StageError, StageTransition};
pub use liveness::{
    CaptureAborted, CaptureFrame, Challenge, ChallengeSequencer, ChallengeSession, LivenessCapture,
    LivenessError, SessionState, SubmittedFrames,
};
pub use oracle::{
    CheckKey, CheckRequest, CheckTicket, OracleError, OracleVerdict, SimulatedOracle,
    VerificationOracle,
};
pub use registry::{EnrollmentError, EnrollmentRegistry, StageOutcome};
pub use repository::{
    ApplicantRepository, InMemoryApplicantRepository, RepositoryError, ReviewQueueFilter,
};
pub use router::{onboarding_router, DecisionRequest, FrameUpload, LivenessSessionRequest};
pub use validation::{FieldError, FieldErrorCode};
pub use verification::CheckRunner;
