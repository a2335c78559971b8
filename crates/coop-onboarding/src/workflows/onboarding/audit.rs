use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{AccountNumber, ApplicantId, MemberId, StageKind};

/// Who triggered a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum AuditActor {
    Applicant,
    Reviewer(String),
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum AuditEvent {
    ApplicantCreated,
    StageStarted {
        stage: StageKind,
    },
    StageAwaitingVerification {
        stage: StageKind,
        attempt: u32,
        reopened: Vec<StageKind>,
    },
    StageCompleted {
        stage: StageKind,
        submitted_for_review: bool,
        reopened: Vec<StageKind>,
    },
    StageFailed {
        stage: StageKind,
        failed_checks: Vec<String>,
    },
    StageRetried {
        stage: StageKind,
    },
    Approved {
        member_id: MemberId,
        account_number: AccountNumber,
    },
    Rejected {
        reason_code: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub applicant_id: ApplicantId,
    pub actor: AuditActor,
    pub event: AuditEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only transition log. Entries are never edited or removed.
pub trait AuditTrail: Send + Sync {
    fn append(
        &self,
        applicant_id: &ApplicantId,
        actor: AuditActor,
        event: AuditEvent,
        recorded_at: DateTime<Utc>,
    ) -> AuditEntry;

    fn for_applicant(&self, applicant_id: &ApplicantId) -> Vec<AuditEntry>;
}

#[derive(Debug, Default)]
pub struct InMemoryAuditTrail {
    entries: Mutex<Vec<AuditEntry>>,
}

impl InMemoryAuditTrail {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AuditTrail for InMemoryAuditTrail {
    fn append(
        &self,
        applicant_id: &ApplicantId,
        actor: AuditActor,
        event: AuditEvent,
        recorded_at: DateTime<Utc>,
    ) -> AuditEntry {
        let mut entries = self.lock();
        let entry = AuditEntry {
            sequence: entries.len() as u64 + 1,
            applicant_id: applicant_id.clone(),
            actor,
            event,
            recorded_at,
        };
        entries.push(entry.clone());
        entry
    }

    fn for_applicant(&self, applicant_id: &ApplicantId) -> Vec<AuditEntry> {
        self.lock()
            .iter()
            .filter(|entry| &entry.applicant_id == applicant_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_sequenced_and_filtered_by_applicant() {
        let trail = InMemoryAuditTrail::default();
        let first = ApplicantId("apl-000001".to_string());
        let second = ApplicantId("apl-000002".to_string());
        let now = Utc::now();

        trail.append(&first, AuditActor::Applicant, AuditEvent::ApplicantCreated, now);
        trail.append(&second, AuditActor::Applicant, AuditEvent::ApplicantCreated, now);
        let entry = trail.append(
            &first,
            AuditActor::System,
            AuditEvent::StageStarted {
                stage: StageKind::PersonalInfo,
            },
            now,
        );

        assert_eq!(entry.sequence, 3);
        let history = trail.for_applicant(&first);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event, AuditEvent::ApplicantCreated);
        assert_eq!(trail.len(), 3);
    }
}
