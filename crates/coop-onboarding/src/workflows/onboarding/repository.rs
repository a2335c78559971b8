use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::domain::{Applicant, ApplicantId, OverallStatus};

/// Storage abstraction so the registry can be exercised in isolation.
///
/// `update` replaces the whole record in one write; the registry relies on that to persist
/// stage progress, review transitions, and decisions atomically.
pub trait ApplicantRepository: Send + Sync {
    fn insert(&self, applicant: Applicant) -> Result<Applicant, RepositoryError>;
    fn update(&self, applicant: Applicant) -> Result<(), RepositoryError>;
    fn fetch(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError>;
    fn pending_review(&self, filter: &ReviewQueueFilter) -> Result<Vec<Applicant>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Reviewer queue query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReviewQueueFilter {
    #[serde(default)]
    pub submitted_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ReviewQueueFilter {
    pub fn matches(&self, applicant: &Applicant) -> bool {
        if applicant.overall_status != OverallStatus::PendingReview {
            return false;
        }
        match (self.submitted_since, applicant.submitted_for_review_at) {
            (Some(since), Some(submitted)) => submitted >= since,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }

    /// Order oldest submission first and apply the limit.
    pub fn apply(&self, mut applicants: Vec<Applicant>) -> Vec<Applicant> {
        applicants.retain(|applicant| self.matches(applicant));
        applicants.sort_by(|a, b| {
            a.submitted_for_review_at
                .cmp(&b.submitted_for_review_at)
                .then_with(|| a.applicant_id.cmp(&b.applicant_id))
        });
        if let Some(limit) = self.limit {
            applicants.truncate(limit);
        }
        applicants
    }
}

/// Process-local store used by the service shell and tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryApplicantRepository {
    records: Arc<Mutex<HashMap<ApplicantId, Applicant>>>,
}

impl InMemoryApplicantRepository {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ApplicantId, Applicant>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ApplicantRepository for InMemoryApplicantRepository {
    fn insert(&self, applicant: Applicant) -> Result<Applicant, RepositoryError> {
        let mut guard = self.lock();
        if guard.contains_key(&applicant.applicant_id) {
            return Err(RepositoryError::Conflict);
        }
        guard.insert(applicant.applicant_id.clone(), applicant.clone());
        Ok(applicant)
    }

    fn update(&self, applicant: Applicant) -> Result<(), RepositoryError> {
        let mut guard = self.lock();
        match guard.get_mut(&applicant.applicant_id) {
            Some(existing) => {
                *existing = applicant;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    fn fetch(&self, id: &ApplicantId) -> Result<Option<Applicant>, RepositoryError> {
        Ok(self.lock().get(id).cloned())
    }

    fn pending_review(&self, filter: &ReviewQueueFilter) -> Result<Vec<Applicant>, RepositoryError> {
        let candidates: Vec<Applicant> = self
            .lock()
            .values()
            .filter(|applicant| filter.matches(applicant))
            .cloned()
            .collect();
        Ok(filter.apply(candidates))
    }
}
