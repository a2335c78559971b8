//! Contract for the external document/biometric verification provider.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::domain::{ApplicantId, StageKind};

/// Idempotency key for a single piece of oracle work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckKey {
    pub applicant_id: ApplicantId,
    pub stage: StageKind,
    pub check_name: String,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub key: CheckKey,
    pub payload: serde_json::Value,
}

/// Handle returned on submission; resubmitting the same key yields the same ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckTicket {
    pub key: CheckKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OracleVerdict {
    Pending,
    Resolved {
        passed: bool,
        confidence: Option<f32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("verification provider unavailable: {0}")]
    Unavailable(String),
    #[error("verification provider has no record of {0:?}")]
    UnknownTicket(CheckKey),
}

/// External verifier. Implementations must dedupe work per [`CheckKey`] and must eventually
/// resolve every submitted check; callers still bound the wait with their own timeout.
#[async_trait]
pub trait VerificationOracle: Send + Sync {
    async fn submit_check(&self, request: CheckRequest) -> Result<CheckTicket, OracleError>;
    async fn poll_check(&self, ticket: &CheckTicket) -> Result<OracleVerdict, OracleError>;
}

#[derive(Debug, Clone, Copy)]
enum ScriptedVerdict {
    Pass(f32),
    Fail(f32),
    Hang,
}

#[derive(Debug)]
struct Submission {
    submitted_at: Instant,
    latency: Duration,
    verdict: ScriptedVerdict,
}

#[derive(Debug, Default)]
struct SimulatedState {
    submissions: HashMap<CheckKey, Submission>,
    submit_calls: usize,
    outages_remaining: u32,
}

/// Deterministic stand-in for a real provider: every check resolves after a fixed latency
/// and passes unless scripted otherwise.
#[derive(Debug)]
pub struct SimulatedOracle {
    latency: Duration,
    confidence: f32,
    latency_overrides: HashMap<String, Duration>,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    state: Mutex<SimulatedState>,
}

impl SimulatedOracle {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            confidence: 0.97,
            latency_overrides: HashMap::new(),
            failing: HashSet::new(),
            hanging: HashSet::new(),
            state: Mutex::new(SimulatedState::default()),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Resolve `check_name` as failed.
    pub fn failing(mut self, check_name: &str) -> Self {
        self.failing.insert(check_name.to_string());
        self
    }

    /// Never resolve `check_name`.
    pub fn hanging(mut self, check_name: &str) -> Self {
        self.hanging.insert(check_name.to_string());
        self
    }

    pub fn with_latency_for(mut self, check_name: &str, latency: Duration) -> Self {
        self.latency_overrides
            .insert(check_name.to_string(), latency);
        self
    }

    /// Reject the next `count` calls with a transport error.
    pub fn with_outages(self, count: u32) -> Self {
        self.lock().outages_remaining = count;
        self
    }

    /// Number of distinct pieces of oracle work created.
    pub fn distinct_submissions(&self) -> usize {
        self.lock().submissions.len()
    }

    pub fn submit_calls(&self) -> usize {
        self.lock().submit_calls
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn script_for(&self, check_name: &str) -> ScriptedVerdict {
        if self.hanging.contains(check_name) {
            ScriptedVerdict::Hang
        } else if self.failing.contains(check_name) {
            ScriptedVerdict::Fail(1.0 - self.confidence)
        } else {
            ScriptedVerdict::Pass(self.confidence)
        }
    }

    fn take_outage(state: &mut SimulatedState) -> Result<(), OracleError> {
        if state.outages_remaining > 0 {
            state.outages_remaining -= 1;
            return Err(OracleError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VerificationOracle for SimulatedOracle {
    async fn submit_check(&self, request: CheckRequest) -> Result<CheckTicket, OracleError> {
        let verdict = self.script_for(&request.key.check_name);
        let latency = self
            .latency_overrides
            .get(&request.key.check_name)
            .copied()
            .unwrap_or(self.latency);

        let mut state = self.lock();
        state.submit_calls += 1;
        Self::take_outage(&mut state)?;
        state
            .submissions
            .entry(request.key.clone())
            .or_insert_with(|| Submission {
                submitted_at: Instant::now(),
                latency,
                verdict,
            });

        Ok(CheckTicket { key: request.key })
    }

    async fn poll_check(&self, ticket: &CheckTicket) -> Result<OracleVerdict, OracleError> {
        let mut state = self.lock();
        Self::take_outage(&mut state)?;
        let submission = state
            .submissions
            .get(&ticket.key)
            .ok_or_else(|| OracleError::UnknownTicket(ticket.key.clone()))?;

        if submission.submitted_at.elapsed() < submission.latency {
            return Ok(OracleVerdict::Pending);
        }

        Ok(match submission.verdict {
            ScriptedVerdict::Pass(confidence) => OracleVerdict::Resolved {
                passed: true,
                confidence: Some(confidence),
            },
            ScriptedVerdict::Fail(confidence) => OracleVerdict::Resolved {
                passed: false,
                confidence: Some(confidence),
            },
            ScriptedVerdict::Hang => OracleVerdict::Pending,
        })
    }
}
