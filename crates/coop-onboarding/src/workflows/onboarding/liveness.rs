//! Ordered liveness challenges aggregated into one all-or-nothing session result.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::domain::{ApplicantId, CheckOutcome, CheckResult, StageKind};
use super::oracle::{CheckKey, CheckRequest, OracleVerdict, VerificationOracle};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Challenge {
    LookStraight,
    TurnLeft,
    TurnRight,
    Smile,
    Blink,
}

impl Challenge {
    pub const fn ordered() -> [Self; 5] {
        [
            Self::LookStraight,
            Self::TurnLeft,
            Self::TurnRight,
            Self::Smile,
            Self::Blink,
        ]
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::LookStraight => "look_straight",
            Self::TurnLeft => "turn_left",
            Self::TurnRight => "turn_right",
            Self::Smile => "smile",
            Self::Blink => "blink",
        }
    }

    pub const fn instruction(self) -> &'static str {
        match self {
            Self::LookStraight => "Look straight at the camera",
            Self::TurnLeft => "Slowly turn your head to the left",
            Self::TurnRight => "Slowly turn your head to the right",
            Self::Smile => "Smile",
            Self::Blink => "Blink twice",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Passed,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStep {
    Next(Challenge),
    Complete(SessionState),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LivenessError {
    #[error("liveness session aborted by the applicant: {0}")]
    Aborted(String),
    #[error("expected result for challenge {expected}, received {received}")]
    OutOfOrder { expected: String, received: String },
    #[error("liveness session is already {0:?}")]
    Closed(SessionState),
}

/// Raised by a capture device when the applicant abandons the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capture aborted: {reason}")]
pub struct CaptureAborted {
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFrame {
    pub reference: String,
}

/// Camera-side collaborator producing one capture per instruction.
#[async_trait]
pub trait LivenessCapture: Send + Sync {
    async fn capture(&self, challenge: Challenge) -> Result<CaptureFrame, CaptureAborted>;
}

/// Frames uploaded ahead of a session, keyed by challenge. A challenge with no frame aborts
/// the session, so the applicant can upload again and start over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmittedFrames {
    frames: HashMap<Challenge, String>,
}

impl SubmittedFrames {
    pub fn new(frames: impl IntoIterator<Item = (Challenge, String)>) -> Self {
        Self {
            frames: frames
                .into_iter()
                .filter(|(_, reference)| !reference.trim().is_empty())
                .collect(),
        }
    }
}

#[async_trait]
impl LivenessCapture for SubmittedFrames {
    async fn capture(&self, challenge: Challenge) -> Result<CaptureFrame, CaptureAborted> {
        self.frames
            .get(&challenge)
            .map(|reference| CaptureFrame {
                reference: reference.clone(),
            })
            .ok_or_else(|| CaptureAborted {
                reason: format!("no frame uploaded for {}", challenge.key()),
            })
    }
}

/// One run through the challenge list. Never persisted until it completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeSession {
    applicant_id: ApplicantId,
    attempt: u32,
    challenges: Vec<Challenge>,
    cursor: usize,
    results: Vec<CheckResult>,
    state: SessionState,
}

impl ChallengeSession {
    pub fn applicant_id(&self) -> &ApplicantId {
        &self.applicant_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<CheckResult> {
        self.results
    }

    pub fn advance(&mut self) -> ChallengeStep {
        if self.state != SessionState::Active {
            return ChallengeStep::Complete(self.state);
        }

        match self.challenges.get(self.cursor) {
            Some(challenge) => ChallengeStep::Next(*challenge),
            None => {
                self.state = SessionState::Passed;
                ChallengeStep::Complete(SessionState::Passed)
            }
        }
    }

    /// Record the verdict for the current challenge. A failure ends the session.
    pub fn confirm(&mut self, result: CheckResult) -> Result<(), LivenessError> {
        let expected = self.current()?;
        if result.name != expected.key() {
            return Err(LivenessError::OutOfOrder {
                expected: expected.key().to_string(),
                received: result.name,
            });
        }

        let passed = result.outcome == CheckOutcome::Passed;
        self.results.push(result);
        if passed {
            self.cursor += 1;
        } else {
            self.state = SessionState::Failed;
        }
        Ok(())
    }

    /// The current challenge's window elapsed without a passing verdict.
    pub fn expire(
        &mut self,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), LivenessError> {
        let challenge = self.current()?;
        let mut result = CheckResult::pending(challenge.key(), true, started_at);
        result.time_out(now);
        self.results.push(result);
        self.state = SessionState::Failed;
        Ok(())
    }

    pub fn abort(&mut self) {
        self.results.clear();
        self.state = SessionState::Aborted;
    }

    fn current(&self) -> Result<Challenge, LivenessError> {
        if self.state != SessionState::Active {
            return Err(LivenessError::Closed(self.state));
        }
        self.challenges
            .get(self.cursor)
            .copied()
            .ok_or(LivenessError::Closed(SessionState::Passed))
    }
}

enum ChallengeAttempt {
    Verdict {
        passed: bool,
        confidence: Option<f32>,
    },
    Aborted(CaptureAborted),
}

/// Runs challenges one at a time, each bounded by `window`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSequencer {
    challenges: Vec<Challenge>,
    window: Duration,
    poll_interval: Duration,
}

impl ChallengeSequencer {
    pub fn standard(window: Duration) -> Self {
        Self::with_challenges(Challenge::ordered().to_vec(), window)
    }

    pub fn with_challenges(challenges: Vec<Challenge>, window: Duration) -> Self {
        Self {
            challenges,
            window,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn start(&self, applicant_id: &ApplicantId, attempt: u32) -> ChallengeSession {
        ChallengeSession {
            applicant_id: applicant_id.clone(),
            attempt,
            challenges: self.challenges.clone(),
            cursor: 0,
            results: Vec::new(),
            state: SessionState::Active,
        }
    }

    /// Drive `session` to completion. An abort discards the session and returns an error.
    pub async fn run<O, C>(
        &self,
        mut session: ChallengeSession,
        oracle: &O,
        capture: &C,
        clock: &dyn Clock,
    ) -> Result<ChallengeSession, LivenessError>
    where
        O: VerificationOracle + ?Sized,
        C: LivenessCapture + ?Sized,
    {
        loop {
            let challenge = match session.advance() {
                ChallengeStep::Complete(state) => {
                    info!(
                        applicant_id = %session.applicant_id,
                        attempt = session.attempt,
                        ?state,
                        "liveness session finished"
                    );
                    return Ok(session);
                }
                ChallengeStep::Next(challenge) => challenge,
            };

            let started_at = clock.now();
            let attempt = tokio::time::timeout(
                self.window,
                self.attempt_challenge(&session, challenge, oracle, capture),
            )
            .await;

            match attempt {
                Ok(ChallengeAttempt::Verdict { passed, confidence }) => {
                    let mut result = CheckResult::pending(challenge.key(), true, started_at);
                    result.resolve(passed, confidence, clock.now());
                    session.confirm(result)?;
                }
                Ok(ChallengeAttempt::Aborted(aborted)) => {
                    debug!(applicant_id = %session.applicant_id, challenge = challenge.key(), "liveness capture aborted");
                    session.abort();
                    return Err(LivenessError::Aborted(aborted.reason));
                }
                Err(_) => {
                    warn!(
                        applicant_id = %session.applicant_id,
                        challenge = challenge.key(),
                        "liveness challenge window elapsed"
                    );
                    session.expire(started_at, clock.now())?;
                }
            }
        }
    }

    async fn attempt_challenge<O, C>(
        &self,
        session: &ChallengeSession,
        challenge: Challenge,
        oracle: &O,
        capture: &C,
    ) -> ChallengeAttempt
    where
        O: VerificationOracle + ?Sized,
        C: LivenessCapture + ?Sized,
    {
        let frame = match capture.capture(challenge).await {
            Ok(frame) => frame,
            Err(aborted) => return ChallengeAttempt::Aborted(aborted),
        };

        let request = CheckRequest {
            key: CheckKey {
                applicant_id: session.applicant_id.clone(),
                stage: StageKind::Liveness,
                check_name: challenge.key().to_string(),
                attempt: session.attempt,
            },
            payload: json!({
                "instruction": challenge.instruction(),
                "frame": frame.reference,
            }),
        };

        // Transport errors are retried until the challenge window closes.
        let ticket = loop {
            match oracle.submit_check(request.clone()).await {
                Ok(ticket) => break ticket,
                Err(error) => {
                    debug!(challenge = challenge.key(), %error, "retrying liveness submission");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        };

        loop {
            match oracle.poll_check(&ticket).await {
                Ok(OracleVerdict::Resolved { passed, confidence }) => {
                    return ChallengeAttempt::Verdict { passed, confidence };
                }
                Ok(OracleVerdict::Pending) => {}
                Err(error) => {
                    debug!(challenge = challenge.key(), %error, "liveness poll failed");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
