use std::time::Duration;

use tracing::{debug, warn};

use super::clock::Clock;
use super::domain::CheckResult;
use super::oracle::{CheckRequest, CheckTicket, OracleError, OracleVerdict, VerificationOracle};

/// Drives one oracle check to a terminal outcome.
///
/// Transport failures are retried up to `attempts` times; a check that has not resolved
/// within `timeout` of submission is recorded as a timed-out failure. Results arriving after
/// the deadline are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckRunner {
    timeout: Duration,
    poll_interval: Duration,
    attempts: u32,
}

enum Resolution {
    Resolved {
        passed: bool,
        confidence: Option<f32>,
    },
    Unreachable(OracleError),
}

impl CheckRunner {
    pub fn new(timeout: Duration, poll_interval: Duration, attempts: u32) -> Self {
        Self {
            timeout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            attempts: attempts.max(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn run<O>(
        &self,
        oracle: &O,
        request: CheckRequest,
        mandatory: bool,
        clock: &dyn Clock,
    ) -> CheckResult
    where
        O: VerificationOracle + ?Sized,
    {
        let check_name = request.key.check_name.clone();
        let mut result = CheckResult::pending(check_name.clone(), mandatory, clock.now());

        let resolution = tokio::time::timeout(self.timeout, self.drive(oracle, request)).await;

        match resolution {
            Ok(Resolution::Resolved { passed, confidence }) => {
                debug!(check = %check_name, passed, "verification check resolved");
                result.resolve(passed, confidence, clock.now());
            }
            Ok(Resolution::Unreachable(error)) => {
                warn!(check = %check_name, %error, "verification provider unreachable");
                result.time_out(clock.now());
            }
            Err(_) => {
                warn!(
                    check = %check_name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "verification check timed out"
                );
                result.time_out(clock.now());
            }
        }

        result
    }

    async fn drive<O>(&self, oracle: &O, request: CheckRequest) -> Resolution
    where
        O: VerificationOracle + ?Sized,
    {
        let ticket = match self.submit(oracle, request).await {
            Ok(ticket) => ticket,
            Err(error) => return Resolution::Unreachable(error),
        };

        let mut consecutive_failures = 0;
        loop {
            match oracle.poll_check(&ticket).await {
                Ok(OracleVerdict::Resolved { passed, confidence }) => {
                    return Resolution::Resolved { passed, confidence };
                }
                Ok(OracleVerdict::Pending) => consecutive_failures = 0,
                Err(error) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.attempts {
                        return Resolution::Unreachable(error);
                    }
                    debug!(check = %ticket.key.check_name, %error, "retrying oracle poll");
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn submit<O>(&self, oracle: &O, request: CheckRequest) -> Result<CheckTicket, OracleError>
    where
        O: VerificationOracle + ?Sized,
    {
        let mut attempt = 1;
        loop {
            match oracle.submit_check(request.clone()).await {
                Ok(ticket) => return Ok(ticket),
                Err(error) if attempt < self.attempts => {
                    debug!(check = %request.key.check_name, attempt, %error, "retrying oracle submission");
                    attempt += 1;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
