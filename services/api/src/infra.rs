use async_trait::async_trait;
use chrono::NaiveDate;
use coop_onboarding::config::OnboardingConfig;
use coop_onboarding::workflows::onboarding::{
    CaptureAborted, CaptureFrame, Challenge, Clock, EnrollmentRegistry,
    InMemoryApplicantRepository, InMemoryAuditTrail, LivenessCapture, SimulatedOracle,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub(crate) type ServiceRegistry = EnrollmentRegistry<InMemoryApplicantRepository, SimulatedOracle>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// In-process wiring: memory-backed storage and audit, simulated verification provider.
pub(crate) struct Wiring {
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) oracle: Arc<SimulatedOracle>,
    pub(crate) audit: Arc<InMemoryAuditTrail>,
}

pub(crate) fn build_registry(
    config: &OnboardingConfig,
    oracle: SimulatedOracle,
    clock: Option<Arc<dyn Clock>>,
) -> Wiring {
    let repository = Arc::new(InMemoryApplicantRepository::default());
    let oracle = Arc::new(oracle);
    let audit = Arc::new(InMemoryAuditTrail::default());
    let allocator = Arc::new(config.allocator());

    let mut registry = EnrollmentRegistry::new(
        repository,
        oracle.clone(),
        allocator,
        audit.clone(),
        config,
    );
    if let Some(clock) = clock {
        registry = registry.with_clock(clock);
    }

    Wiring {
        registry: Arc::new(registry),
        oracle,
        audit,
    }
}

pub(crate) fn simulated_oracle(latency_ms: u64) -> SimulatedOracle {
    SimulatedOracle::new(Duration::from_millis(latency_ms))
}

/// Stand-in for the applicant's camera: prints each instruction and returns a frame reference.
pub(crate) struct ConsoleCapture {
    pub(crate) device_id: String,
    pub(crate) abandon_at: Option<Challenge>,
}

#[async_trait]
impl LivenessCapture for ConsoleCapture {
    async fn capture(&self, challenge: Challenge) -> Result<CaptureFrame, CaptureAborted> {
        println!("    camera> {}", challenge.instruction());
        if self.abandon_at == Some(challenge) {
            return Err(CaptureAborted {
                reason: "applicant closed the camera".to_string(),
            });
        }
        debug!(device_id = %self.device_id, challenge = challenge.key(), "frame captured");
        Ok(CaptureFrame {
            reference: format!("{}/{}.jpg", self.device_id, challenge.key()),
        })
    }
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

pub(crate) fn parse_challenge(raw: &str) -> Result<Challenge, String> {
    Challenge::ordered()
        .into_iter()
        .find(|challenge| challenge.key().eq_ignore_ascii_case(raw.trim()))
        .ok_or_else(|| {
            let known: Vec<_> = Challenge::ordered().iter().map(|c| c.key()).collect();
            format!("unknown challenge '{raw}' (expected one of {})", known.join(", "))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_dates_and_challenges() {
        assert_eq!(
            parse_date(" 2026-03-14 "),
            Ok(NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date"))
        );
        assert!(parse_date("14/03/2026").is_err());
        assert_eq!(parse_challenge("Smile"), Ok(Challenge::Smile));
        assert!(parse_challenge("wink")
            .expect_err("unknown")
            .contains("look_straight"));
    }
}
