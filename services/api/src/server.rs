use crate::cli::ServeArgs;
use crate::infra::{build_registry, simulated_oracle, AppState};
use crate::routes::with_onboarding_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use coop_onboarding::config::AppConfig;
use coop_onboarding::error::AppError;
use coop_onboarding::telemetry;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

const DEFAULT_ORACLE_LATENCY_MS: u64 = 400;

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let latency = args.oracle_latency_ms.unwrap_or(DEFAULT_ORACLE_LATENCY_MS);
    let wiring = build_registry(&config.onboarding, simulated_oracle(latency), None);

    let app = with_onboarding_routes(wiring.registry)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(
        ?config.environment,
        %addr,
        edit_policy = config.onboarding.edit_policy.label(),
        oracle_latency_ms = latency,
        "member onboarding service ready"
    );

    axum::serve(listener, app).await?;
    Ok(())
}
