//! Prometheus metrics infrastructure with singleton-based initialization.
//!
//! - `OnceLock` guards one-time recorder installation
//! - `init_test()` tolerates concurrent initialization from test threads
//! - `/health` reflects the health check supplied at init

use axum::http::StatusCode;
use axum::{Extension, Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{
    AddressParseSnafu, AlreadyInitializedSnafu, MetricsError, NotInitializedSnafu,
    PrometheusInitSnafu,
};

/// Default metrics address.
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Callback consulted by `/health`; `true` means healthy.
pub type HealthCheck = Arc<dyn Fn() -> bool + Send + Sync>;

static CONTROLLER: OnceLock<MetricsController> = OnceLock::new();

/// Controller for the shared metrics recorder.
pub struct MetricsController {
    handle: PrometheusHandle,
}

impl MetricsController {
    /// Get a reference to the global metrics controller.
    pub fn get() -> Result<&'static Self, MetricsError> {
        CONTROLLER.get().context(NotInitializedSnafu)
    }

    /// Render metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn install_recorder() -> Result<(), MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install_recorder()
        .context(PrometheusInitSnafu)?;

    CONTROLLER
        .set(MetricsController { handle })
        .map_err(|_| AlreadyInitializedSnafu.build())
}

/// Install the recorder and serve `/metrics` and `/health` on `address`.
pub fn init_global(address: &str, health: HealthCheck) -> Result<(), MetricsError> {
    let addr: SocketAddr = address.parse().context(AddressParseSnafu)?;
    install_recorder()?;

    let handle = MetricsController::get()?.handle.clone();
    tokio::spawn(run_server(addr, handle, health));

    info!(%addr, "Metrics server started");
    Ok(())
}

/// Install the recorder without an HTTP endpoint. Safe to call repeatedly.
pub fn init_test() {
    if install_recorder().is_err() {
        while CONTROLLER.get().is_none() {
            std::hint::spin_loop();
        }
    }
}

async fn run_server(addr: SocketAddr, handle: PrometheusHandle, health: HealthCheck) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(Extension(handle))
        .layer(Extension(health));

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!("Metrics server error: {}", e);
    }
}

async fn metrics_handler(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

async fn health_handler(Extension(health): Extension<HealthCheck>) -> (StatusCode, &'static str) {
    if health() {
        (StatusCode::OK, "ok\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;
    use std::thread;

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
        assert!(MetricsController::get().is_ok());
    }

    #[test]
    fn test_controller_render() {
        init_test();
        counter!("spillway_test_counter").increment(7);

        let output = MetricsController::get().unwrap().render();
        assert!(output.contains("spillway_test_counter"));
    }

    #[test]
    fn test_concurrent_init_test() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                thread::spawn(|| {
                    init_test();
                    MetricsController::get().unwrap();
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_health_handler_reflects_check() {
        let healthy: HealthCheck = Arc::new(|| true);
        let (status, _) = health_handler(Extension(healthy)).await;
        assert_eq!(status, StatusCode::OK);

        let sick: HealthCheck = Arc::new(|| false);
        let (status, body) = health_handler(Extension(sick)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "unhealthy\n");
    }

    #[test]
    fn test_bad_address_rejected() {
        let err = init_global("not-an-address", Arc::new(|| true)).unwrap_err();
        assert!(matches!(err, MetricsError::AddressParse { .. }));
    }
}
