//! Health check HTTP server for production monitoring
//!
//! Provides liveness and readiness probes for process supervision and a
//! Prometheus metrics endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::breaker::{BreakerRegistry, CircuitState};
use crate::registry::BuyerRegistry;
use crate::services::EngineMetrics;

/// Health status for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Component health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

/// Overall system health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
    pub buyers_registered: usize,
    pub circuits_open: usize,
}

/// Shared state for the health server
pub struct HealthState {
    /// When the server started
    pub started_at: DateTime<Utc>,
    /// Is the ledger database reachable
    pub db_connected: AtomicBool,
    /// Last database check timestamp
    pub last_db_check: RwLock<Option<DateTime<Utc>>>,
    /// Last auction completion timestamp
    pub last_auction: RwLock<Option<DateTime<Utc>>>,
    /// Buyer directory reference
    pub registry: Option<Arc<BuyerRegistry>>,
    /// Breaker registry reference
    pub breakers: Option<Arc<BreakerRegistry>>,
    /// Metrics reference
    pub metrics: Option<Arc<EngineMetrics>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            db_connected: AtomicBool::new(false),
            last_db_check: RwLock::new(None),
            last_auction: RwLock::new(None),
            registry: None,
            breakers: None,
            metrics: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<BuyerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Update database connection status
    pub fn set_db_connected(&self, connected: bool) {
        self.db_connected.store(connected, Ordering::SeqCst);
    }

    /// Record a database check
    pub async fn record_db_check(&self, success: bool) {
        *self.last_db_check.write().await = Some(Utc::now());
        self.db_connected.store(success, Ordering::SeqCst);
    }

    /// Record a completed auction
    pub async fn record_auction(&self) {
        *self.last_auction.write().await = Some(Utc::now());
    }

    /// Get overall health status
    pub async fn get_health(&self) -> HealthResponse {
        let mut components = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        // Database health; ledger can run in-memory, so a missing DB
        // only degrades
        let db_connected = self.db_connected.load(Ordering::SeqCst);
        let db_status = if db_connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        if db_status == HealthStatus::Unhealthy && overall_status == HealthStatus::Healthy {
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "database".to_string(),
            status: db_status,
            message: if !db_connected {
                Some("Disconnected".to_string())
            } else {
                None
            },
            last_check: *self.last_db_check.read().await,
        });

        // Buyer directory health
        let buyers_registered = self
            .registry
            .as_ref()
            .map(|r| r.snapshot().buyer_count())
            .unwrap_or(0);
        let directory_status = if buyers_registered > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        if directory_status == HealthStatus::Degraded && overall_status == HealthStatus::Healthy {
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "buyer_directory".to_string(),
            status: directory_status,
            message: if buyers_registered == 0 {
                Some("No buyers registered".to_string())
            } else {
                Some(format!("{} buyers", buyers_registered))
            },
            last_check: Some(Utc::now()),
        });

        // Circuit health
        let circuits_open = if let Some(ref breakers) = self.breakers {
            breakers
                .snapshot_all()
                .await
                .iter()
                .filter(|s| s.state == CircuitState::Open)
                .count()
        } else {
            0
        };
        let circuit_status = if circuits_open == 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        if circuit_status == HealthStatus::Degraded && overall_status == HealthStatus::Healthy {
            overall_status = HealthStatus::Degraded;
        }
        components.push(ComponentHealth {
            name: "buyer_circuits".to_string(),
            status: circuit_status,
            message: if circuits_open > 0 {
                Some(format!("{} circuits open", circuits_open))
            } else {
                None
            },
            last_check: *self.last_auction.read().await,
        });

        let uptime = (Utc::now() - self.started_at).num_seconds() as u64;

        HealthResponse {
            status: overall_status,
            timestamp: Utc::now(),
            uptime_seconds: uptime,
            components,
            buyers_registered,
            circuits_open,
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Health check server
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Start the health server
    pub async fn run(&self) -> crate::Result<()> {
        let state = Arc::clone(&self.state);

        let app = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(liveness_handler))
            .route("/readyz", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .await
            .map_err(|e| crate::EngineError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }

    /// Get shared state for updating from other components
    pub fn state(&self) -> Arc<HealthState> {
        Arc::clone(&self.state)
    }
}

/// Full health check endpoint
async fn health_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Liveness probe - is the process alive?
async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness probe - can the engine run auctions?
async fn readiness_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Prometheus metrics endpoint
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let health = state.get_health().await;
    let db_connected = if state.db_connected.load(Ordering::SeqCst) {
        1
    } else {
        0
    };

    let mut body = state
        .metrics
        .as_ref()
        .map(|m| m.prometheus())
        .unwrap_or_default();

    body.push_str(&format!(
        r#"
# HELP pingpost_uptime_seconds Seconds since process start
# TYPE pingpost_uptime_seconds gauge
pingpost_uptime_seconds {}

# HELP pingpost_db_connected Ledger database connectivity
# TYPE pingpost_db_connected gauge
pingpost_db_connected {}

# HELP pingpost_buyers_registered Buyers in the directory
# TYPE pingpost_buyers_registered gauge
pingpost_buyers_registered {}

# HELP pingpost_circuits_open Buyers currently gated by a breaker
# TYPE pingpost_circuits_open gauge
pingpost_circuits_open {}
"#,
        health.uptime_seconds, db_connected, health.buyers_registered, health.circuits_open,
    ));

    body
}
