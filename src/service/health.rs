//! Component health of a running engine
//!
//! Backs the `/health`, `/ready`, `/alive` and `/stats` endpoints and the
//! `--health-check` flag.

use crate::service::app::AppState;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Keep the worse of two statuses
    fn combine(self, other: &HealthStatus) -> HealthStatus {
        match (&self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(label)
    }
}

/// Engine health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Worst status across the component checks
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Why the component is not healthy, or a note such as "publishing disabled"
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ComponentCheck {
    fn finish(
        name: &str,
        started: Instant,
        (status, message): (HealthStatus, Option<String>),
    ) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Pool, match and pass counters exposed by `/stats`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub active_matches: usize,
    pub tickets_waiting: usize,
    pub matches_created: u64,
    pub matches_ended: u64,
    pub tickets_matched: u64,
    pub passes_run: u64,
    pub external_failures: u64,
}

impl HealthCheck {
    /// Full component report plus manager statistics
    ///
    /// A stopped engine is unhealthy whatever its components report.
    pub async fn check(app_state: Arc<AppState>) -> Result<Self> {
        let running = Self::check_service_running(&app_state).await;
        let status = if running.status == HealthStatus::Healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        let checks = vec![
            running,
            Self::check_store(&app_state).await,
            Self::check_amqp_health(&app_state),
        ];
        let status = checks[1..]
            .iter()
            .fold(status, |acc, check| acc.combine(&check.status));

        Ok(HealthCheck {
            status,
            service: app_state.config().service.name.clone(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            stats: Self::gather_service_stats(&app_state).await,
            checks,
        })
    }

    pub async fn liveness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        Ok(if app_state.is_running().await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        })
    }

    /// Running, with the store answering; a closed broker only degrades readiness
    pub async fn readiness_check(app_state: Arc<AppState>) -> Result<HealthStatus> {
        if !app_state.is_running().await {
            return Ok(HealthStatus::Unhealthy);
        }
        let store = Self::check_store(&app_state).await.status;
        Ok(store.combine(&Self::check_amqp_health(&app_state).status))
    }

    async fn check_service_running(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        let outcome = if app_state.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (HealthStatus::Unhealthy, Some("engine loops stopped".to_string()))
        };
        ComponentCheck::finish("service_running", started, outcome)
    }

    /// The store answers if both managers can report their statistics
    async fn check_store(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        let scheduler = app_state.scheduler().get_stats().map(|_| ());
        let sessions = app_state.sessions().get_stats().await.map(|_| ());
        let outcome = match scheduler.and(sessions) {
            Ok(()) => (HealthStatus::Healthy, None),
            Err(e) => {
                error!(error = %e, "Store check failed");
                (HealthStatus::Degraded, Some(e.to_string()))
            }
        };
        ComponentCheck::finish("store", started, outcome)
    }

    /// A closed broker connection degrades the service; publishing is best-effort
    fn check_amqp_health(app_state: &AppState) -> ComponentCheck {
        let started = Instant::now();
        let outcome = match app_state.amqp_connection() {
            None => (HealthStatus::Healthy, Some("publishing disabled".to_string())),
            Some(connection) if connection.is_open() => (HealthStatus::Healthy, None),
            Some(_) => (HealthStatus::Degraded, Some("broker connection closed".to_string())),
        };
        ComponentCheck::finish("amqp_connection", started, outcome)
    }

    async fn gather_service_stats(app_state: &AppState) -> ServiceStats {
        let mut stats = ServiceStats::default();

        match app_state.scheduler().get_stats() {
            Ok(scheduler) => {
                stats.tickets_waiting = scheduler.tickets_waiting;
                stats.tickets_matched = scheduler.tickets_matched;
                stats.passes_run = scheduler.passes_run;
                stats.external_failures = scheduler.external_failures;
            }
            Err(e) => debug!("Failed to get scheduler stats for health check: {}", e),
        }

        match app_state.sessions().get_stats().await {
            Ok(sessions) => {
                stats.active_matches = sessions.active_matches;
                stats.matches_created = sessions.matches_created;
                stats.matches_ended = sessions.matches_ended;
            }
            Err(e) => debug!("Failed to get session stats for health check: {}", e),
        }

        stats
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    async fn app_state() -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.amqp.enabled = false;
        Arc::new(AppState::new(config).await.unwrap())
    }

    #[test]
    fn test_status_combine_keeps_worst() {
        assert_eq!(
            HealthStatus::Healthy.combine(&HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.combine(&HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.combine(&HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_stopped_service_is_unhealthy() {
        let state = app_state().await;

        let health = HealthCheck::check(state.clone()).await.unwrap();
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert_eq!(health.checks.len(), 3);
        assert_eq!(
            HealthCheck::readiness_check(state).await.unwrap(),
            HealthStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_health_check_serializes() {
        let health = HealthCheck::check(app_state().await).await.unwrap();
        let json = health.to_json().unwrap();
        assert!(json.contains("\"service\": \"matchforge\""));
        assert!(json.contains("amqp_connection"));
    }
}
