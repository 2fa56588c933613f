//! Health snapshots
//!
//! A [`HealthSnapshot`] is computed on demand from live state and never
//! stored, so it cannot go stale.

use crate::circuit_breaker::CircuitState;
use serde::Serialize;
use std::time::SystemTime;

/// Coarse health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Online with the circuit closed
    Healthy,
    /// Online, probing a recovering service
    Degraded,
    /// Offline or circuit open
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Read-only view of the session layer's health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// Online and the circuit is not open
    pub is_healthy: bool,
    /// Calls are currently being refused
    pub circuit_breaker_open: bool,
    /// Current connectivity
    pub online: bool,
    /// Resilient executions in flight
    pub active_operations: usize,
    /// Distinct deduplicated requests in flight
    pub pending_requests: usize,
    /// When this snapshot was taken
    pub last_health_check: SystemTime,
}

impl HealthSnapshot {
    /// Assemble a snapshot from its inputs
    pub fn compute(
        circuit: CircuitState,
        online: bool,
        active_operations: usize,
        pending_requests: usize,
    ) -> Self {
        let circuit_breaker_open = circuit == CircuitState::Open;
        Self {
            is_healthy: online && !circuit_breaker_open,
            circuit_breaker_open,
            online,
            active_operations,
            pending_requests,
            last_health_check: SystemTime::now(),
        }
    }

    /// Coarse status derived from the snapshot and the circuit state
    pub fn status(&self, circuit: CircuitState) -> HealthStatus {
        match (self.is_healthy, circuit) {
            (false, _) => HealthStatus::Unhealthy,
            (true, CircuitState::HalfOpen) => HealthStatus::Degraded,
            (true, _) => HealthStatus::Healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_when_online_and_closed() {
        let snapshot = HealthSnapshot::compute(CircuitState::Closed, true, 2, 1);
        assert!(snapshot.is_healthy);
        assert!(!snapshot.circuit_breaker_open);
        assert_eq!(snapshot.active_operations, 2);
        assert_eq!(snapshot.pending_requests, 1);
        assert_eq!(snapshot.status(CircuitState::Closed), HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_when_open_or_offline() {
        let open = HealthSnapshot::compute(CircuitState::Open, true, 0, 0);
        assert!(!open.is_healthy);
        assert!(open.circuit_breaker_open);

        let offline = HealthSnapshot::compute(CircuitState::Closed, false, 0, 0);
        assert!(!offline.is_healthy);
        assert_eq!(offline.status(CircuitState::Closed), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_half_open_is_degraded() {
        let snapshot = HealthSnapshot::compute(CircuitState::HalfOpen, true, 0, 0);
        assert!(snapshot.is_healthy);
        assert_eq!(snapshot.status(CircuitState::HalfOpen), HealthStatus::Degraded);
    }

    #[test]
    fn test_serializes_camel_case() {
        let snapshot = HealthSnapshot::compute(CircuitState::Closed, true, 0, 0);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["isHealthy"], true);
        assert_eq!(json["circuitBreakerOpen"], false);
        assert!(json.get("lastHealthCheck").is_some());
    }
}
