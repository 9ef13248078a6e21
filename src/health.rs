//! Composed liveness: runtime, broker, pool, and per-session checks.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{BrokerClient, SessionState};
use crate::docker::ContainerRuntime;
use crate::pool::{PoolCounts, PoolManager};

/// Broker reachability plus measured latency.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RedisHealth {
    pub ok: bool,
    pub latency_ms: Option<u64>,
}

/// Pool manager liveness and occupancy.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PoolHealth {
    pub running: bool,
    #[serde(flatten)]
    pub counts: PoolCounts,
}

/// The single availability signal, with the detail that produced it.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub docker: bool,
    pub redis: RedisHealth,
    pub pool: PoolHealth,
}

/// Health of one session's container as its wrapper reports it.
#[derive(Clone, Debug, Serialize)]
pub struct SessionHealth {
    pub healthy: bool,
    /// True when the heartbeat is too old or the state record is missing.
    pub stale: bool,
    pub status: Option<String>,
    pub heartbeat_age_ms: Option<u64>,
}

/// Composes the subsystem checks. Holds references injected at
/// construction; owns nothing.
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    broker: BrokerClient,
    pool: Arc<PoolManager>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").finish_non_exhaustive()
    }
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        broker: BrokerClient,
        pool: Arc<PoolManager>,
    ) -> Self {
        Self {
            runtime,
            broker,
            pool,
        }
    }

    /// One boolean plus the structured detail behind it.
    pub async fn check(&self) -> HealthReport {
        let docker = self.runtime.available().await;

        let redis = match self.broker.ping().await {
            Ok(latency) => RedisHealth {
                ok: true,
                latency_ms: Some(latency.as_millis() as u64),
            },
            Err(e) => {
                log::warn!("broker ping failed: {e}");
                RedisHealth {
                    ok: false,
                    latency_ms: None,
                }
            }
        };

        let pool = PoolHealth {
            running: self.pool.is_running(),
            counts: self.pool.counts().await,
        };

        HealthReport {
            healthy: docker && redis.ok && pool.running,
            docker,
            redis,
            pool,
        }
    }

    /// A session is healthy iff its state record exists, its status is
    /// idle or running, and its heartbeat is younger than three health
    /// intervals. No state record always reads as unhealthy and stale.
    pub async fn session_health(&self, session: &str) -> SessionHealth {
        let state = match self.broker.get_state(session).await {
            Ok(state) => state,
            Err(e) => {
                log::warn!("state read for {session} failed: {e}");
                None
            }
        };
        evaluate_session(state, self.pool.config().health_interval() * 3)
    }
}

fn evaluate_session(state: Option<SessionState>, max_heartbeat_age: Duration) -> SessionHealth {
    let Some(state) = state else {
        return SessionHealth {
            healthy: false,
            stale: true,
            status: None,
            heartbeat_age_ms: None,
        };
    };

    let age = state.heartbeat_age();
    let fresh = age.map(|a| a < max_heartbeat_age).unwrap_or(false);
    let status_ok = state.status == "idle" || state.status == "running";

    SessionHealth {
        healthy: status_ok && fresh,
        stale: !fresh,
        status: Some(state.status),
        heartbeat_age_ms: age.map(|a| a.as_millis() as u64),
    }
}
