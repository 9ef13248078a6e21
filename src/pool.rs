//! The container-pool scheduler.
//!
//! Owns every container lifecycle on this host: assignment of sessions to
//! containers, the warm pool, cap enforcement, reconciliation with the
//! runtime at startup, and the two recurring ticks (health and
//! maintenance) that reap stale and aged containers.
//!
//! # Concurrency
//!
//! All mutation of the in-memory maps and the registry happens under one
//! mutex. Runtime and broker calls never run while it is held; any check
//! made before blocking I/O is re-verified after the lock is re-acquired.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::broker::{BrokerClient, Interrupt};
use crate::config::{Config, MANAGED_LABEL};
use crate::docker::{
    config_fingerprint, derive_container_name, ContainerRuntime, ContainerState, CreateArgs,
};
use crate::error::PoolError;
use crate::registry::{ContainerRecord, ContainerStatus, Registry};

/// Maintenance tick period.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for `docker stop` during destruction.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Poll step while waiting for a started container to report running.
const STARTUP_POLL: Duration = Duration::from_millis(500);

/// A container handed out to serve a session.
#[derive(Clone, Debug)]
pub struct ContainerAssignment {
    pub name: String,
    pub id: String,
    /// True when an existing container (warm or adopted) was reused.
    pub reused: bool,
}

/// Snapshot of pool occupancy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct PoolCounts {
    pub total: usize,
    pub active: usize,
    pub warm: usize,
}

/// State guarded by the pool mutex: the durable registry plus the
/// in-memory session map and warm set derived from it.
struct PoolState {
    registry: Registry,
    /// session key → container name
    session_map: HashMap<String, String>,
    /// Unassigned idle containers, oldest first.
    warm: VecDeque<String>,
}

/// The central scheduler. Shared as `Arc<PoolManager>`; background ticks
/// hold their own clone.
pub struct PoolManager {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    /// Broker handle for heartbeat sync and warm-adoption delivery; absent
    /// in scheduling-only tests.
    broker: Option<BrokerClient>,
    fingerprint: String,
    state: Mutex<PoolState>,
    running: AtomicBool,
    tickers: StdMutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("fingerprint", &self.fingerprint)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl PoolManager {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        broker: Option<BrokerClient>,
        registry_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let fingerprint = config_fingerprint(&config);
        let registry = Registry::open(registry_path)?;
        Ok(Self {
            config,
            runtime,
            broker,
            fingerprint,
            state: Mutex::new(PoolState {
                registry,
                session_map: HashMap::new(),
                warm: VecDeque::new(),
            }),
            running: AtomicBool::new(false),
            tickers: StdMutex::new(Vec::new()),
        })
    }

    /// Where the registry document lives by default.
    pub fn default_registry_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(crate::config::APP_NAME)
            .join("registry.json")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bring the pool up: verify the runtime, reconcile the registry
    /// against it both ways, rebuild the in-memory maps, start the ticks,
    /// and enforce the warm-pool floor.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.runtime.available().await {
            return Err(PoolError::Unavailable("container runtime not reachable".to_string()).into());
        }
        self.runtime
            .ensure_image(&self.config.image)
            .await
            .context("ensure pool image")?;

        let listed = self
            .runtime
            .list(&format!("{MANAGED_LABEL}=1"))
            .await
            .context("list managed containers")?;
        let runtime_names: HashSet<String> = listed.iter().map(|c| c.name.clone()).collect();

        let mut to_destroy: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let removed = state.registry.reconcile(&runtime_names)?;
            if !removed.is_empty() {
                log::info!("reconciled away {} registry records: {removed:?}", removed.len());
            }

            // Runtime containers carrying our label but missing from the
            // registry are ours with no record; destroy on disagreement.
            for listed_container in &listed {
                if state.registry.get_by_name(&listed_container.name).is_none() {
                    to_destroy.push(listed_container.name.clone());
                }
            }

            let records: Vec<ContainerRecord> =
                state.registry.list().into_iter().cloned().collect();
            for record in &records {
                // A fingerprint mismatch means the container was built from
                // an older configuration; it is never reused.
                if record.config_fingerprint != self.fingerprint {
                    log::info!(
                        "container {} has drifted fingerprint {}, destroying",
                        record.name,
                        record.config_fingerprint
                    );
                    to_destroy.push(record.name.clone());
                }
            }

            state.session_map.clear();
            state.warm.clear();
            for record in &records {
                if to_destroy.contains(&record.name) {
                    continue;
                }
                if let Some(session) = &record.session_key {
                    state
                        .session_map
                        .insert(session.clone(), record.name.clone());
                } else if record.is_warm() {
                    state.warm.push_back(record.name.clone());
                }
            }
        }

        for name in to_destroy {
            self.destroy_container(&name).await;
        }

        self.running.store(true, Ordering::SeqCst);
        self.spawn_tickers();
        self.top_up_warm().await?;

        log::info!("pool started: {:?}", self.counts().await);
        Ok(())
    }

    fn spawn_tickers(self: &Arc<Self>) {
        let health = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(pool.config.health_interval());
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await; // immediate first tick
                loop {
                    interval.tick().await;
                    if !pool.is_running() {
                        break;
                    }
                    pool.health_tick().await;
                }
            })
        };
        let maintenance = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if !pool.is_running() {
                        break;
                    }
                    pool.maintenance_tick().await;
                }
            })
        };
        self.tickers
            .lock()
            .expect("ticker mutex poisoned")
            .extend([health, maintenance]);
    }

    /// Resolve a container for `session`, in order: the live container
    /// already mapped, a registry adoption, a warm container, a cold
    /// create. Caps are enforced before anything is created.
    pub async fn get_container(
        self: &Arc<Self>,
        session: &str,
        agent_id: Option<&str>,
        workspace: Option<&Path>,
        model: Option<&str>,
        agent_config: Option<&Value>,
    ) -> Result<ContainerAssignment> {
        // Fast path: a container already serves this session.
        let existing = {
            let state = self.state.lock().await;
            state
                .session_map
                .get(session)
                .cloned()
                .or_else(|| state.registry.get_by_session(session).map(|r| r.name.clone()))
        };
        if let Some(name) = existing {
            let record = {
                let state = self.state.lock().await;
                state.registry.get_by_name(&name).cloned()
            };
            if let Some(record) = record {
                if matches!(
                    record.status,
                    ContainerStatus::Creating | ContainerStatus::Starting
                ) {
                    bail!("container for session {session} is still starting");
                }
                let runtime_state = self
                    .runtime
                    .inspect_state(&name)
                    .await
                    .unwrap_or(ContainerState {
                        exists: false,
                        running: false,
                    });
                if runtime_state.running {
                    let mut state = self.state.lock().await;
                    state.session_map.insert(session.to_string(), name.clone());
                    state.warm.retain(|n| n != &name);
                    return Ok(ContainerAssignment {
                        name,
                        id: record.id,
                        reused: true,
                    });
                }
                // Dead container still holds the session's derived name;
                // clear it before provisioning a replacement.
                log::info!("container {name} for session {session} is not running, destroying");
                self.destroy_container(&name).await;
            }
        }

        // Reserve under the lock so concurrent requests cannot overshoot
        // the caps while this one is off doing I/O.
        let warm_hit = {
            let mut state = self.state.lock().await;

            if let Some(agent) = agent_id {
                let per_agent = state.registry.list_by_agent(agent).len();
                if per_agent >= self.config.pool.max_per_agent {
                    return Err(PoolError::Capacity(format!(
                        "agent {agent} already has {per_agent} containers (cap {})",
                        self.config.pool.max_per_agent
                    ))
                    .into());
                }
            }

            let mut assigned = None;
            while let Some(name) = state.warm.pop_front() {
                if state.registry.get_by_name(&name).is_some() {
                    assigned = Some(name);
                    break;
                }
                // Entry with no backing record: dropped.
            }
            match assigned {
                Some(name) => {
                    if let Err(e) = state.registry.assign_to_session(&name, session, agent_id) {
                        // Roll back: the container stays warm.
                        state.warm.push_front(name);
                        return Err(e);
                    }
                    state.session_map.insert(session.to_string(), name.clone());
                    Some(state.registry.get_by_name(&name).cloned().expect("just assigned"))
                }
                None => {
                    // Cold create. Total cap gates creation only; warm
                    // assignment above never grows the pool.
                    let total = state.registry.len();
                    if total >= self.config.pool.max_total {
                        return Err(PoolError::Capacity(format!(
                            "pool already holds {total} containers (cap {})",
                            self.config.pool.max_total
                        ))
                        .into());
                    }
                    let name = derive_container_name(&self.config.docker.container_prefix, session);
                    let mut record = ContainerRecord::new(
                        String::new(),
                        name.clone(),
                        session.to_string(),
                        self.fingerprint.clone(),
                    );
                    record.session_key = Some(session.to_string());
                    record.agent_id = agent_id.map(str::to_string);
                    state.registry.upsert(record)?;
                    state.session_map.insert(session.to_string(), name);
                    None
                }
            }
        };

        if let Some(record) = warm_hit {
            // Tell the warm wrapper which session it now serves. The
            // message is also queued, so a wrapper between subscriptions
            // still picks it up.
            if let Some(broker) = &self.broker {
                let adopt = Interrupt::Adopt {
                    session: session.to_string(),
                };
                if let Err(e) = broker.send_interrupt(&record.boot_session, &adopt).await {
                    log::warn!("adopt delivery to {} failed: {e}", record.name);
                }
            }
            self.spawn_top_up();
            return Ok(ContainerAssignment {
                name: record.name,
                id: record.id,
                reused: true,
            });
        }

        // Cold path: the reservation is in place, build the container.
        let name = derive_container_name(&self.config.docker.container_prefix, session);
        match self
            .provision(&name, session, agent_id, workspace, model, agent_config)
            .await
        {
            Ok(id) => {
                let mut state = self.state.lock().await;
                if let Some(mut record) = state.registry.get_by_name(&name).cloned() {
                    record.id = id.clone();
                    record.status = ContainerStatus::Idle;
                    if let Err(e) = state.registry.upsert(record) {
                        // Cannot record the container; do not hand it out.
                        state.session_map.remove(session);
                        drop(state);
                        self.destroy_container(&name).await;
                        return Err(e);
                    }
                }
                Ok(ContainerAssignment {
                    name,
                    id,
                    reused: false,
                })
            }
            Err(e) => {
                // No partial container may remain after a failed create.
                let _ = self.runtime.remove(&name, true).await;
                {
                    let mut state = self.state.lock().await;
                    if let Err(persist_err) = state.registry.remove_by_name(&name) {
                        log::warn!("failed to drop reservation for {name}: {persist_err}");
                    }
                    state.session_map.remove(session);
                }
                Err(PoolError::CreationFailed(e.to_string()).into())
            }
        }
    }

    /// Create and start one container, waiting until the runtime reports
    /// it running. Returns the runtime id.
    async fn provision(
        &self,
        name: &str,
        boot_session: &str,
        agent_id: Option<&str>,
        workspace: Option<&Path>,
        model: Option<&str>,
        agent_config: Option<&Value>,
    ) -> Result<String> {
        let default_workspace;
        let workspace = match workspace {
            Some(path) => path,
            None => {
                default_workspace = self.config.docker.workspace_root.join(name);
                &default_workspace
            }
        };
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("create workspace {}", workspace.display()))?;

        let args = CreateArgs::for_session(
            &self.config,
            name,
            boot_session,
            agent_id,
            workspace,
            model,
            agent_config,
            None,
            &self.fingerprint,
        );
        let id = self.runtime.create(&args).await?;
        self.runtime.start(name).await?;

        let deadline = Instant::now() + self.config.startup_timeout();
        loop {
            let state = self.runtime.inspect_state(name).await?;
            if state.running {
                break;
            }
            if Instant::now() >= deadline {
                bail!(
                    "container {name} not running after {}ms",
                    self.config.timeouts.startup_ms
                );
            }
            tokio::time::sleep(STARTUP_POLL).await;
        }
        log::info!("container {name} up (id {id})");
        Ok(id)
    }

    /// Release a session's container: back to the warm pool when requested
    /// and the floor has room, destroyed otherwise. A drifted container is
    /// always destroyed.
    pub async fn release_container(&self, session: &str, return_to_pool: bool) -> Result<()> {
        let name = {
            let mut state = self.state.lock().await;
            let Some(name) = state.session_map.get(session).cloned() else {
                log::debug!("release for unmapped session {session}");
                return Ok(());
            };
            let record = state.registry.get_by_name(&name).cloned();
            let fingerprint_ok = record
                .as_ref()
                .map(|r| r.config_fingerprint == self.fingerprint)
                .unwrap_or(false);

            if return_to_pool
                && state.warm.len() < self.config.pool.min_warm
                && fingerprint_ok
            {
                state.registry.unassign(&name)?;
                state.session_map.remove(session);
                state.warm.push_back(name);
                return Ok(());
            }
            state.session_map.remove(session);
            name
        };
        self.destroy_container(&name).await;
        Ok(())
    }

    /// Stop, remove, and forget one container. Runtime errors are logged,
    /// not surfaced; the reaper paths need destruction to be best-effort.
    pub async fn destroy_container(&self, name: &str) {
        log::info!("destroying container {name}");
        if let Err(e) = self.runtime.stop(name, STOP_GRACE).await {
            log::debug!("stop {name}: {e}");
        }
        if let Err(e) = self.runtime.remove(name, true).await {
            log::debug!("remove {name}: {e}");
        }
        let mut state = self.state.lock().await;
        if let Err(e) = state.registry.remove_by_name(name) {
            log::warn!("registry removal for {name} failed: {e}");
        }
        state.warm.retain(|n| n != name);
        state.session_map.retain(|_, mapped| mapped != name);
    }

    fn spawn_top_up(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.top_up_warm().await {
                log::warn!("warm pool top-up failed: {e}");
            }
        });
    }

    /// Create containers until the warm floor is met or the total cap is
    /// reached. One at a time: each reservation is re-computed under the
    /// lock so concurrent demand sees true totals. A creation failure ends
    /// the pass; the next tick retries.
    pub async fn top_up_warm(self: &Arc<Self>) -> Result<()> {
        loop {
            let reservation = {
                let mut state = self.state.lock().await;
                // Reservations still provisioning count toward the floor,
                // or two overlapping top-ups would overshoot it.
                let pending = state
                    .registry
                    .list()
                    .iter()
                    .filter(|r| {
                        r.session_key.is_none() && r.status == ContainerStatus::Creating
                    })
                    .count();
                let need = self
                    .config
                    .pool
                    .min_warm
                    .saturating_sub(state.warm.len() + pending);
                let headroom = self
                    .config
                    .pool
                    .max_total
                    .saturating_sub(state.registry.len());
                if need == 0 || headroom == 0 {
                    None
                } else {
                    let key = synthetic_warm_key();
                    let name =
                        derive_container_name(&self.config.docker.container_prefix, &key);
                    let record = ContainerRecord::new(
                        String::new(),
                        name.clone(),
                        key.clone(),
                        self.fingerprint.clone(),
                    );
                    state.registry.upsert(record)?;
                    Some((name, key))
                }
            };
            let Some((name, key)) = reservation else {
                return Ok(());
            };

            match self.provision(&name, &key, None, None, None, None).await {
                Ok(id) => {
                    let mut state = self.state.lock().await;
                    if let Some(mut record) = state.registry.get_by_name(&name).cloned() {
                        record.id = id;
                        record.status = ContainerStatus::Idle;
                        state.registry.upsert(record)?;
                        state.warm.push_back(name);
                    }
                }
                Err(e) => {
                    log::warn!("warm container {name} failed to come up: {e}");
                    let _ = self.runtime.remove(&name, true).await;
                    let mut state = self.state.lock().await;
                    if let Err(persist_err) = state.registry.remove_by_name(&name) {
                        log::warn!("failed to drop warm reservation {name}: {persist_err}");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Health tick: refresh registry heartbeats from the broker, then reap
    /// containers whose heartbeat is older than six health intervals.
    /// Still-running stale containers are marked failed and unmapped; gone
    /// ones are destroyed. Errors never escape a tick.
    pub async fn health_tick(&self) {
        self.sync_heartbeats().await;

        let threshold = self.config.health_interval() * 6;
        let stale: Vec<String> = {
            let state = self.state.lock().await;
            state
                .registry
                .list_stale(threshold)
                .into_iter()
                .map(|r| r.name.clone())
                .collect()
        };

        for name in stale {
            // Inspect failures count as not running: conservative destroy.
            let runtime_state = self
                .runtime
                .inspect_state(&name)
                .await
                .unwrap_or(ContainerState {
                    exists: false,
                    running: false,
                });
            if runtime_state.running {
                log::warn!("container {name} is running but its heartbeat is stale; marking failed");
                let mut state = self.state.lock().await;
                if let Err(e) = state.registry.set_status(&name, ContainerStatus::Failed) {
                    log::warn!("failed to mark {name} failed: {e}");
                    continue;
                }
                state.session_map.retain(|_, mapped| mapped != &name);
                state.warm.retain(|n| n != &name);
            } else {
                log::warn!("container {name} is stale and gone from the runtime; destroying");
                self.destroy_container(&name).await;
            }
        }
    }

    /// Mirror wrapper heartbeats from the broker state records into the
    /// registry, so an actively heartbeating container is never judged
    /// stale by registry age alone.
    async fn sync_heartbeats(&self) {
        let Some(broker) = &self.broker else {
            return;
        };
        let targets: Vec<(String, String)> = {
            let state = self.state.lock().await;
            state
                .registry
                .list()
                .into_iter()
                .filter(|r| {
                    matches!(r.status, ContainerStatus::Idle | ContainerStatus::Running)
                })
                .map(|r| {
                    let session = r
                        .session_key
                        .clone()
                        .unwrap_or_else(|| r.boot_session.clone());
                    (r.name.clone(), session)
                })
                .collect()
        };

        for (name, session) in targets {
            match broker.get_state(&session).await {
                Ok(Some(remote)) => {
                    let mut state = self.state.lock().await;
                    if let Err(e) = state.registry.touch_heartbeat(
                        &name,
                        remote.claude_session_id.as_deref(),
                        Some(remote.turn_count),
                    ) {
                        log::warn!("heartbeat sync for {name} failed: {e}");
                        continue;
                    }
                    let mirrored = match remote.status.as_str() {
                        "running" => Some(ContainerStatus::Running),
                        "idle" => Some(ContainerStatus::Idle),
                        _ => None,
                    };
                    if let Some(status) = mirrored {
                        let differs = state
                            .registry
                            .get_by_name(&name)
                            .map(|r| r.status != status)
                            .unwrap_or(false);
                        if differs {
                            if let Err(e) = state.registry.set_status(&name, status) {
                                log::warn!("status mirror for {name} failed: {e}");
                            }
                        }
                    }
                }
                Ok(None) => {} // no state record; staleness will catch it
                Err(e) => log::debug!("state read for {session} failed: {e}"),
            }
        }
    }

    /// Maintenance tick: cull idle containers beyond the warm floor, cull
    /// everything past max age, then top the warm pool back up.
    pub async fn maintenance_tick(self: &Arc<Self>) {
        let mut to_destroy: Vec<String> = Vec::new();
        {
            let mut state = self.state.lock().await;

            let mut idle: Vec<ContainerRecord> = state
                .registry
                .list_idle_exceeding(self.config.idle_timeout())
                .into_iter()
                .cloned()
                .collect();
            idle.sort_by_key(|r| r.last_heartbeat);

            let keep = self.config.pool.min_warm.saturating_sub(state.warm.len());
            for (i, record) in idle.iter().enumerate() {
                if i < keep {
                    if record.session_key.is_some() {
                        match state.registry.unassign(&record.name) {
                            Ok(()) => {
                                state
                                    .session_map
                                    .retain(|_, mapped| mapped != &record.name);
                                state.warm.push_back(record.name.clone());
                            }
                            Err(e) => log::warn!("unassign {} failed: {e}", record.name),
                        }
                    } else if !state.warm.contains(&record.name) {
                        state.warm.push_back(record.name.clone());
                    }
                } else {
                    to_destroy.push(record.name.clone());
                }
            }

            for record in state.registry.list_older_than(self.config.max_age()) {
                to_destroy.push(record.name.clone());
            }
        }

        to_destroy.sort_unstable();
        to_destroy.dedup();
        for name in to_destroy {
            self.destroy_container(&name).await;
        }

        if let Err(e) = self.top_up_warm().await {
            log::warn!("warm pool top-up failed: {e}");
        }
    }

    /// Cancel the recurring ticks but leave containers as they are.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self
            .tickers
            .lock()
            .expect("ticker mutex poisoned")
            .drain(..)
        {
            handle.abort();
        }
    }

    /// Stop the ticks and destroy every tracked container, best-effort.
    pub async fn shutdown(&self) {
        self.stop();
        let names: Vec<String> = {
            let state = self.state.lock().await;
            state
                .registry
                .list()
                .into_iter()
                .map(|r| r.name.clone())
                .collect()
        };
        log::info!("shutting down pool, destroying {} containers", names.len());
        for name in names {
            self.destroy_container(&name).await;
        }
    }

    pub async fn counts(&self) -> PoolCounts {
        let state = self.state.lock().await;
        PoolCounts {
            total: state.registry.len(),
            active: state.session_map.len(),
            warm: state.warm.len(),
        }
    }

    /// Name of the container currently serving `session`, if any.
    pub async fn session_container(&self, session: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.session_map.get(session).cloned()
    }

    /// All registry records, for status surfaces.
    pub async fn records(&self) -> Vec<ContainerRecord> {
        let state = self.state.lock().await;
        state.registry.list().into_iter().cloned().collect()
    }

    /// Names currently in the warm set, for invariant checks.
    pub async fn warm_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.warm.iter().cloned().collect()
    }
}

/// Synthetic session key for a warm-only container: unique, never issued
/// to callers.
fn synthetic_warm_key() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("warm-{}-{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_warm_keys_are_unique() {
        let a = synthetic_warm_key();
        let b = synthetic_warm_key();
        assert!(a.starts_with("warm-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_synthetic_warm_key_shape() {
        let key = synthetic_warm_key();
        let parts: Vec<&str> = key.splitn(3, '-').collect();
        assert_eq!(parts[0], "warm");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 6);
    }
}
