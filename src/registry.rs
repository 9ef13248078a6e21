//! Durable registry of containers known to this host.
//!
//! Backed by a single versioned JSON document on local disk. All writers
//! live in one process (the pool manager serializes access), so each
//! mutation is a plain read-modify-write. A mutation that fails to persist
//! leaves the in-memory document untouched, which is what lets the pool
//! manager roll back cleanly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{collections::HashSet, fs};

/// Document schema version. Unknown versions load as an empty registry so
/// a downgrade never crashes the host.
const REGISTRY_VERSION: u32 = 1;

/// Lifecycle state of a managed container.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Starting,
    Idle,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Starting => "starting",
            ContainerStatus::Idle => "idle",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One container as the registry knows it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ContainerRecord {
    /// Runtime id, immutable post-creation.
    pub id: String,
    /// Container name, immutable post-creation; the registry key.
    pub name: String,
    /// Session key the container was created under, immutable. This is the
    /// broker identity its wrapper boots with; for warm containers it is
    /// the synthetic warm key.
    pub boot_session: String,
    /// Session this container serves; `None` means warm-pool member.
    pub session_key: Option<String>,
    /// Agent instance the session belongs to, set at assignment.
    pub agent_id: Option<String>,
    pub status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub turn_count: u32,
    /// Resumable agent-session id surfaced by the wrapper, if any.
    pub claude_session_id: Option<String>,
    /// Hash of image + resource limits + runtime options at creation time.
    /// A mismatch with the live configuration means the container is never
    /// reused.
    pub config_fingerprint: String,
}

impl ContainerRecord {
    pub fn new(id: String, name: String, boot_session: String, config_fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            boot_session,
            session_key: None,
            agent_id: None,
            status: ContainerStatus::Creating,
            created_at: now,
            last_heartbeat: now,
            turn_count: 0,
            claude_session_id: None,
            config_fingerprint,
        }
    }

    /// Warm-pool membership: unassigned and idle.
    pub fn is_warm(&self) -> bool {
        self.session_key.is_none() && self.status == ContainerStatus::Idle
    }

    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn heartbeat_age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.last_heartbeat)
            .to_std()
            .unwrap_or_default()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
struct RegistryDoc {
    version: u32,
    containers: HashMap<String, ContainerRecord>,
}

/// Single-writer store of container records, keyed by container name.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    doc: RegistryDoc,
}

impl Registry {
    /// Open the registry at `path`, loading any existing document.
    ///
    /// A missing file, a corrupt document, or an unknown version all yield
    /// an empty registry; reconciliation against the runtime rebuilds what
    /// can be rebuilt.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create registry dir {}", parent.display()))?;
        }
        let doc = Self::load_doc(&path);
        Ok(Self { path, doc })
    }

    fn load_doc(path: &Path) -> RegistryDoc {
        if !path.exists() {
            return RegistryDoc {
                version: REGISTRY_VERSION,
                ..Default::default()
            };
        }
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("registry unreadable, starting empty: {e}");
                return RegistryDoc {
                    version: REGISTRY_VERSION,
                    ..Default::default()
                };
            }
        };
        match serde_json::from_str::<RegistryDoc>(&content) {
            Ok(doc) if doc.version == REGISTRY_VERSION => doc,
            Ok(doc) => {
                log::warn!(
                    "registry version {} not understood (want {REGISTRY_VERSION}), starting empty",
                    doc.version
                );
                RegistryDoc {
                    version: REGISTRY_VERSION,
                    ..Default::default()
                }
            }
            Err(e) => {
                log::warn!("registry corrupt, starting empty: {e}");
                RegistryDoc {
                    version: REGISTRY_VERSION,
                    ..Default::default()
                }
            }
        }
    }

    fn persist(&self) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(&self.doc)?)
            .with_context(|| format!("write registry {}", self.path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Apply a mutation and persist it; on write failure the in-memory
    /// document is restored and the error surfaced.
    fn mutate<T>(&mut self, f: impl FnOnce(&mut RegistryDoc) -> T) -> Result<T> {
        let backup = self.doc.clone();
        let out = f(&mut self.doc);
        if let Err(e) = self.persist() {
            self.doc = backup;
            return Err(e);
        }
        Ok(out)
    }

    /// Insert or replace a record under its name.
    pub fn upsert(&mut self, record: ContainerRecord) -> Result<()> {
        self.mutate(|doc| {
            doc.containers.insert(record.name.clone(), record);
        })
    }

    pub fn remove_by_name(&mut self, name: &str) -> Result<Option<ContainerRecord>> {
        self.mutate(|doc| doc.containers.remove(name))
    }

    pub fn get_by_name(&self, name: &str) -> Option<&ContainerRecord> {
        self.doc.containers.get(name)
    }

    pub fn get_by_session(&self, session_key: &str) -> Option<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .find(|r| r.session_key.as_deref() == Some(session_key))
    }

    pub fn list(&self) -> Vec<&ContainerRecord> {
        self.doc.containers.values().collect()
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .filter(|r| r.agent_id.as_deref() == Some(agent_id))
            .collect()
    }

    pub fn list_warm(&self) -> Vec<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .filter(|r| r.is_warm())
            .collect()
    }

    /// Bind a container to a session, optionally tagging the agent id.
    pub fn assign_to_session(
        &mut self,
        name: &str,
        session_key: &str,
        agent_id: Option<&str>,
    ) -> Result<()> {
        let session_key = session_key.to_string();
        let agent_id = agent_id.map(str::to_string);
        self.mutate(|doc| {
            if let Some(r) = doc.containers.get_mut(name) {
                r.session_key = Some(session_key);
                r.agent_id = agent_id;
                r.last_heartbeat = Utc::now();
            }
        })
    }

    /// Return a container to the unassigned pool: clears the session,
    /// agent, resumable-session id and turn count, and sets idle.
    pub fn unassign(&mut self, name: &str) -> Result<()> {
        self.mutate(|doc| {
            if let Some(r) = doc.containers.get_mut(name) {
                r.session_key = None;
                r.agent_id = None;
                r.claude_session_id = None;
                r.turn_count = 0;
                r.status = ContainerStatus::Idle;
                r.last_heartbeat = Utc::now();
            }
        })
    }

    /// Refresh a container's heartbeat, carrying through any wrapper-
    /// reported resumable-session id and turn count.
    pub fn touch_heartbeat(
        &mut self,
        name: &str,
        claude_session_id: Option<&str>,
        turn_count: Option<u32>,
    ) -> Result<()> {
        let claude_session_id = claude_session_id.map(str::to_string);
        self.mutate(|doc| {
            if let Some(r) = doc.containers.get_mut(name) {
                r.last_heartbeat = Utc::now();
                if claude_session_id.is_some() {
                    r.claude_session_id = claude_session_id;
                }
                if let Some(n) = turn_count {
                    r.turn_count = n;
                }
            }
        })
    }

    /// Set a container's status; also bumps its heartbeat.
    pub fn set_status(&mut self, name: &str, status: ContainerStatus) -> Result<()> {
        self.mutate(|doc| {
            if let Some(r) = doc.containers.get_mut(name) {
                r.status = status;
                r.last_heartbeat = Utc::now();
            }
        })
    }

    /// Idle containers whose last heartbeat is older than `idle_for`.
    pub fn list_idle_exceeding(&self, idle_for: Duration) -> Vec<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .filter(|r| r.status == ContainerStatus::Idle && r.heartbeat_age() > idle_for)
            .collect()
    }

    /// Containers created more than `age` ago.
    pub fn list_older_than(&self, age: Duration) -> Vec<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .filter(|r| r.age() > age)
            .collect()
    }

    /// Containers that should be heartbeating (idle or running) whose
    /// heartbeat is older than `threshold`.
    pub fn list_stale(&self, threshold: Duration) -> Vec<&ContainerRecord> {
        self.doc
            .containers
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    ContainerStatus::Idle | ContainerStatus::Running
                ) && r.heartbeat_age() > threshold
            })
            .collect()
    }

    /// Drop every record whose name is not in `existing`; returns the
    /// removed names.
    pub fn reconcile(&mut self, existing: &HashSet<String>) -> Result<Vec<String>> {
        self.mutate(|doc| {
            let removed: Vec<String> = doc
                .containers
                .keys()
                .filter(|name| !existing.contains(*name))
                .cloned()
                .collect();
            for name in &removed {
                doc.containers.remove(name);
            }
            removed
        })
    }

    pub fn len(&self) -> usize {
        self.doc.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.containers.is_empty()
    }
}
