//! sandpool: pooled Docker sandboxes for long-running interactive agents.
//!
//! The host side schedules sessions onto a pool of warm containers
//! ([`pool::PoolManager`]), persists what it knows in a durable registry
//! ([`registry::Registry`]), and talks to each container's wrapper through
//! redis-backed session channels ([`broker::BrokerClient`]). The
//! [`runner::Runner`] façade ties one request together end-to-end; the
//! container side of the contract lives in [`wrapper`].

// Library modules
pub mod broker;
pub mod config;
pub mod docker;
pub mod error;
pub mod health;
pub mod pool;
pub mod registry;
pub mod runner;
pub mod stream;
pub mod wrapper;

// Re-export commonly used types
pub use broker::{BrokerClient, InputRecord, Interrupt, Priority, SessionState};
pub use config::Config;
pub use docker::{ContainerRuntime, DockerCli};
pub use error::PoolError;
pub use health::{HealthMonitor, HealthReport};
pub use pool::{ContainerAssignment, PoolCounts, PoolManager};
pub use registry::{ContainerRecord, ContainerStatus, Registry};
pub use runner::{RunRequest, RunResult, Runner};
pub use stream::{AgentMessage, ResultRecord, StreamParser, TokenUsage};
