//! Request orchestration: one prompt in, one terminal result out.
//!
//! The runner resolves a container through the pool, subscribes to the
//! session's output before pushing the input (so no early record is lost),
//! waits for the terminal result, and translates it into a public
//! [`RunResult`]. A process-wide shared instance is available through
//! [`shared`] for hosts that want a single runner; lifetime-managed use
//! constructs [`Runner`] directly.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::broker::{
    BrokerClient, InputRecord, Interrupt, OutputCallback, SessionState,
};
use crate::config::Config;
use crate::docker::{ContainerRuntime, DockerCli};
use crate::health::HealthMonitor;
use crate::pool::PoolManager;
use crate::stream::{ResultRecord, TokenUsage};

/// Default request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Callback invoked with the translated result before `run` returns.
pub type ResultCallback = Arc<dyn Fn(&RunResult) + Send + Sync>;

/// One prompt-execution request.
#[derive(Clone, Default)]
pub struct RunRequest {
    /// Opaque caller-supplied session key.
    pub session_key: String,
    /// Agent instance this session belongs to, for per-agent caps.
    pub agent_id: Option<String>,
    pub prompt: String,
    pub attachments: Vec<Value>,
    /// Host path to mount as the container workspace (cold creates only).
    pub workspace: Option<PathBuf>,
    /// Extra system prompt passed through to the agent.
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    /// Overall deadline; defaults to ten minutes.
    pub timeout: Option<Duration>,
    /// Invoked per streamed output record, in emission order.
    pub on_output: Option<OutputCallback>,
    /// Invoked once with the translated result.
    pub on_result: Option<ResultCallback>,
}

impl std::fmt::Debug for RunRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunRequest")
            .field("session_key", &self.session_key)
            .field("agent_id", &self.agent_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Public outcome of a request. A timeout yields a null result with
/// zero-filled usage and exit code 0.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct RunResult {
    pub result: Option<String>,
    pub usage: TokenUsage,
    pub duration_ms: u64,
    /// 0 on success or timeout; 1 when the terminal record reported an
    /// error subtype.
    pub exit_code: i32,
    /// Resumable agent-session id, when the wrapper reported one.
    pub claude_session_id: Option<String>,
}

fn translate_result(record: Option<ResultRecord>) -> RunResult {
    match record {
        Some(record) => RunResult {
            exit_code: i32::from(record.is_error()),
            result: record.result,
            usage: record.usage,
            duration_ms: record.duration_ms.unwrap_or(0),
            claude_session_id: record.session_id,
        },
        None => RunResult {
            result: None,
            usage: TokenUsage::default(),
            duration_ms: 0,
            exit_code: 0,
            claude_session_id: None,
        },
    }
}

/// Orchestrates requests end-to-end. Owns the pool manager and the broker
/// client; tear-down cascades to both.
pub struct Runner {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    pool: Arc<PoolManager>,
    broker: BrokerClient,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Connect the broker, bring the pool up, and return a ready runner.
    pub async fn init(config: Config) -> Result<Arc<Self>> {
        if !config.enabled {
            bail!("container pool is disabled in configuration");
        }
        let broker = BrokerClient::connect(config.redis_url(), &config.redis.key_prefix)
            .await
            .context("connect broker")?;
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::default());
        let pool = Arc::new(PoolManager::new(
            config.clone(),
            Arc::clone(&runtime),
            Some(broker.clone()),
            PoolManager::default_registry_path(),
        )?);
        pool.start().await.context("start pool")?;

        Ok(Arc::new(Self {
            config,
            runtime,
            pool,
            broker,
        }))
    }

    /// Execute one request end-to-end.
    pub async fn run(&self, request: RunRequest) -> Result<RunResult> {
        let session = request.session_key.clone();

        let assignment = self
            .pool
            .get_container(
                &session,
                request.agent_id.as_deref(),
                request.workspace.as_deref(),
                request.model.as_deref(),
                None,
            )
            .await?;
        log::debug!(
            "session {session} -> container {} (reused: {})",
            assignment.name,
            assignment.reused
        );

        // Subscribe before sending: within one session, output records
        // arrive in emission order, and none precede the subscription. The
        // handle aborts its delivery task on drop, which covers every exit
        // path below, early errors included.
        let subscription = match &request.on_output {
            Some(callback) => Some(
                self.broker
                    .subscribe_output(&session, Arc::clone(callback))
                    .await?,
            ),
            None => None,
        };

        // A result from an earlier turn may still sit under its 1h TTL;
        // clear it so this turn's wait cannot resolve against it.
        self.broker.clear_result(&session).await?;

        let input = InputRecord {
            prompt: request.prompt.clone(),
            attachments: request.attachments.clone(),
            system_prompt: request.system_prompt.clone(),
            model: request.model.clone(),
            queued_at: Some(Utc::now()),
        };
        self.broker.send_input(&session, &input).await?;

        let timeout = request.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let record = self.broker.wait_for_result(&session, timeout).await?;
        if record.is_none() {
            log::warn!(
                "session {session} produced no result within {}ms",
                timeout.as_millis()
            );
        }

        let mut result = translate_result(record);
        if result.claude_session_id.is_none() {
            if let Ok(Some(state)) = self.broker.get_state(&session).await {
                result.claude_session_id = state.claude_session_id;
            }
        }

        if let Some(callback) = &request.on_result {
            callback(&result);
        }
        drop(subscription);
        Ok(result)
    }

    /// Interrupt the session's current turn and release its container back
    /// toward the warm pool.
    pub async fn stop(&self, session: &str) -> Result<()> {
        self.broker.send_interrupt(session, &Interrupt::Stop).await?;
        self.pool.release_container(session, true).await
    }

    /// The wrapper-reported state record for a session.
    pub async fn get_status(&self, session: &str) -> Result<Option<SessionState>> {
        self.broker.get_state(session).await
    }

    pub async fn send_interrupt(&self, session: &str, interrupt: &Interrupt) -> Result<()> {
        self.broker.send_interrupt(session, interrupt).await
    }

    /// Release a session's container explicitly.
    pub async fn release(&self, session: &str, return_to_pool: bool) -> Result<()> {
        self.pool.release_container(session, return_to_pool).await
    }

    /// Runtime log tail for the container serving `session`.
    pub async fn container_logs(&self, session: &str, tail: u32) -> Result<String> {
        let Some(name) = self.pool.session_container(session).await else {
            bail!("no container mapped for session {session}");
        };
        self.runtime.logs(&name, Some(tail), None).await
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.runtime),
            self.broker.clone(),
            Arc::clone(&self.pool),
        )
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Cascade tear-down: ticks cancelled, containers destroyed.
    pub async fn teardown(&self) {
        self.pool.shutdown().await;
    }
}

static SHARED: StdMutex<Option<Arc<Runner>>> = StdMutex::new(None);

/// The process-wide runner, constructed lazily from the loaded
/// configuration on first use.
pub async fn shared() -> Result<Arc<Runner>> {
    if let Some(runner) = SHARED.lock().expect("runner lock poisoned").clone() {
        return Ok(runner);
    }
    let config = Config::load()?;
    let runner = Runner::init(config).await?;
    let mut guard = SHARED.lock().expect("runner lock poisoned");
    if let Some(existing) = guard.clone() {
        // Lost an init race; keep the winner and retire ours.
        drop(guard);
        runner.teardown().await;
        return Ok(existing);
    }
    *guard = Some(Arc::clone(&runner));
    Ok(runner)
}

/// Tear down the shared runner, if one was initialized.
pub async fn teardown_shared() {
    let runner = SHARED.lock().expect("runner lock poisoned").take();
    if let Some(runner) = runner {
        runner.teardown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ResultSubtype;

    #[test]
    fn test_translate_success() {
        let record = ResultRecord {
            subtype: ResultSubtype::Success,
            result: Some("hello".to_string()),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 1,
            },
            duration_ms: Some(42),
            session_id: Some("abc".to_string()),
            payload: serde_json::json!({}),
        };
        let result = translate_result(Some(record));
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.result.as_deref(), Some("hello"));
        assert_eq!(result.usage.input_tokens, 3);
        assert_eq!(result.duration_ms, 42);
        assert_eq!(result.claude_session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_translate_error_subtype_is_exit_one() {
        let record = ResultRecord {
            subtype: ResultSubtype::Error,
            result: None,
            usage: TokenUsage::default(),
            duration_ms: None,
            session_id: None,
            payload: serde_json::json!({}),
        };
        let result = translate_result(Some(record));
        assert_eq!(result.exit_code, 1);
        assert!(result.result.is_none());
        assert_eq!(result.duration_ms, 0);
    }

    #[test]
    fn test_translate_timeout_is_null_with_zero_usage() {
        let result = translate_result(None);
        assert_eq!(
            result,
            RunResult {
                result: None,
                usage: TokenUsage::default(),
                duration_ms: 0,
                exit_code: 0,
                claude_session_id: None,
            }
        );
    }
}
