//! The in-container wrapper process.
//!
//! Runs as the container entrypoint (`sandpool wrapper`): heartbeats to
//! the session's state record every 10 seconds, blocks on the input
//! queue, spawns the agent per input, feeds its stdout through the stream
//! parser, and publishes every parsed record, terminal result included,
//! back through the broker. Interrupts arrive on the control channel and,
//! for wrappers that were not yet subscribed, through the persisted
//! interrupt queue drained at startup.

use anyhow::{bail, Context, Result};
use scopeguard::ScopeGuard;
use serde_json::json;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::sleep;

use crate::broker::{BrokerClient, InputRecord, Interrupt, Priority, StateUpdate};
use crate::stream::{AgentMessage, StreamParser};

/// Heartbeat cadence; the state record's TTL is six times this.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Blocking-pop timeout: short enough to notice control traffic and
/// shutdown promptly between inputs.
const INPUT_POLL: Duration = Duration::from_secs(1);

/// Configuration the wrapper reads from its environment.
#[derive(Clone, Debug)]
pub struct WrapperConfig {
    pub session: String,
    pub redis_url: String,
    pub workspace: String,
    pub model: Option<String>,
    pub key_prefix: String,
    /// Agent command line; the prompt and protocol flags are appended.
    pub agent_cmd: Vec<String>,
}

impl WrapperConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; the seam the tests use.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let Some(session) = lookup("SESSION_ID") else {
            bail!("SESSION_ID not set");
        };
        let redis_url =
            lookup("REDIS_URL").unwrap_or_else(|| "redis://redis:6379".to_string());
        let workspace = lookup("WORKSPACE_PATH").unwrap_or_else(|| "/workspace".to_string());
        let model = lookup("CLAUDE_MODEL");

        // Host-side tuning rides in the CLAUDE_CONFIG blob.
        let blob: serde_json::Value = lookup("CLAUDE_CONFIG")
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let key_prefix = blob
            .get("key_prefix")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("sandpool:cc:")
            .to_string();
        let agent_cmd: Vec<String> = blob
            .get("agent_cmd")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .filter(|cmd: &Vec<String>| !cmd.is_empty())
            .unwrap_or_else(|| vec!["claude".to_string()]);

        Ok(Self {
            session,
            redis_url,
            workspace,
            model,
            key_prefix,
            agent_cmd,
        })
    }
}

/// Mutable wrapper state shared with the heartbeat task.
#[derive(Clone, Debug)]
struct WrapperState {
    session: String,
    status: &'static str,
    claude_session_id: Option<String>,
    turn_count: u32,
}

/// Assemble the agent invocation for one input.
fn build_agent_command(
    config: &WrapperConfig,
    input: &InputRecord,
    resume_session: Option<&str>,
) -> Vec<String> {
    let mut argv = config.agent_cmd.clone();
    argv.extend([
        "-p".to_string(),
        input.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]);
    if let Some(model) = input.model.as_deref().or(config.model.as_deref()) {
        argv.extend(["--model".to_string(), model.to_string()]);
    }
    if let Some(resume) = resume_session {
        argv.extend(["--resume".to_string(), resume.to_string()]);
    }
    if let Some(system_prompt) = &input.system_prompt {
        argv.extend([
            "--append-system-prompt".to_string(),
            system_prompt.clone(),
        ]);
    }
    argv
}

/// Turn a redirect interrupt into the input injected at the queue head.
fn redirect_record(message: &str, priority: Priority) -> InputRecord {
    let prompt = match priority {
        Priority::High => format!("[priority] {message}"),
        Priority::Normal => message.to_string(),
    };
    InputRecord {
        prompt,
        queued_at: Some(chrono::Utc::now()),
        ..Default::default()
    }
}

fn sigkill(pid: u32) {
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
}

/// Run the wrapper until a stop interrupt or a termination signal.
pub async fn run() -> Result<()> {
    let config = WrapperConfig::from_env()?;
    run_with_config(config).await
}

pub async fn run_with_config(config: WrapperConfig) -> Result<()> {
    log::info!(
        "wrapper starting for session {} (agent: {:?})",
        config.session,
        config.agent_cmd
    );
    let broker = BrokerClient::connect(&config.redis_url, &config.key_prefix)
        .await
        .context("connect broker from container")?;

    let state = Arc::new(StdMutex::new(WrapperState {
        session: config.session.clone(),
        status: "idle",
        claude_session_id: None,
        turn_count: 0,
    }));

    // Heartbeat task: refreshes the state record (and its TTL) every 10s.
    let heartbeat = {
        let broker = broker.clone();
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let snapshot = state.lock().expect("state lock poisoned").clone();
                let update = StateUpdate {
                    status: Some(snapshot.status.to_string()),
                    claude_session_id: snapshot.claude_session_id.clone(),
                    turn_count: Some(snapshot.turn_count),
                };
                if let Err(e) = broker.update_state(&snapshot.session, &update).await {
                    log::warn!("heartbeat failed: {e}");
                }
                sleep(HEARTBEAT_INTERVAL).await;
            }
        })
    };

    // Termination signals set a flag checked between awaits; the drain
    // path below still runs.
    let shutdown = Arc::new(AtomicBool::new(false));
    spawn_signal_watch(Arc::clone(&shutdown))?;

    let mut input_con = broker.blocking_connection().await?;
    let wrapper = Wrapper {
        config,
        broker: broker.clone(),
        state: Arc::clone(&state),
        shutdown: Arc::clone(&shutdown),
    };

    'sessions: loop {
        let session = state.lock().expect("state lock poisoned").session.clone();
        let (_control_sub, mut control) = broker.subscribe_control(&session).await?;

        // Absorb interrupts that arrived while no subscriber was listening
        // (host restarts, warm adoption before boot).
        let mut adopted = None;
        for interrupt in broker.drain_interrupts(&session).await? {
            match wrapper.handle_idle_interrupt(interrupt).await? {
                IdleOutcome::Continue => {}
                IdleOutcome::Stop => break 'sessions,
                IdleOutcome::Adopted(new_session) => {
                    adopted = Some(new_session);
                    break;
                }
            }
        }
        if adopted.is_some() {
            continue 'sessions;
        }

        // Input loop for the current session identity.
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break 'sessions;
            }
            let mut rehome = false;
            while let Ok(interrupt) = control.try_recv() {
                if let Err(e) = broker.ack_interrupt(&session, &interrupt).await {
                    log::debug!("interrupt ack failed: {e}");
                }
                match wrapper.handle_idle_interrupt(interrupt).await? {
                    IdleOutcome::Continue => {}
                    IdleOutcome::Stop => break 'sessions,
                    IdleOutcome::Adopted(_) => rehome = true,
                }
            }
            if rehome {
                continue 'sessions;
            }

            let popped = wrapper
                .broker
                .pop_input(&mut input_con, &session, INPUT_POLL)
                .await;
            match popped {
                Ok(Some(input)) => {
                    let deferred = wrapper.run_turn(&session, input, &mut control).await;
                    if shutdown.load(Ordering::SeqCst) {
                        break 'sessions;
                    }
                    // Interrupts that could not apply mid-turn (adopt) run
                    // now that the turn is over.
                    let mut rehome = false;
                    for interrupt in deferred {
                        match wrapper.handle_idle_interrupt(interrupt).await? {
                            IdleOutcome::Continue => {}
                            IdleOutcome::Stop => break 'sessions,
                            IdleOutcome::Adopted(_) => rehome = true,
                        }
                    }
                    if rehome {
                        continue 'sessions;
                    }
                }
                Ok(None) => {} // pop timeout; loop to re-check control
                Err(e) => {
                    log::warn!("input pop failed: {e}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    // Clean exit: mark the state terminal and let the TTLs retire the rest.
    let session = state.lock().expect("state lock poisoned").session.clone();
    if let Err(e) = broker
        .update_state(&session, &StateUpdate::status("stopped"))
        .await
    {
        log::warn!("final state write failed: {e}");
    }
    heartbeat.abort();
    log::info!("wrapper for session {session} exiting");
    Ok(())
}

fn spawn_signal_watch(shutdown: Arc<AtomicBool>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => log::info!("SIGTERM received"),
            _ = sigint.recv() => log::info!("SIGINT received"),
        }
        shutdown.store(true, Ordering::SeqCst);
    });
    Ok(())
}

enum IdleOutcome {
    Continue,
    Stop,
    Adopted(String),
}

struct Wrapper {
    config: WrapperConfig,
    broker: BrokerClient,
    state: Arc<StdMutex<WrapperState>>,
    shutdown: Arc<AtomicBool>,
}

impl Wrapper {
    fn current_session(&self) -> String {
        self.state.lock().expect("state lock poisoned").session.clone()
    }

    fn set_status(&self, status: &'static str) {
        self.state.lock().expect("state lock poisoned").status = status;
    }

    async fn push_state(&self) {
        let snapshot = self.state.lock().expect("state lock poisoned").clone();
        let update = StateUpdate {
            status: Some(snapshot.status.to_string()),
            claude_session_id: snapshot.claude_session_id.clone(),
            turn_count: Some(snapshot.turn_count),
        };
        if let Err(e) = self.broker.update_state(&snapshot.session, &update).await {
            log::warn!("state publish failed: {e}");
        }
    }

    /// Handle an interrupt that arrives while no turn is in flight.
    async fn handle_idle_interrupt(&self, interrupt: Interrupt) -> Result<IdleOutcome> {
        match interrupt {
            Interrupt::Stop => Ok(IdleOutcome::Stop),
            Interrupt::Redirect { message, priority } => {
                let session = self.current_session();
                self.broker
                    .push_input_front(&session, &redirect_record(&message, priority))
                    .await?;
                Ok(IdleOutcome::Continue)
            }
            Interrupt::Pause | Interrupt::Resume => {
                log::debug!("pause/resume with no agent in flight, ignoring");
                Ok(IdleOutcome::Continue)
            }
            Interrupt::Adopt { session: new_session } => {
                self.adopt(new_session.clone()).await?;
                Ok(IdleOutcome::Adopted(new_session))
            }
        }
    }

    /// Re-home onto the session this container was just assigned to: the
    /// old identity is marked stopped, all future traffic uses the new
    /// session's keys.
    async fn adopt(&self, new_session: String) -> Result<()> {
        let old = self.current_session();
        log::info!("adopting session {new_session} (was {old})");
        if let Err(e) = self
            .broker
            .update_state(&old, &StateUpdate::status("stopped"))
            .await
        {
            log::warn!("retiring old session state failed: {e}");
        }
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.session = new_session;
            state.status = "idle";
            state.turn_count = 0;
            state.claude_session_id = None;
        }
        self.push_state().await;
        Ok(())
    }

    /// Execute one input: spawn the agent, stream its records out, store
    /// the terminal result. Interrupts are serviced mid-turn; the ones
    /// that only make sense between turns (adopt) come back deferred.
    async fn run_turn(
        &self,
        session: &str,
        input: InputRecord,
        control: &mut UnboundedReceiver<Interrupt>,
    ) -> Vec<Interrupt> {
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.status = "running";
            state.turn_count += 1;
        }
        self.push_state().await;

        let mut deferred = Vec::new();
        if let Err(e) = self
            .stream_agent(session, &input, control, &mut deferred)
            .await
        {
            log::error!("turn failed: {e}");
            let payload = json!({
                "type": "result",
                "subtype": "error",
                "result": format!("agent execution failed: {e}"),
                "usage": {"input_tokens": 0, "output_tokens": 0},
            });
            let _ = self.broker.publish_output(session, &payload).await;
            let _ = self.broker.set_result(session, &payload).await;
        }

        self.set_status("idle");
        self.push_state().await;
        deferred
    }

    async fn stream_agent(
        &self,
        session: &str,
        input: &InputRecord,
        control: &mut UnboundedReceiver<Interrupt>,
        deferred: &mut Vec<Interrupt>,
    ) -> Result<()> {
        let resume = self
            .state
            .lock()
            .expect("state lock poisoned")
            .claude_session_id
            .clone();
        let argv = build_agent_command(&self.config, input, resume.as_deref());
        log::debug!("spawning agent: {argv:?}");

        let mut child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&self.config.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn agent {}", argv[0]))?;

        let pid = child.id();
        // The child must not outlive this turn, whatever path exits it.
        let kill_guard = scopeguard::guard(pid, |pid| {
            if let Some(pid) = pid {
                sigkill(pid);
            }
        });

        let mut stdout = child.stdout.take().context("agent stdout missing")?;
        let mut parser = StreamParser::new();
        let mut buf = [0u8; 4096];
        let mut saw_terminal = false;
        let mut stopped = false;

        loop {
            tokio::select! {
                read = stdout.read(&mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for message in parser.feed(&buf[..n]) {
                            saw_terminal |= self.publish_message(session, &message).await;
                        }
                    }
                    Err(e) => {
                        log::warn!("agent stdout read failed: {e}");
                        break;
                    }
                },
                Some(interrupt) = control.recv() => {
                    if let Err(e) = self.broker.ack_interrupt(session, &interrupt).await {
                        log::debug!("interrupt ack failed: {e}");
                    }
                    match interrupt {
                        Interrupt::Stop => {
                            log::info!("stop interrupt mid-turn, terminating agent");
                            if let Some(pid) = pid {
                                unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                            }
                            self.shutdown.store(true, Ordering::SeqCst);
                            stopped = true;
                            break;
                        }
                        Interrupt::Pause => {
                            if let Some(pid) = pid {
                                log::info!("pausing agent");
                                unsafe { libc::kill(pid as libc::pid_t, libc::SIGSTOP) };
                            }
                        }
                        Interrupt::Resume => {
                            if let Some(pid) = pid {
                                log::info!("resuming agent");
                                unsafe { libc::kill(pid as libc::pid_t, libc::SIGCONT) };
                            }
                        }
                        Interrupt::Redirect { message, priority } => {
                            self.broker
                                .push_input_front(session, &redirect_record(&message, priority))
                                .await?;
                        }
                        Interrupt::Adopt { session: new_session } => {
                            log::info!("adopt for {new_session} during a turn; deferring");
                            deferred.push(Interrupt::Adopt {
                                session: new_session,
                            });
                        }
                    }
                },
                () = sleep(Duration::from_millis(500)) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        if let Some(pid) = pid {
                            unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                        }
                        stopped = true;
                        break;
                    }
                }
            }
        }

        let status = child.wait().await.context("await agent exit")?;
        ScopeGuard::into_inner(kill_guard); // exited; nothing left to kill
        log::debug!("agent exited with {status}");

        if !saw_terminal && !stopped {
            // The agent died without a terminal record; synthesize one so
            // waiters resolve instead of timing out.
            let payload = json!({
                "type": "result",
                "subtype": "error",
                "result": format!("agent exited ({status}) without a result"),
                "usage": {"input_tokens": 0, "output_tokens": 0},
            });
            self.broker.publish_output(session, &payload).await?;
            self.broker.set_result(session, &payload).await?;
        }
        Ok(())
    }

    /// Publish one parsed record; returns true when it was terminal.
    async fn publish_message(&self, session: &str, message: &AgentMessage) -> bool {
        if let Err(e) = self.broker.publish_output(session, message.payload()).await {
            log::warn!("output publish failed: {e}");
        }
        if let AgentMessage::Result(record) = message {
            if let Some(id) = &record.session_id {
                self.state
                    .lock()
                    .expect("state lock poisoned")
                    .claude_session_id = Some(id.clone());
            }
            if let Err(e) = self.broker.set_result(session, &record.payload).await {
                log::warn!("result publish failed: {e}");
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_config_requires_session_id() {
        assert!(WrapperConfig::from_lookup(lookup(&[])).is_err());
    }

    #[test]
    fn test_config_defaults() {
        let config = WrapperConfig::from_lookup(lookup(&[("SESSION_ID", "s1")])).unwrap();
        assert_eq!(config.session, "s1");
        assert_eq!(config.redis_url, "redis://redis:6379");
        assert_eq!(config.workspace, "/workspace");
        assert_eq!(config.key_prefix, "sandpool:cc:");
        assert_eq!(config.agent_cmd, vec!["claude"]);
        assert!(config.model.is_none());
    }

    #[test]
    fn test_config_reads_blob() {
        let config = WrapperConfig::from_lookup(lookup(&[
            ("SESSION_ID", "s1"),
            ("REDIS_URL", "redis://broker:7000"),
            ("CLAUDE_MODEL", "claude-sonnet"),
            (
                "CLAUDE_CONFIG",
                r#"{"key_prefix": "app:cc:", "agent_cmd": ["npx", "agent"]}"#,
            ),
        ]))
        .unwrap();
        assert_eq!(config.redis_url, "redis://broker:7000");
        assert_eq!(config.key_prefix, "app:cc:");
        assert_eq!(config.agent_cmd, vec!["npx", "agent"]);
        assert_eq!(config.model.as_deref(), Some("claude-sonnet"));
    }

    #[test]
    fn test_agent_command_basic() {
        let config = WrapperConfig::from_lookup(lookup(&[("SESSION_ID", "s1")])).unwrap();
        let input = InputRecord {
            prompt: "hello".to_string(),
            ..Default::default()
        };
        let argv = build_agent_command(&config, &input, None);
        assert_eq!(argv[0], "claude");
        assert!(argv.contains(&"-p".to_string()));
        assert!(argv.contains(&"hello".to_string()));
        assert!(argv.contains(&"stream-json".to_string()));
        assert!(!argv.contains(&"--resume".to_string()));
    }

    #[test]
    fn test_agent_command_resume_and_model() {
        let config = WrapperConfig::from_lookup(lookup(&[
            ("SESSION_ID", "s1"),
            ("CLAUDE_MODEL", "claude-opus"),
        ]))
        .unwrap();
        let input = InputRecord {
            prompt: "again".to_string(),
            system_prompt: Some("be terse".to_string()),
            ..Default::default()
        };
        let argv = build_agent_command(&config, &input, Some("claude-sess-1"));

        let resume_at = argv.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(argv[resume_at + 1], "claude-sess-1");
        let model_at = argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(argv[model_at + 1], "claude-opus");
        assert!(argv.contains(&"--append-system-prompt".to_string()));
    }

    #[test]
    fn test_input_model_overrides_env_model() {
        let config = WrapperConfig::from_lookup(lookup(&[
            ("SESSION_ID", "s1"),
            ("CLAUDE_MODEL", "claude-opus"),
        ]))
        .unwrap();
        let input = InputRecord {
            prompt: "p".to_string(),
            model: Some("claude-haiku".to_string()),
            ..Default::default()
        };
        let argv = build_agent_command(&config, &input, None);
        let model_at = argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(argv[model_at + 1], "claude-haiku");
    }

    #[test]
    fn test_redirect_record_priority_prefix() {
        let high = redirect_record("check the tests", Priority::High);
        assert_eq!(high.prompt, "[priority] check the tests");

        let normal = redirect_record("minor note", Priority::Normal);
        assert_eq!(normal.prompt, "minor note");
    }
}
