//! Session-scoped communication over the redis broker.
//!
//! Every session owns seven namespaced keys: an input queue, an output
//! pub-sub channel plus a bounded replay buffer, a state hash, a result
//! value, a control channel, and a persisted interrupt queue. The host and
//! the in-container wrapper both speak through this client; neither side
//! keeps state here beyond live subscriptions.
//!
//! Two connections are used: a command connection (auto-reconnecting
//! manager) and one dedicated connection per subscription, since a
//! subscribed redis connection cannot issue commands.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::stream::{classify, AgentMessage, ResultRecord};

/// Replay buffer bound: late subscribers can recover this many records.
pub const OUTPUT_BUFFER_MAX: isize = 1000;
/// Replay buffer and result TTL.
pub const OUTPUT_TTL_SECS: u64 = 3600;
/// State hash TTL; refreshed by every wrapper heartbeat.
pub const STATE_TTL_SECS: i64 = 60;
/// How often `wait_for_result` re-polls.
const RESULT_POLL: Duration = Duration::from_millis(500);

/// Connection retry schedule: exponential, capped at a few seconds.
const CONNECT_RETRIES: u32 = 5;
const CONNECT_BASE_DELAY: Duration = Duration::from_millis(200);
const CONNECT_MAX_DELAY: Duration = Duration::from_secs(3);

/// The seven broker keys belonging to one session.
#[derive(Clone, Debug)]
pub struct SessionKeys {
    base: String,
}

impl SessionKeys {
    pub fn new(prefix: &str, session: &str) -> Self {
        Self {
            base: format!("{prefix}{session}"),
        }
    }

    pub fn input(&self) -> String {
        format!("{}:input", self.base)
    }

    pub fn output(&self) -> String {
        format!("{}:output", self.base)
    }

    pub fn output_buffer(&self) -> String {
        format!("{}:output_buffer", self.base)
    }

    pub fn state(&self) -> String {
        format!("{}:state", self.base)
    }

    pub fn result(&self) -> String {
        format!("{}:result", self.base)
    }

    pub fn control(&self) -> String {
        format!("{}:control", self.base)
    }

    pub fn interrupt_queue(&self) -> String {
        format!("{}:interrupt_queue", self.base)
    }

    /// Every key, for session teardown.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.input(),
            self.output(),
            self.output_buffer(),
            self.state(),
            self.result(),
            self.control(),
            self.interrupt_queue(),
        ]
    }
}

/// One prompt-execution input pushed onto a session's queue.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct InputRecord {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
}

/// Priority of a redirect interrupt.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

/// Out-of-band commands to a session's wrapper.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Interrupt {
    /// Graceful shutdown of the current turn and the wrapper.
    Stop,
    /// Inject a message at the head of the input queue.
    Redirect {
        message: String,
        #[serde(default)]
        priority: Priority,
    },
    /// Suspend the agent process.
    Pause,
    /// Resume a paused agent process.
    Resume,
    /// Host-internal: re-home a warm wrapper onto the session it was just
    /// assigned to. Never sent by callers; delivered on the wrapper's boot
    /// channel at warm assignment.
    Adopt { session: String },
}

/// Decoded view of a session's state hash.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct SessionState {
    pub status: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub claude_session_id: Option<String>,
    pub turn_count: u32,
}

impl SessionState {
    /// Parse the raw hash; `None` when the hash is absent or expired.
    pub fn from_hash(map: HashMap<String, String>) -> Option<Self> {
        if map.is_empty() {
            return None;
        }
        Some(Self {
            status: map.get("status").cloned().unwrap_or_default(),
            last_heartbeat: map
                .get("last_heartbeat")
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            claude_session_id: map.get("claude_session_id").cloned(),
            turn_count: map
                .get("turn_count")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
        })
    }

    pub fn heartbeat_age(&self) -> Option<Duration> {
        self.last_heartbeat.map(|t| {
            Utc::now()
                .signed_duration_since(t)
                .to_std()
                .unwrap_or_default()
        })
    }

    /// True once the wrapper has reported it will produce no more results.
    pub fn is_terminal(&self) -> bool {
        self.status == "stopped" || self.status == "failed"
    }
}

/// Fields a state update writes. `last_heartbeat` is always stamped.
#[derive(Clone, Debug, Default)]
pub struct StateUpdate {
    pub status: Option<String>,
    pub claude_session_id: Option<String>,
    pub turn_count: Option<u32>,
}

impl StateUpdate {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Default::default()
        }
    }
}

/// Callback invoked per output record, in emission order.
pub type OutputCallback = Arc<dyn Fn(AgentMessage) + Send + Sync>;

/// Live subscription handle; dropping it (or calling `unsubscribe`) stops
/// delivery. Required on every exit path of a request.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        self.task.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Session-scoped broker client.
#[derive(Clone)]
pub struct BrokerClient {
    client: redis::Client,
    manager: ConnectionManager,
    prefix: String,
}

impl std::fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerClient")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Connect with bounded exponential back-off.
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("parse redis url")?;
        let manager = connect_with_backoff(&client).await?;
        Ok(Self {
            client,
            manager,
            prefix: prefix.to_string(),
        })
    }

    pub fn keys(&self, session: &str) -> SessionKeys {
        SessionKeys::new(&self.prefix, session)
    }

    /// Round-trip latency to the broker.
    pub async fn ping(&self) -> Result<Duration> {
        let mut con = self.manager.clone();
        let started = Instant::now();
        let pong: String = redis::cmd("PING")
            .query_async(&mut con)
            .await
            .context("broker ping")?;
        if pong != "PONG" {
            anyhow::bail!("unexpected ping reply: {pong}");
        }
        Ok(started.elapsed())
    }

    /// Queue one input record for the session's wrapper.
    pub async fn send_input(&self, session: &str, input: &InputRecord) -> Result<()> {
        let mut con = self.manager.clone();
        let payload = serde_json::to_string(input)?;
        let _: () = con
            .rpush(self.keys(session).input(), payload)
            .await
            .context("push input")?;
        Ok(())
    }

    /// Inject an input at the head of the queue (redirect delivery).
    pub async fn push_input_front(&self, session: &str, input: &InputRecord) -> Result<()> {
        let mut con = self.manager.clone();
        let payload = serde_json::to_string(input)?;
        let _: () = con
            .lpush(self.keys(session).input(), payload)
            .await
            .context("push input front")?;
        Ok(())
    }

    /// Deliver an interrupt: published for a live subscriber and queued for
    /// a wrapper that is not currently listening (at-least-once).
    pub async fn send_interrupt(&self, session: &str, interrupt: &Interrupt) -> Result<()> {
        let keys = self.keys(session);
        let payload = serde_json::to_string(interrupt)?;
        let mut con = self.manager.clone();
        let _: () = con
            .publish(keys.control(), payload.clone())
            .await
            .context("publish interrupt")?;
        let _: () = con
            .rpush(keys.interrupt_queue(), payload)
            .await
            .context("queue interrupt")?;
        Ok(())
    }

    /// Subscribe to a session's output channel. Records are classified and
    /// handed to `callback` in emission order until the returned handle is
    /// dropped.
    pub async fn subscribe_output(
        &self,
        session: &str,
        callback: OutputCallback,
    ) -> Result<Subscription> {
        let channel = self.keys(session).output();
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("open subscription connection")?;
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("subscribe {channel}"))?;

        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("undecodable output payload: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<Value>(&payload).ok().and_then(classify) {
                    Some(message) => callback(message),
                    None => log::debug!("ignoring unclassifiable output record"),
                }
            }
        });

        Ok(Subscription { task })
    }

    /// Subscribe to a session's control channel; interrupts arrive on the
    /// returned receiver. Unknown payloads are logged and dropped.
    pub async fn subscribe_control(
        &self,
        session: &str,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Interrupt>)> {
        let channel = self.keys(session).control();
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("open control connection")?;
        pubsub
            .subscribe(&channel)
            .await
            .with_context(|| format!("subscribe {channel}"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("undecodable control payload: {e}");
                        continue;
                    }
                };
                match serde_json::from_str::<Interrupt>(&payload) {
                    Ok(interrupt) => {
                        if tx.send(interrupt).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("ignoring unknown interrupt {payload:?}: {e}"),
                }
            }
        });

        Ok((Subscription { task }, rx))
    }

    /// Replay buffer contents, oldest first.
    pub async fn get_buffered_output(&self, session: &str) -> Result<Vec<AgentMessage>> {
        let mut con = self.manager.clone();
        let raw: Vec<String> = con
            .lrange(self.keys(session).output_buffer(), 0, -1)
            .await
            .context("read output buffer")?;
        Ok(raw
            .iter()
            .filter_map(|s| serde_json::from_str::<Value>(s).ok())
            .filter_map(classify)
            .collect())
    }

    pub async fn get_state(&self, session: &str) -> Result<Option<SessionState>> {
        let mut con = self.manager.clone();
        let map: HashMap<String, String> = con
            .hgetall(self.keys(session).state())
            .await
            .context("read session state")?;
        Ok(SessionState::from_hash(map))
    }

    pub async fn get_result(&self, session: &str) -> Result<Option<ResultRecord>> {
        let mut con = self.manager.clone();
        let raw: Option<String> = con
            .get(self.keys(session).result())
            .await
            .context("read session result")?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let value: Value = serde_json::from_str(&raw).context("parse session result")?;
        match classify(value) {
            Some(AgentMessage::Result(record)) => Ok(Some(record)),
            _ => {
                log::warn!("result key for {session} holds a non-result record");
                Ok(None)
            }
        }
    }

    /// Poll for the terminal result until it appears, the wrapper reports a
    /// terminal status, or `timeout` elapses. `None` on timeout.
    pub async fn wait_for_result(
        &self,
        session: &str,
        timeout: Duration,
    ) -> Result<Option<ResultRecord>> {
        let deadline = Instant::now() + timeout;
        let started = Utc::now();
        loop {
            if let Some(result) = self.get_result(session).await? {
                return Ok(Some(result));
            }
            if let Some(state) = self.get_state(session).await? {
                // A leftover terminal state from before this wait (a prior
                // wrapper inside the 60s TTL) does not end it.
                let stamped_during_wait = state
                    .last_heartbeat
                    .map(|t| t >= started)
                    .unwrap_or(false);
                if state.is_terminal() && stamped_during_wait {
                    log::debug!("session {session} reached terminal state without a result");
                    return Ok(None);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(RESULT_POLL.min(deadline - now)).await;
        }
    }

    /// Field-wise state update; stamps `last_heartbeat` and refreshes the
    /// hash TTL.
    pub async fn update_state(&self, session: &str, update: &StateUpdate) -> Result<()> {
        let key = self.keys(session).state();
        let mut fields: Vec<(String, String)> =
            vec![("last_heartbeat".to_string(), Utc::now().to_rfc3339())];
        if let Some(status) = &update.status {
            fields.push(("status".to_string(), status.clone()));
        }
        if let Some(id) = &update.claude_session_id {
            fields.push(("claude_session_id".to_string(), id.clone()));
        }
        if let Some(n) = update.turn_count {
            fields.push(("turn_count".to_string(), n.to_string()));
        }

        let mut con = self.manager.clone();
        let _: () = con
            .hset_multiple(&key, &fields)
            .await
            .context("write session state")?;
        let _: () = con
            .expire(&key, STATE_TTL_SECS)
            .await
            .context("refresh state ttl")?;
        Ok(())
    }

    /// Publish one output record and append it to the replay buffer.
    pub async fn publish_output(&self, session: &str, payload: &Value) -> Result<()> {
        let keys = self.keys(session);
        let raw = payload.to_string();
        let mut con = self.manager.clone();
        let _: () = con
            .publish(keys.output(), raw.clone())
            .await
            .context("publish output")?;
        let buffer = keys.output_buffer();
        let _: () = con.rpush(&buffer, raw).await.context("buffer output")?;
        let _: () = con
            .ltrim(&buffer, -OUTPUT_BUFFER_MAX, -1)
            .await
            .context("trim output buffer")?;
        let _: () = con
            .expire(&buffer, OUTPUT_TTL_SECS as i64)
            .await
            .context("refresh buffer ttl")?;
        Ok(())
    }

    /// Remove a stale terminal result so a new turn's wait cannot be
    /// satisfied by the previous turn.
    pub async fn clear_result(&self, session: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .del(self.keys(session).result())
            .await
            .context("clear stale result")?;
        Ok(())
    }

    /// Store the terminal result for waiters that arrive after completion.
    pub async fn set_result(&self, session: &str, payload: &Value) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .set_ex(
                self.keys(session).result(),
                payload.to_string(),
                OUTPUT_TTL_SECS,
            )
            .await
            .context("write session result")?;
        Ok(())
    }

    /// Blocking input pop on a dedicated connection; `None` on timeout.
    ///
    /// Uses its own connection because a blocking pop would stall every
    /// other command multiplexed on the manager.
    pub async fn pop_input(
        &self,
        con: &mut MultiplexedConnection,
        session: &str,
        timeout: Duration,
    ) -> Result<Option<InputRecord>> {
        let popped: Option<(String, String)> = con
            .blpop(self.keys(session).input(), timeout.as_secs_f64())
            .await
            .context("blocking input pop")?;
        match popped {
            Some((_, raw)) => {
                Ok(Some(serde_json::from_str(&raw).context("parse input record")?))
            }
            None => Ok(None),
        }
    }

    /// A dedicated connection for blocking pops.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self
            .client
            .get_multiplexed_async_connection()
            .await
            .context("open blocking connection")?)
    }

    /// Drop one queued copy of an interrupt that was already delivered on
    /// the control channel, so a later drain does not replay it.
    pub async fn ack_interrupt(&self, session: &str, interrupt: &Interrupt) -> Result<()> {
        let payload = serde_json::to_string(interrupt)?;
        let mut con = self.manager.clone();
        let _: () = con
            .lrem(self.keys(session).interrupt_queue(), 1, payload)
            .await
            .context("ack interrupt")?;
        Ok(())
    }

    /// Drain interrupts queued while no subscriber was listening.
    pub async fn drain_interrupts(&self, session: &str) -> Result<Vec<Interrupt>> {
        let key = self.keys(session).interrupt_queue();
        let mut con = self.manager.clone();
        let mut drained = Vec::new();
        loop {
            let raw: Option<String> = con.lpop(&key, None).await.context("drain interrupts")?;
            let Some(raw) = raw else {
                break;
            };
            match serde_json::from_str::<Interrupt>(&raw) {
                Ok(interrupt) => drained.push(interrupt),
                Err(e) => log::warn!("dropping unknown queued interrupt {raw:?}: {e}"),
            }
        }
        Ok(drained)
    }

    /// Delete every key belonging to the session.
    pub async fn clear_session(&self, session: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: () = con
            .del(self.keys(session).all())
            .await
            .context("clear session keys")?;
        Ok(())
    }
}

async fn connect_with_backoff(client: &redis::Client) -> Result<ConnectionManager> {
    let mut delay = CONNECT_BASE_DELAY;
    let mut last_err = None;
    for attempt in 1..=CONNECT_RETRIES {
        match client.get_connection_manager().await {
            Ok(manager) => return Ok(manager),
            Err(e) => {
                log::warn!(
                    "broker connect attempt {attempt}/{CONNECT_RETRIES} failed: {e}, retrying in {}ms",
                    delay.as_millis()
                );
                last_err = Some(e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_MAX_DELAY);
            }
        }
    }
    Err(anyhow::Error::from(last_err.expect("at least one attempt"))
        .context("broker unreachable after retries"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_keys_are_namespaced() {
        let keys = SessionKeys::new("sandpool:cc:", "s1");
        assert_eq!(keys.input(), "sandpool:cc:s1:input");
        assert_eq!(keys.output(), "sandpool:cc:s1:output");
        assert_eq!(keys.output_buffer(), "sandpool:cc:s1:output_buffer");
        assert_eq!(keys.state(), "sandpool:cc:s1:state");
        assert_eq!(keys.result(), "sandpool:cc:s1:result");
        assert_eq!(keys.control(), "sandpool:cc:s1:control");
        assert_eq!(keys.interrupt_queue(), "sandpool:cc:s1:interrupt_queue");
        assert_eq!(keys.all().len(), 7);
    }

    #[test]
    fn test_interrupt_wire_format() {
        let stop = serde_json::to_value(&Interrupt::Stop).unwrap();
        assert_eq!(stop, serde_json::json!({"type": "stop"}));

        let redirect = serde_json::to_value(&Interrupt::Redirect {
            message: "look at tests".to_string(),
            priority: Priority::High,
        })
        .unwrap();
        assert_eq!(
            redirect,
            serde_json::json!({"type": "redirect", "message": "look at tests", "priority": "high"})
        );

        // Priority defaults to normal when omitted.
        let parsed: Interrupt =
            serde_json::from_str(r#"{"type": "redirect", "message": "m"}"#).unwrap();
        assert_eq!(
            parsed,
            Interrupt::Redirect {
                message: "m".to_string(),
                priority: Priority::Normal
            }
        );
    }

    #[test]
    fn test_unknown_interrupt_fails_decode() {
        assert!(serde_json::from_str::<Interrupt>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn test_adopt_wire_format() {
        let adopt: Interrupt =
            serde_json::from_str(r#"{"type": "adopt", "session": "s9"}"#).unwrap();
        assert_eq!(
            adopt,
            Interrupt::Adopt {
                session: "s9".to_string()
            }
        );
    }

    #[test]
    fn test_session_state_from_hash() {
        let mut map = HashMap::new();
        map.insert("status".to_string(), "running".to_string());
        map.insert(
            "last_heartbeat".to_string(),
            Utc::now().to_rfc3339(),
        );
        map.insert("turn_count".to_string(), "4".to_string());

        let state = SessionState::from_hash(map).unwrap();
        assert_eq!(state.status, "running");
        assert_eq!(state.turn_count, 4);
        assert!(state.heartbeat_age().unwrap() < Duration::from_secs(5));
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_empty_hash_is_no_state() {
        assert!(SessionState::from_hash(HashMap::new()).is_none());
    }

    #[test]
    fn test_terminal_states() {
        for (status, terminal) in [
            ("idle", false),
            ("running", false),
            ("stopped", true),
            ("failed", true),
        ] {
            let state = SessionState {
                status: status.to_string(),
                ..Default::default()
            };
            assert_eq!(state.is_terminal(), terminal, "status {status}");
        }
    }

    #[test]
    fn test_input_record_wire_format_omits_empty_fields() {
        let input = InputRecord {
            prompt: "hi".to_string(),
            ..Default::default()
        };
        let json = serde_json::to_string(&input).unwrap();
        assert!(!json.contains("attachments"));
        assert!(!json.contains("model"));

        let parsed: InputRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, input);
    }
}
