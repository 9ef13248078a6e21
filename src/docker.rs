//! Thin contract over the container runtime.
//!
//! [`ContainerRuntime`] is the seam the pool manager schedules through;
//! [`DockerCli`] implements it by shelling out to the `docker` binary. No
//! pool state lives here; the adapter only translates operations into
//! subprocess invocations and parses their output.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::config::{Config, MANAGED_LABEL};

/// Workspace mount point inside every container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Derive a legal container name from an opaque session key.
///
/// Lowercases, collapses runs of non-alphanumerics into single dashes,
/// strips leading/trailing dashes, truncates to 32 characters, and appends
/// an 8-hex fingerprint of the original key so near-equal keys still get
/// distinct names.
pub fn derive_container_name(prefix: &str, session_key: &str) -> String {
    let mut base = String::new();
    let mut last_dash = false;
    for ch in session_key.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            base.push(ch);
            last_dash = false;
        } else if !last_dash {
            base.push('-');
            last_dash = true;
        }
    }
    let base: String = base.trim_matches('-').chars().take(32).collect();
    let base = base.trim_matches('-');

    let fingerprint = &sha256_hex(session_key.as_bytes())[..8];
    if base.is_empty() {
        format!("{prefix}{fingerprint}")
    } else {
        format!("{prefix}{base}-{fingerprint}")
    }
}

/// Stable hash of the configuration fields that shape a container. A
/// running container whose fingerprint differs from the live value is
/// drifted and never reused.
pub fn config_fingerprint(config: &Config) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.image.as_bytes());
    hasher.update(config.resources.memory.as_bytes());
    hasher.update(config.resources.cpus.to_string().as_bytes());
    hasher.update(config.resources.pids_limit.to_string().as_bytes());
    hasher.update(config.docker.network.as_bytes());
    for cap in &config.docker.cap_drop {
        hasher.update(cap.as_bytes());
    }
    for opt in &config.docker.security_opts {
        hasher.update(opt.as_bytes());
    }
    for bind in &config.docker.binds {
        hasher.update(bind.as_bytes());
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(6)
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Everything `create` needs, assembled host-side.
#[derive(Clone, Debug)]
pub struct CreateArgs {
    pub name: String,
    pub image: String,
    pub labels: Vec<(String, String)>,
    pub memory: String,
    pub cpus: f64,
    pub pids_limit: u32,
    pub network: String,
    pub cap_drop: Vec<String>,
    pub security_opts: Vec<String>,
    /// `host:container[:mode]` bind specs, workspace first.
    pub binds: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CreateArgs {
    /// Build creation arguments for a session container: identity labels,
    /// resource caps, the workspace bind, and the environment contract the
    /// in-container wrapper reads.
    pub fn for_session(
        config: &Config,
        name: &str,
        session_key: &str,
        agent_id: Option<&str>,
        workspace: &Path,
        model: Option<&str>,
        agent_config: Option<&Value>,
        parent_session: Option<&str>,
        fingerprint: &str,
    ) -> Self {
        let mut labels = vec![
            (MANAGED_LABEL.to_string(), "1".to_string()),
            ("sandpool.session".to_string(), session_key.to_string()),
            (
                "sandpool.created-at".to_string(),
                chrono::Utc::now().timestamp_millis().to_string(),
            ),
            ("sandpool.fingerprint".to_string(), fingerprint.to_string()),
        ];
        if let Some(agent) = agent_id {
            labels.push(("sandpool.agent".to_string(), agent.to_string()));
        }

        let mut env = vec![
            ("SESSION_ID".to_string(), session_key.to_string()),
            (
                "REDIS_URL".to_string(),
                config
                    .redis
                    .url
                    .clone()
                    .unwrap_or_else(|| "redis://redis:6379".to_string()),
            ),
            (
                "WORKSPACE_PATH".to_string(),
                CONTAINER_WORKSPACE.to_string(),
            ),
        ];
        if let Some(url) = &config.gateway_url {
            env.push(("GATEWAY_URL".to_string(), url.clone()));
        }
        if let Some(token) = &config.gateway_token {
            env.push(("GATEWAY_TOKEN".to_string(), token.clone()));
        }
        if let Some(parent) = parent_session {
            env.push(("PARENT_SESSION_ID".to_string(), parent.to_string()));
        }
        if let Some(model) = model {
            env.push(("CLAUDE_MODEL".to_string(), model.to_string()));
        }
        // The wrapper learns its key namespace (and any agent tuning)
        // through the config blob.
        let mut blob = match agent_config {
            Some(Value::Object(map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        blob.insert(
            "key_prefix".to_string(),
            Value::String(config.redis.key_prefix.clone()),
        );
        env.push((
            "CLAUDE_CONFIG".to_string(),
            Value::Object(blob).to_string(),
        ));
        for (k, v) in &config.docker.env {
            env.push((k.clone(), v.clone()));
        }

        let mut binds = vec![format!(
            "{}:{}",
            workspace.display(),
            CONTAINER_WORKSPACE
        )];
        binds.extend(config.docker.binds.iter().cloned());

        Self {
            name: name.to_string(),
            image: config.image.clone(),
            labels,
            memory: config.resources.memory.clone(),
            cpus: config.resources.cpus,
            pids_limit: config.resources.pids_limit,
            network: config.docker.network.clone(),
            cap_drop: config.docker.cap_drop.clone(),
            security_opts: config.docker.security_opts.clone(),
            binds,
            env,
        }
    }

    /// Render as `docker create` arguments.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--memory".to_string(),
            self.memory.clone(),
            "--cpus".to_string(),
            self.cpus.to_string(),
            "--pids-limit".to_string(),
            self.pids_limit.to_string(),
            "--network".to_string(),
            self.network.clone(),
        ];
        for (k, v) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{k}={v}"));
        }
        for cap in &self.cap_drop {
            args.push("--cap-drop".to_string());
            args.push(cap.clone());
        }
        for opt in &self.security_opts {
            args.push("--security-opt".to_string());
            args.push(opt.clone());
        }
        for bind in &self.binds {
            args.push("-v".to_string());
            args.push(bind.clone());
        }
        for (k, v) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(self.image.clone());
        args
    }
}

/// Runtime view of one container's existence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContainerState {
    pub exists: bool,
    pub running: bool,
}

/// One row from a label-filtered `list`.
#[derive(Clone, Debug)]
pub struct ListedContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
}

/// Output of an in-container exec.
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Narrow interface over the container runtime. The pool manager only
/// talks to this trait, which is what lets tests drive it with a scripted
/// fake.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn available(&self) -> bool;
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Pull the image when it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<()>;
    /// Create a container; returns the runtime id.
    async fn create(&self, args: &CreateArgs) -> Result<String>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;
    async fn remove(&self, name: &str, force: bool) -> Result<()>;
    async fn inspect_state(&self, name: &str) -> Result<ContainerState>;
    async fn inspect_labels(&self, name: &str) -> Result<HashMap<String, String>>;
    /// All containers carrying `label` (as `key=value`), running or not.
    async fn list(&self, label: &str) -> Result<Vec<ListedContainer>>;
    async fn exec(&self, name: &str, argv: &[String], timeout: Duration) -> Result<ExecOutput>;
    async fn logs(&self, name: &str, tail: Option<u32>, since: Option<&str>) -> Result<String>;
}

/// `docker` CLI implementation of the runtime contract.
#[derive(Clone, Debug)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a docker subcommand, returning trimmed stdout on success.
    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn {} {}", self.binary, args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} {} failed ({}): {}",
                self.binary,
                args.first().copied().unwrap_or(""),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn available(&self) -> bool {
        self.run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .is_ok()
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = Command::new(&self.binary)
            .args(["image", "inspect", image])
            .output()
            .await
            .context("spawn docker image inspect")?;
        Ok(output.status.success())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        log::info!("pulling image {image}");
        self.run(&["pull", image]).await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if !self.image_exists(image).await? {
            self.pull_image(image).await?;
        }
        Ok(())
    }

    async fn create(&self, args: &CreateArgs) -> Result<String> {
        let cli_args = args.to_cli_args();
        let refs: Vec<&str> = cli_args.iter().map(String::as_str).collect();
        let id = self.run(&refs).await?;
        if id.is_empty() {
            bail!("docker create returned no container id for {}", args.name);
        }
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().max(1).to_string();
        self.run(&["stop", "--time", &secs, name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        if force {
            self.run(&["rm", "--force", name]).await?;
        } else {
            self.run(&["rm", name]).await?;
        }
        Ok(())
    }

    async fn inspect_state(&self, name: &str) -> Result<ContainerState> {
        match self
            .run(&["inspect", "--format", "{{.State.Running}}", name])
            .await
        {
            Ok(out) => Ok(ContainerState {
                exists: true,
                running: out == "true",
            }),
            // Docker reports a missing container as an inspect error; the
            // distinction from a daemon failure does not matter here.
            Err(_) => Ok(ContainerState {
                exists: false,
                running: false,
            }),
        }
    }

    async fn inspect_labels(&self, name: &str) -> Result<HashMap<String, String>> {
        let out = self
            .run(&["inspect", "--format", "{{json .Config.Labels}}", name])
            .await?;
        let labels: HashMap<String, String> =
            serde_json::from_str(&out).context("parse container labels")?;
        Ok(labels)
    }

    async fn list(&self, label: &str) -> Result<Vec<ListedContainer>> {
        let filter = format!("label={label}");
        let out = self
            .run(&[
                "ps",
                "--all",
                "--filter",
                &filter,
                "--format",
                "{{.ID}}\t{{.Names}}\t{{.State}}",
            ])
            .await?;

        let mut containers = Vec::new();
        for line in out.lines() {
            let mut parts = line.split('\t');
            let (Some(id), Some(name), Some(state)) =
                (parts.next(), parts.next(), parts.next())
            else {
                log::warn!("unparseable docker ps line: {line}");
                continue;
            };
            containers.push(ListedContainer {
                id: id.to_string(),
                name: name.to_string(),
                running: state == "running",
            });
        }
        Ok(containers)
    }

    async fn exec(&self, name: &str, argv: &[String], timeout: Duration) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec").arg(name).args(argv);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("exec in {name} timed out after {}s", timeout.as_secs()))?
            .with_context(|| format!("spawn docker exec in {name}"))?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn logs(&self, name: &str, tail: Option<u32>, since: Option<&str>) -> Result<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(n) = tail {
            args.push("--tail".to_string());
            args.push(n.to_string());
        }
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.to_string());
        }
        args.push(name.to_string());

        // `docker logs` interleaves the container's stdout and stderr; both
        // matter for diagnostics.
        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("spawn docker logs for {name}"))?;
        if !output.status.success() {
            bail!(
                "docker logs for {name} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_derivation_is_deterministic() {
        let a = derive_container_name("sandpool-cc-", "user/Repo#42");
        let b = derive_container_name("sandpool-cc-", "user/Repo#42");
        assert_eq!(a, b);
        assert!(a.starts_with("sandpool-cc-user-repo-42-"));
    }

    #[test]
    fn test_near_equal_keys_collide_on_prefix_not_suffix() {
        let a = derive_container_name("p-", "session one");
        let b = derive_container_name("p-", "session.one");
        // Same sanitized base, distinct fingerprints.
        let (base_a, fp_a) = a.rsplit_once('-').unwrap();
        let (base_b, fp_b) = b.rsplit_once('-').unwrap();
        assert_eq!(base_a, base_b);
        assert_ne!(fp_a, fp_b);
        assert_eq!(fp_a.len(), 8);
    }

    #[test]
    fn test_name_truncates_long_keys() {
        let long_key = "a".repeat(200);
        let name = derive_container_name("p-", &long_key);
        // prefix + 32-char base + dash + 8-hex fingerprint
        assert_eq!(name.len(), 2 + 32 + 1 + 8);
    }

    #[test]
    fn test_name_from_symbol_only_key() {
        let name = derive_container_name("p-", "///###");
        assert!(name.starts_with("p-"));
        assert_eq!(name.len(), 2 + 8);
        // Legal container name: alphanumeric after prefix.
        assert!(name[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_name_collapses_symbol_runs() {
        let name = derive_container_name("p-", "a//--..b");
        assert!(name.starts_with("p-a-b-"), "got {name}");
    }

    #[test]
    fn test_fingerprint_tracks_config_drift() {
        let config = Config::default();
        let base = config_fingerprint(&config);
        assert_eq!(base, config_fingerprint(&config));

        let mut drifted = config.clone();
        drifted.image = "other:tag".to_string();
        assert_ne!(base, config_fingerprint(&drifted));

        let mut drifted = config.clone();
        drifted.resources.memory = "8g".to_string();
        assert_ne!(base, config_fingerprint(&drifted));
    }

    #[test]
    fn test_create_args_carry_the_env_contract() {
        let mut config = Config::default();
        config.gateway_url = Some("http://host:8811".to_string());
        let args = CreateArgs::for_session(
            &config,
            "sandpool-cc-s1-abcd1234",
            "s1",
            Some("agent-a"),
            Path::new("/tmp/ws"),
            Some("claude-sonnet"),
            Some(&serde_json::json!({"max_turns": 5})),
            None,
            "fp123",
        );

        let env: HashMap<&str, &str> = args
            .env
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        assert_eq!(env["SESSION_ID"], "s1");
        assert_eq!(env["REDIS_URL"], "redis://redis:6379");
        assert_eq!(env["WORKSPACE_PATH"], CONTAINER_WORKSPACE);
        assert_eq!(env["GATEWAY_URL"], "http://host:8811");
        assert_eq!(env["CLAUDE_MODEL"], "claude-sonnet");

        let blob: Value = serde_json::from_str(env["CLAUDE_CONFIG"]).unwrap();
        assert_eq!(blob["key_prefix"], "sandpool:cc:");
        assert_eq!(blob["max_turns"], 5);

        assert_eq!(args.binds[0], "/tmp/ws:/workspace");
    }

    #[test]
    fn test_create_args_render_labels_and_caps() {
        let config = Config::default();
        let fp = config_fingerprint(&config);
        let args = CreateArgs::for_session(
            &config,
            "name",
            "s1",
            None,
            Path::new("/w"),
            None,
            None,
            None,
            &fp,
        );
        let cli = args.to_cli_args();

        assert_eq!(cli[0], "create");
        assert!(cli.contains(&format!("{MANAGED_LABEL}=1")));
        assert!(cli.contains(&format!("sandpool.fingerprint={fp}")));
        assert!(cli.contains(&"--pids-limit".to_string()));
        assert!(cli.contains(&"--cap-drop".to_string()));
        // Image is the positional tail.
        assert_eq!(cli.last().unwrap(), &config.image);
        // No agent label when no agent id was given.
        assert!(!cli.iter().any(|a| a.starts_with("sandpool.agent=")));
    }
}
