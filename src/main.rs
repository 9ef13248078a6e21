//! sandpool CLI - pooled Docker sandboxes for interactive agents.
//!
//! This is the binary entry point. `wrapper` is the in-container process;
//! the remaining subcommands drive the host-side pool. See the `sandpool`
//! library for the core functionality.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use sandpool::broker::Interrupt;
use sandpool::{runner, RunRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// mimalloc outperforms the system allocator under the multi-threaded
/// runtime this daemon runs on.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "sandpool", version, about = "Pooled Docker sandboxes for interactive agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one prompt through a pooled container, streaming output.
    Run {
        /// Session key; reuse a key to continue its agent context.
        #[arg(long)]
        session: String,
        /// The prompt to execute.
        #[arg(long)]
        prompt: String,
        /// Agent instance id, for per-agent capacity accounting.
        #[arg(long)]
        agent: Option<String>,
        /// Host workspace to mount (cold creates only).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Model identifier passed through to the agent.
        #[arg(long)]
        model: Option<String>,
        /// Request timeout in seconds.
        #[arg(long, default_value_t = 600)]
        timeout: u64,
        /// Release the container back to the pool after the result.
        #[arg(long)]
        release: bool,
    },
    /// The in-container wrapper process (container entrypoint).
    Wrapper,
    /// Print the composed health report as JSON.
    Health,
    /// List the containers this host manages.
    Ls {
        /// Also print a log tail for the named session's container.
        #[arg(long)]
        logs: Option<String>,
    },
    /// Send an interrupt to a session.
    Interrupt {
        #[arg(long)]
        session: String,
        /// One of: stop, pause, resume.
        #[arg(long)]
        kind: String,
        /// Redirect message (makes the kind a redirect).
        #[arg(long)]
        message: Option<String>,
    },
    /// Destroy every managed container and exit.
    Shutdown,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            session,
            prompt,
            agent,
            workspace,
            model,
            timeout,
            release,
        } => {
            let runner = runner::shared().await?;
            let request = RunRequest {
                session_key: session.clone(),
                agent_id: agent,
                prompt,
                workspace,
                model,
                timeout: Some(Duration::from_secs(timeout)),
                on_output: Some(Arc::new(|message| {
                    println!("{}", message.payload());
                })),
                ..Default::default()
            };
            let result = runner.run(request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if release {
                runner.release(&session, true).await?;
            }
            runner::teardown_shared().await;
            std::process::exit(result.exit_code);
        }

        Commands::Wrapper => {
            sandpool::wrapper::run().await?;
        }

        Commands::Health => {
            let runner = runner::shared().await?;
            let report = runner.health_monitor().check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.healthy {
                std::process::exit(1);
            }
        }

        Commands::Ls { logs } => {
            let runner = runner::shared().await?;
            for record in runner.pool().records().await {
                println!(
                    "{}\t{}\t{}\tturns={}\tsession={}",
                    record.name,
                    record.status,
                    record.id,
                    record.turn_count,
                    record.session_key.as_deref().unwrap_or("-"),
                );
            }
            if let Some(session) = logs {
                println!("--- logs for {session} ---");
                println!("{}", runner.container_logs(&session, 100).await?);
            }
        }

        Commands::Interrupt {
            session,
            kind,
            message,
        } => {
            let interrupt = match (kind.as_str(), message) {
                (_, Some(message)) => Interrupt::Redirect {
                    message,
                    priority: Default::default(),
                },
                ("stop", None) => Interrupt::Stop,
                ("pause", None) => Interrupt::Pause,
                ("resume", None) => Interrupt::Resume,
                (other, None) => anyhow::bail!("unknown interrupt kind: {other}"),
            };
            let runner = runner::shared().await?;
            runner.send_interrupt(&session, &interrupt).await?;
            println!("sent");
        }

        Commands::Shutdown => {
            let runner = runner::shared().await?;
            runner.teardown().await;
            println!("pool shut down");
        }
    }

    Ok(())
}
