//! # ScriptGuard — Scheduled Script Runner
//!
//! Runs Python (or any interpreter) scripts on cron schedules, keeps their
//! output, and alerts DingTalk / WeCom / webhooks when they fail.
//!
//! Usage:
//!   scriptguard serve                       # Scheduler + HTTP gateway
//!   scriptguard envs --refresh              # Rescan interpreters
//!   scriptguard tasks                       # List tasks
//!   scriptguard run <task-id>               # Run once, wait, print logs
//!   scriptguard config get [key]            # Show settings
//!   scriptguard config set <key> <value>    # Change a setting
//!   scriptguard test-notify dingtalk        # Send a test alert
//!   scriptguard cleanup                     # Apply retention, compact the DB

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scriptguard_core::config::ScriptGuardConfig;
use scriptguard_core::types::{ChannelKind, ExecutionStatus};
use scriptguard_scheduler::{LogQuery, ScriptGuard, SettingValue};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "scriptguard",
    version,
    about = "🛡️ ScriptGuard — scheduled scripts with history and failure alerts"
)]
struct Cli {
    /// Config file (defaults to $SCRIPTGUARD_CONFIG, then ~/.scriptguard/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the HTTP gateway until Ctrl-C
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List interpreter environments
    Envs {
        /// Rescan instead of using the cached list
        #[arg(long)]
        refresh: bool,
    },
    /// List tasks
    Tasks,
    /// Run a task now and wait for it to finish
    Run { task_id: String },
    /// Read or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Send a test message to a notification channel
    TestNotify {
        /// dingtalk | wecom | webhook
        channel: String,
        /// Use this URL instead of the stored one
        #[arg(long)]
        url: Option<String>,
    },
    /// Delete history past the retention period and compact the database
    Cleanup,
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: Option<String> },
    Set { key: String, value: String },
}

fn load_config(cli: &Cli) -> Result<ScriptGuardConfig> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SCRIPTGUARD_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(ScriptGuardConfig::default_path);
    if path.exists() {
        ScriptGuardConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(ScriptGuardConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "scriptguard=debug,scriptguard_scheduler=debug,scriptguard_gateway=debug,tower_http=debug"
    } else {
        "scriptguard=info,scriptguard_scheduler=info,scriptguard_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let mut config = load_config(&cli)?;
    if !matches!(cli.command, Command::Serve { .. }) {
        config.scheduler.fire_schedules = false;
    }
    let sg = ScriptGuard::start(&config).await?;

    let outcome = match cli.command {
        Command::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            let sg = Arc::new(sg);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("❌ Failed to listen for Ctrl-C: {e}");
                }
            };
            let served = scriptguard_gateway::serve(&config.gateway, sg.clone(), shutdown).await;
            sg.shutdown().await;
            return served;
        }
        Command::Envs { refresh } => {
            let envs = sg.get_environments(refresh).await;
            if envs.is_empty() {
                println!("No environments found.");
            }
            for env in envs {
                let mark = if env.is_available() { "✅" } else { "❌" };
                println!("{mark} {:<20} {:<8} {}", env.id, format!("{:?}", env.kind).to_lowercase(), env.executable);
            }
            Ok(())
        }
        Command::Tasks => {
            let tasks = sg.get_tasks()?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for t in tasks {
                let state = if t.enabled { "on " } else { "off" };
                println!("[{state}] {}  {:<24} {:<16} {}", t.id, t.name, t.schedule, t.script_path);
            }
            Ok(())
        }
        Command::Run { task_id } => run_and_wait(&sg, &task_id).await,
        Command::Config { action } => match action {
            ConfigAction::Get { key: Some(key) } => {
                println!("{key} = {}", sg.get_config(&key)?);
                Ok(())
            }
            ConfigAction::Get { key: None } => {
                for (key, value) in sg.get_all_config()? {
                    println!("{key} = {value}");
                }
                Ok(())
            }
            ConfigAction::Set { key, value } => {
                let stored = sg.update_config(&key, SettingValue::Str(value))?;
                println!("✅ {key} = {stored}");
                Ok(())
            }
        },
        Command::TestNotify { channel, url } => {
            let channel: ChannelKind = channel.parse()?;
            let result = sg.test_notification(channel, url.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_delivered() {
                Ok(())
            } else {
                Err(anyhow::anyhow!("{channel} did not accept the test message"))
            }
        }
        Command::Cleanup => {
            let report = sg.cleanup_database()?;
            println!(
                "🧹 Removed {} execution(s) and {} log line(s)",
                report.executions, report.logs
            );
            Ok(())
        }
    };

    sg.shutdown().await;
    outcome
}

async fn run_and_wait(sg: &ScriptGuard, task_id: &str) -> Result<()> {
    let ticket = sg.run_task(task_id).await?;
    let id = ticket.execution.id.clone();
    println!("🚀 Execution {id} queued");

    let exec = ticket.finished().await?;
    let mut logs = sg.get_logs(&LogQuery {
        execution_id: Some(id),
        ..Default::default()
    })?;
    logs.sort_by_key(|l| l.sequence);
    for log in logs {
        println!("[{}] {}", log.stream.as_str(), log.line);
    }

    println!(
        "{} {} (exit code {}, {} ms)",
        if exec.status == ExecutionStatus::Success { "✅" } else { "❌" },
        exec.status,
        exec.exit_code.map_or("-".to_string(), |c| c.to_string()),
        exec.duration_ms.unwrap_or_default(),
    );
    match exec.status {
        ExecutionStatus::Success => Ok(()),
        status => Err(anyhow::anyhow!(
            "execution ended {status}{}",
            exec.error_message.map(|m| format!(": {m}")).unwrap_or_default()
        )),
    }
}
