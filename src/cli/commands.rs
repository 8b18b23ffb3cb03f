//! CLI command definitions for forge-queue.
//!
//! Offline tooling around persistent queues: push raw tasks into a redis or
//! disk queue, and inspect or compact a disk queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;

use crate::queue::{
    handler_fn, BackendConfig, DiskStore, PendingTask, Queue, QueueConfig, QueueSettings,
};

/// Command line tooling for forge-queue queues.
#[derive(Parser)]
#[command(name = "forge-queue")]
#[command(about = "Inspect and feed persistent forge-queue queues")]
#[command(version)]
#[command(
    long_about = "forge-queue operates on the persistent state of queues.\n\nExample usage:\n  forge-queue push --config queues.yaml --queue push_update '[{\"repo_name\":\"forge\"}]'\n  forge-queue inspect --data-dir ./queues --name push_update"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Push a raw JSON task into a redis or disk queue.
    Push(PushArgs),

    /// List pending records and in-flight identities of a disk queue.
    Inspect(InspectArgs),

    /// Rewrite a disk queue's log keeping only pending records.
    Compact(StoreArgs),
}

/// Arguments for `forge-queue push`.
#[derive(Parser, Debug)]
pub struct PushArgs {
    /// Settings file (YAML). Environment overrides apply on top.
    #[arg(short, long, env = "FORGE_QUEUE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Queue name.
    #[arg(short, long)]
    pub queue: String,

    /// Task payload as JSON.
    pub task: String,
}

/// Arguments locating a disk queue.
#[derive(Parser, Debug)]
pub struct StoreArgs {
    /// Data directory holding one directory per queue.
    #[arg(short, long)]
    pub data_dir: PathBuf,

    /// Queue name.
    #[arg(short, long)]
    pub name: String,
}

/// Arguments for `forge-queue inspect`.
#[derive(Parser, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Print JSON instead of a summary.
    #[arg(long)]
    pub json: bool,
}

/// Parse CLI arguments without executing any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Push(args) => run_push_command(args).await,
        Commands::Inspect(args) => run_inspect_command(args).await,
        Commands::Compact(args) => run_compact_command(args).await,
    }
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<QueueSettings> {
    let settings = match path {
        Some(path) => QueueSettings::from_yaml_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => QueueSettings::new(),
    };
    Ok(settings.apply_env()?)
}

fn resolve_config(path: Option<&Path>, queue: &str) -> anyhow::Result<QueueConfig> {
    let settings = load_settings(path)?;
    Ok(settings.config_for(queue)?)
}

async fn run_push_command(args: PushArgs) -> anyhow::Result<()> {
    let config = resolve_config(args.config.as_deref(), &args.queue)?;
    if matches!(config.backend, BackendConfig::Memory) {
        anyhow::bail!(
            "Queue '{}' uses the memory backend; only redis and disk queues can be fed offline",
            config.name
        );
    }

    let task: serde_json::Value =
        serde_json::from_str(&args.task).context("Task is not valid JSON")?;

    // The queue is never started, so the handler never runs.
    let handler = Arc::new(handler_fn(|tasks: Vec<serde_json::Value>| async move {
        tasks
    }));
    let queue = Queue::new(config, handler).await?;
    queue.push(task).await?;
    queue.terminate().await;

    info!(queue = %args.queue, backend = queue.config().backend.kind(), "Task pushed");
    println!("Pushed 1 task to '{}'", args.queue);
    Ok(())
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    queue: String,
    dir: PathBuf,
    pending: Vec<PendingTask>,
    identities: Vec<String>,
}

async fn run_inspect_command(args: InspectArgs) -> anyhow::Result<()> {
    let store = open_store(&args.store).await?;
    let output = InspectOutput {
        queue: args.store.name.clone(),
        dir: store.dir().to_path_buf(),
        pending: store.pending().await?,
        identities: store.identities().await,
    };
    store.close().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n=== Queue {} ===", output.queue);
    println!("Directory:  {}", output.dir.display());
    println!("Pending:    {}", output.pending.len());
    println!("Identities: {}", output.identities.len());
    for record in &output.pending {
        println!(
            "  #{:<8} {:<24} {}",
            record.seq,
            record.identity.as_deref().unwrap_or("-"),
            record.task
        );
    }
    Ok(())
}

async fn run_compact_command(args: StoreArgs) -> anyhow::Result<()> {
    let store = open_store(&args).await?;
    let stats = store.compact().await?;
    store.close().await?;

    println!(
        "Compacted '{}': {} -> {} bytes, {} pending",
        args.name, stats.bytes_before, stats.bytes_after, stats.pending
    );
    Ok(())
}

async fn open_store(args: &StoreArgs) -> anyhow::Result<DiskStore> {
    let dir = args.data_dir.join(&args.name);
    if !dir.is_dir() {
        anyhow::bail!("No disk queue at {}", dir.display());
    }
    DiskStore::open(&dir, false)
        .await
        .with_context(|| format!("Failed to open disk queue at {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_push_command() {
        let cli = Cli::try_parse_from([
            "forge-queue",
            "push",
            "--queue",
            "push_update",
            "{\"repo\":1}",
        ])
        .unwrap();
        match cli.command {
            Commands::Push(args) => {
                assert_eq!(args.queue, "push_update");
                assert_eq!(args.task, "{\"repo\":1}");
            }
            _ => panic!("expected push"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_inspect_command() {
        let cli = Cli::try_parse_from([
            "forge-queue",
            "inspect",
            "--data-dir",
            "/var/lib/queues",
            "--name",
            "mirror",
            "--json",
            "--log-level",
            "debug",
        ])
        .unwrap();
        match cli.command {
            Commands::Inspect(args) => {
                assert_eq!(args.store.name, "mirror");
                assert!(args.json);
            }
            _ => panic!("expected inspect"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[tokio::test]
    async fn test_push_then_compact_disk_queue() {
        let dir = TempDir::new().unwrap();
        let settings = dir.path().join("queues.yaml");
        std::fs::write(
            &settings,
            format!(
                "default:\n  backend:\n    type: disk\n    data_dir: {}\n",
                dir.path().join("data").display()
            ),
        )
        .unwrap();

        run_push_command(PushArgs {
            config: Some(settings.clone()),
            queue: "offline".to_string(),
            task: "{\"n\":1}".to_string(),
        })
        .await
        .unwrap();

        let store_args = StoreArgs {
            data_dir: dir.path().join("data"),
            name: "offline".to_string(),
        };
        let store = open_store(&store_args).await.unwrap();
        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task["task"], serde_json::json!({"n": 1}));
        store.close().await.unwrap();
        drop(store);

        run_compact_command(store_args).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_rejects_memory_queue() {
        let result = run_push_command(PushArgs {
            config: None,
            queue: "volatile".to_string(),
            task: "{}".to_string(),
        })
        .await;
        assert!(result.is_err());
    }
}
