use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use queuectl_core::{unix_now, DlqManager, Job, JobState, QueueError, Store, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(about = "Durable local job queue with competing workers, backed by SQLite")]
struct Cli {
    /// Path to the queue database
    #[arg(long, global = true, env = "QUEUECTL_DB", default_value = "jobs.sqlite")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema and seed default config
    Init,
    /// Job operations
    #[command(subcommand)]
    Queue(QueueCmd),
    /// Show job counts per state and active workers
    Status,
    /// Dead-letter queue operations
    #[command(subcommand)]
    Dlq(DlqCmd),
    /// Worker management
    #[command(subcommand)]
    Worker(WorkerCmd),
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCmd),
    /// Delete the database file (dev only)
    Dropdb {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum QueueCmd {
    /// Enqueue a shell command
    Add {
        command: String,
        /// Retryable failures before the job is dead-lettered
        #[arg(long)]
        max_retries: Option<i64>,
    },
    /// List jobs, newest first
    List {
        /// Filter by state (pending, running, completed, failed, dlq)
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: i64,
        /// Print one JSON object per row instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCmd {
    /// List dead-lettered jobs
    List {
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },
    /// Re-enqueue a dead-lettered job
    Retry { id: i64 },
}

#[derive(Subcommand, Debug)]
enum WorkerCmd {
    /// Run N workers in the foreground until stopped
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Signal all workers to exit after their current job
    Stop,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Init => {
            Store::open(&cli.db).await?;
            println!("Initialized queue database at {}", cli.db.display());
        }
        Command::Queue(QueueCmd::Add {
            command,
            max_retries,
        }) => {
            let store = Store::open(&cli.db).await?;
            let id = store.enqueue(&command, max_retries).await?;
            println!("Job {id} enqueued");
        }
        Command::Queue(QueueCmd::List { state, limit, json }) => {
            let store = Store::open(&cli.db).await?;
            let state = state.as_deref().map(JobState::from_str).transpose()?;
            let jobs = store.list(state, limit).await?;
            if json {
                for job in &jobs {
                    println!("{}", serde_json::to_string(job)?);
                }
            } else {
                print_job_table(&jobs);
            }
        }
        Command::Status => {
            let store = Store::open(&cli.db).await?;
            let counts = store.counts_by_state().await?;
            let workers = store.workers_count().await?;
            println!("Jobs by state:");
            for state in JobState::ALL {
                let count = counts.get(state.as_str()).copied().unwrap_or(0);
                println!("  {:<10} {}", state, count);
            }
            println!("Active workers: {workers}");
        }
        Command::Dlq(DlqCmd::List { limit }) => {
            let store = Store::open(&cli.db).await?;
            let dead = DlqManager::new(store).list(limit).await?;
            println!("{:<6} {:<48} command", "id", "error");
            for job in &dead {
                let error = job.last_error.as_deref().unwrap_or("-");
                println!(
                    "{:<6} {:<48} {}",
                    job.id,
                    single_line(error, 48),
                    job.command
                );
            }
        }
        Command::Dlq(DlqCmd::Retry { id }) => {
            let store = Store::open(&cli.db).await?;
            DlqManager::new(store).retry(id).await?;
            println!("Job {id} re-enqueued");
        }
        Command::Worker(WorkerCmd::Start { count }) => {
            if count == 0 {
                return Err(Box::new(QueueError::InvalidInput(
                    "worker count must be at least 1".to_string(),
                )));
            }
            let store = Store::open(&cli.db).await?;
            WorkerPool::new(store, count).run().await?;
        }
        Command::Worker(WorkerCmd::Stop) => {
            let store = Store::open(&cli.db).await?;
            store.request_stop().await?;
            println!("Stop flag set; workers exit after their current job");
        }
        Command::Config(ConfigCmd::Get { key }) => {
            let store = Store::open(&cli.db).await?;
            println!("{}", store.config_get(&key).await?.unwrap_or_default());
        }
        Command::Config(ConfigCmd::Set { key, value }) => {
            let store = Store::open(&cli.db).await?;
            store.config_set(&key, &value).await?;
            println!("Set {key} = {value}");
        }
        Command::Dropdb { yes } => {
            if !yes {
                return Err(Box::new(QueueError::InvalidInput(
                    "refusing to delete the database without --yes".to_string(),
                )));
            }
            drop_database(&cli.db)?;
            println!("Removed {}", cli.db.display());
        }
    }
    Ok(())
}

fn print_job_table(jobs: &[Job]) {
    let now = unix_now();
    println!(
        "{:<6} {:<10} {:<8} {:<10} command",
        "id", "state", "attempts", "next_run"
    );
    for job in jobs {
        println!(
            "{:<6} {:<10} {:<8} {:<10} {}",
            job.id,
            job.state,
            job.attempts,
            fmt_next_run(job, now),
            job.command
        );
    }
}

/// Human-friendly `next_run_at`: only meaningful for claimable states.
fn fmt_next_run(job: &Job, now: i64) -> String {
    match job.state {
        JobState::Pending | JobState::Failed if job.next_run_at > now => {
            format!("+{}s", job.next_run_at - now)
        }
        JobState::Pending | JobState::Failed => "now".to_string(),
        _ => "-".to_string(),
    }
}

fn single_line(s: &str, max: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max {
        flat
    } else {
        let truncated: String = flat.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    }
}

fn drop_database(db: &PathBuf) -> std::io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let mut path = db.clone().into_os_string();
        path.push(suffix);
        let path = PathBuf::from(path);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
    }
    Ok(())
}
