use clap::{Parser, Subcommand};
use massdriver::*;
use massdriver::errors::{AdapterError, MigrateError};
use massdriver::model::JobSpec;
use migration::MigratorTrait;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "massdriver",
    version,
    about = "Bulk relational-data migration engine"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job from a YAML spec and plan its chunks; prints the job id
    Plan {
        /// Path to the job spec (job.yaml)
        job_file: String,
    },
    /// Run a worker loop until SIGINT
    Worker {
        /// Stable worker id; generated from hostname when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Print a job's counters and state
    Status { job_id: String },
    /// Reset one terminal chunk so it is scheduled again
    RetryChunk { chunk_id: String },
    /// Stop handing out new chunks for a job
    Pause { job_id: String },
    /// Clear a job's pause flag
    Resume { job_id: String },
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, MigrateError> {
    let cfg = settings::Settings::load(&cli.config)?;
    let db = catalog::init(&cfg.catalog).await?;
    migration::Migrator::up(&db, None).await?;

    match cli.command {
        Command::Plan { job_file } => {
            let text = match std::fs::read_to_string(&job_file) {
                Ok(text) => text,
                Err(err) => {
                    eprintln!("error: cannot read {job_file}: {err}");
                    return Ok(2);
                }
            };
            let spec = match JobSpec::from_yaml(&text) {
                Ok(spec) => spec,
                Err(err) => {
                    eprintln!("error: {err}");
                    return Ok(2);
                }
            };
            let job = catalog::create_job(&db, &spec, &cfg).await?;
            match planner::plan_job(&db, &job.id).await {
                Ok(summary) => {
                    tracing::info!(
                        tables = summary.planned_tables,
                        chunks = summary.total_chunks,
                        "Plan written"
                    );
                    println!("{}", job.id);
                    Ok(0)
                }
                Err(MigrateError::Adapter(err)) if is_unreachable(&err) => {
                    eprintln!("error: source unreachable: {err}");
                    Ok(3)
                }
                Err(MigrateError::Spec(msg)) => {
                    eprintln!("error: {msg}");
                    Ok(2)
                }
                Err(err) => Err(err),
            }
        }
        Command::Worker { id } => {
            let _scheduler = dispatcher::init_scheduler(db.clone(), cfg.clone()).await?;
            let worker = worker::Worker::new(db, cfg, id);
            let shutdown = worker.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("SIGINT received, draining worker");
                    shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });
            worker.run().await?;
            Ok(0)
        }
        Command::Status { job_id } => {
            match catalog::get_job(&db, &job_id).await? {
                Some(job) => {
                    println!("job:        {}", job.id);
                    println!("status:     {}", job.status);
                    println!("tables:     {}", job.total_tables);
                    println!(
                        "chunks:     {} total, {} completed, {} failed",
                        job.total_chunks, job.completed_chunks, job.failed_chunks
                    );
                    if let Some(throughput) = job.avg_rows_per_sec {
                        println!("throughput: {throughput:.0} rows/s");
                    }
                    if let Some(error) = &job.last_error {
                        println!("last error: {error}");
                    }
                    Ok(0)
                }
                None => {
                    eprintln!("error: job {job_id} not found");
                    Ok(4)
                }
            }
        }
        Command::RetryChunk { chunk_id } => match catalog::retry_chunk(&db, &chunk_id).await {
            Ok(()) => {
                println!("chunk {chunk_id} rescheduled");
                Ok(0)
            }
            Err(MigrateError::NotFound(what)) => {
                eprintln!("error: {what} not found");
                Ok(4)
            }
            Err(err) => Err(err),
        },
        Command::Pause { job_id } => match catalog::pause_job(&db, &job_id).await {
            Ok(()) => Ok(0),
            Err(MigrateError::NotFound(what)) => {
                eprintln!("error: {what} not found");
                Ok(4)
            }
            Err(err) => Err(err),
        },
        Command::Resume { job_id } => match catalog::resume_job(&db, &job_id).await {
            Ok(()) => Ok(0),
            Err(MigrateError::NotFound(what)) => {
                eprintln!("error: {what} not found");
                Ok(4)
            }
            Err(err) => Err(err),
        },
    }
}

fn is_unreachable(err: &AdapterError) -> bool {
    matches!(
        err,
        AdapterError::ConnectionLost(_)
            | AdapterError::Timeout(_)
            | AdapterError::AuthFailed(_)
            | AdapterError::NotFound(_)
    )
}
