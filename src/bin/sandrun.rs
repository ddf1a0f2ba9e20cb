//! Sandrun CLI
//!
//! Runs the worker pool, submits and inspects executions, and opens
//! interactive sandbox sessions.

use clap::{Parser, Subcommand};
use sandrun::config::{apply_env_overrides, load_config, load_config_from_path, validate_config};
use sandrun::core::{ExecutionConfig, FileResultStore, ResultStore};
use sandrun::runtime::{default_registry, Backend, Runtime, RuntimePreference};
use sandrun::session::{default_providers, SessionConfig, SessionManager};
use sandrun::{Config, Error, ExecutionService, Result, TaskQueue, WorkerPool, VERSION};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "sandrun",
    author = "Sandrun Contributors",
    version = VERSION,
    about = "Sandrun - sandboxed code execution queue and sessions",
    long_about = None
)]
struct Cli {
    /// Configuration file (JSON5 or TOML)
    #[arg(long, short, global = true, env = "SANDRUN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool until Ctrl-C
    Worker {
        /// Override worker.max_concurrency
        #[arg(long, short = 'j')]
        concurrency: Option<usize>,
    },

    /// Queue code for execution
    Submit {
        /// Programming language
        language: String,
        /// Code to execute
        code: String,
        /// Timeout in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        memory: Option<u64>,
        /// Environment variable, KEY=VALUE (repeatable)
        #[arg(long = "env", short = 'e')]
        env: Vec<String>,
        /// Wait for the result and print it
        #[arg(long, short)]
        wait: bool,
    },

    /// Show the stored result of an execution
    Status {
        /// Execution id returned by submit
        execution_id: Uuid,
    },

    /// Show queue depth
    Queue,

    /// Move stale claimed tasks back to pending
    Reclaim {
        /// Age threshold, e.g. "15m" (defaults to queue.stale_after)
        #[arg(long, value_parser = parse_duration)]
        older_than: Option<Duration>,
    },

    /// Execute code directly on the best available runtime
    Run {
        /// Programming language
        language: String,
        /// Code to execute
        code: String,
        /// Ranking policy: speed, security, memory, balanced
        #[arg(long, short)]
        prefer: Option<RuntimePreference>,
        /// Timeout in seconds
        #[arg(long, short)]
        timeout: Option<u64>,
    },

    /// Open an interactive session; one command per line
    Session {
        /// Session language
        #[arg(long, short, default_value = "bash")]
        language: String,
        /// Provider: docker or workspace
        #[arg(long, short)]
        runtime: Option<String>,
        /// Serve repeated commands from the cache
        #[arg(long)]
        cache: bool,
        /// Reattach to a session kept by an earlier --keep
        #[arg(long)]
        resume: Option<Uuid>,
        /// Keep the sandbox alive on exit so it can be resumed
        #[arg(long)]
        keep: bool,
    },

    /// List registered runtimes and session providers
    Runtimes,

    /// Print the effective configuration and validation issues
    Config,
}

fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sandrun=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::env::var("SANDRUN_LOG_FORMAT").is_ok_and(|f| f == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config()?,
    };

    let validation = validate_config(&config);
    for warning in &validation.warnings {
        warn!("Config: {}", warning);
    }
    if !validation.valid {
        let issues: Vec<String> = validation.errors.iter().map(|e| e.to_string()).collect();
        return Err(Error::Config(issues.join("; ")));
    }
    Ok(config)
}

/// Cancel the token on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    if let Commands::Config = cli.command {
        return show_config(cli.config.as_ref());
    }

    let config = load(cli.config.as_ref())?;

    match cli.command {
        Commands::Worker { concurrency } => run_worker(config, concurrency).await,
        Commands::Submit {
            language,
            code,
            timeout,
            memory,
            env,
            wait,
        } => {
            let mut exec = config.execution.clone();
            if let Some(timeout) = timeout {
                exec.timeout_seconds = timeout;
            }
            if let Some(memory) = memory {
                exec.memory_limit_mb = memory;
            }
            for pair in env {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| Error::InvalidInput(format!("Expected KEY=VALUE, got {}", pair)))?;
                exec.environment.insert(key.to_string(), value.to_string());
            }
            submit(config, &language, &code, exec, wait).await
        }
        Commands::Status { execution_id } => show_status(config, execution_id).await,
        Commands::Queue => show_queue(config).await,
        Commands::Reclaim { older_than } => reclaim(config, older_than).await,
        Commands::Run {
            language,
            code,
            prefer,
            timeout,
        } => run_direct(config, &language, &code, prefer, timeout).await,
        Commands::Session {
            language,
            runtime,
            cache,
            resume,
            keep,
        } => {
            let mut session_config = SessionConfig::new(language);
            session_config.runtime_type = runtime;
            session_config.cache_results = cache;
            run_session(config, session_config, resume, keep).await
        }
        Commands::Runtimes => list_runtimes(config).await,
        Commands::Config => Ok(()),
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn ResultStore>> {
    Ok(Arc::new(FileResultStore::new(&config.storage.results_dir).await?))
}

async fn run_worker(mut config: Config, concurrency: Option<usize>) -> Result<()> {
    if let Some(concurrency) = concurrency {
        config.worker.max_concurrency = concurrency;
    }

    let queue = Arc::new(TaskQueue::from_config(&config.queue).await?);
    let store = open_store(&config).await?;
    let runtimes = Arc::new(default_registry(&config).await);
    info!(
        "Serving {} from {}",
        runtimes.environments().join(", "),
        queue.root().display()
    );

    let pool = WorkerPool::new(queue, runtimes, store, &config);
    let report = pool.run(cancel_on_ctrl_c()).await;

    println!(
        "claimed {}  succeeded {}  failed {}  abandoned {}  reclaimed {}",
        report.claimed, report.succeeded, report.failed, report.abandoned, report.reclaimed
    );
    Ok(())
}

async fn submit(config: Config, language: &str, code: &str, exec: ExecutionConfig, wait: bool) -> Result<()> {
    let queue = Arc::new(TaskQueue::from_config(&config.queue).await?);
    let store = open_store(&config).await?;
    let runtimes = Arc::new(default_registry(&config).await);
    let service = ExecutionService::new(queue, runtimes, store, config.execution.clone());

    let execution_id = service.submit(code, language, Some(exec)).await?;
    println!("{}", execution_id);

    if !wait {
        return Ok(());
    }

    let cancel = cancel_on_ctrl_c();
    loop {
        let result = service.status(execution_id).await?;
        if result.is_terminal() {
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(config.queue.poll_interval.max(Duration::from_millis(200))) => {}
        }
    }
}

async fn show_status(config: Config, execution_id: Uuid) -> Result<()> {
    let store = open_store(&config).await?;
    let result = store
        .get_result(execution_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("execution {}", execution_id)))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn show_queue(config: Config) -> Result<()> {
    let queue = TaskQueue::from_config(&config.queue).await?;
    println!("queue:      {}", queue.root().display());
    println!("pending:    {}", queue.pending_count().await?);
    println!("processing: {}", queue.processing_count().await?);
    Ok(())
}

async fn reclaim(config: Config, older_than: Option<Duration>) -> Result<()> {
    let queue = TaskQueue::from_config(&config.queue).await?;
    let moved = queue
        .reclaim_stale(older_than.unwrap_or(config.queue.stale_after))
        .await?;
    println!("reclaimed {} tasks", moved);
    Ok(())
}

async fn run_direct(
    config: Config,
    language: &str,
    code: &str,
    prefer: Option<RuntimePreference>,
    timeout: Option<u64>,
) -> Result<()> {
    let mut exec = config.execution.clone();
    if let Some(timeout) = timeout {
        exec.timeout_seconds = timeout;
    }
    exec.validate()?;

    let runtimes = default_registry(&config).await;
    let language = language.to_lowercase();
    if !runtimes.supports(&language) {
        return Err(Error::UnsupportedLanguage(language));
    }

    let preference = prefer.unwrap_or(config.worker.runtime_preference);
    let runtime = runtimes
        .select_best(&language, preference)
        .await
        .ok_or_else(|| Error::NoRuntimeAvailable(language.clone()))?;
    info!("Running on '{}'", runtime.name());

    let output = runtime.execute(&language, code, &exec).await?;
    print!("{}", output.stdout);
    eprint!("{}", output.stderr);
    if output.exit_code != 0 {
        std::process::exit(output.exit_code);
    }
    Ok(())
}

async fn run_session(config: Config, session_config: SessionConfig, resume: Option<Uuid>, keep: bool) -> Result<()> {
    let providers = Arc::new(default_providers(&config).await);
    let manager = Arc::new(SessionManager::new(providers, &config));
    let snapshot = config.sessions.snapshot_path.clone();

    let restored = manager.load_snapshot(&snapshot).await?;
    if restored > 0 {
        info!("{} kept sessions available", restored);
    }

    let session_id = match resume {
        Some(id) => manager
            .get_session(id)
            .map(|s| s.session_id)
            .ok_or(Error::SessionNotFound(id))?,
        None => manager.create_session(session_config).await?.session_id,
    };
    eprintln!("session {} ready; one command per line, Ctrl-D to leave", session_id);

    let cancel = cancel_on_ctrl_c();
    let maintenance = {
        let manager = manager.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move { manager.run_maintenance(cancel).await })
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        match manager.execute_in_session(session_id, &line).await {
            Ok(output) => {
                stdout.write_all(output.stdout.as_bytes()).await?;
                stdout.flush().await?;
                eprint!("{}", output.stderr);
                if output.exit_code != 0 {
                    eprintln!("[exit {}]", output.exit_code);
                }
            }
            Err(e) if e.is_client_error() => {
                eprintln!("{}", e);
                break;
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    cancel.cancel();
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }

    if !keep {
        if let Err(e) = manager.close_session(session_id).await {
            warn!("Close failed: {}", e);
        }
    }
    let saved = manager.save_snapshot(&snapshot).await?;
    if keep {
        eprintln!("kept session {}; resume with --resume {}", session_id, session_id);
    }
    info!("{} sessions saved to {}", saved, snapshot.display());
    Ok(())
}

async fn list_runtimes(config: Config) -> Result<()> {
    let runtimes = default_registry(&config).await;
    println!("One-shot runtimes:");
    for backend in runtimes.backends() {
        print_backend(backend.as_ref()).await;
    }

    let providers = default_providers(&config).await;
    println!("\nSession providers:");
    for backend in providers.backends() {
        print_backend(backend.as_ref()).await;
    }
    Ok(())
}

async fn print_backend<B: Backend + ?Sized>(backend: &B) {
    let caps = backend.capabilities();
    let state = if backend.is_available().await {
        "available"
    } else {
        "unavailable"
    };
    println!(
        "  {:<10} {:<11} startup {:>5}ms  memory {:>4}MB  isolation {:>2}  [{}]",
        backend.name(),
        state,
        caps.startup_time_ms,
        caps.memory_overhead_mb,
        caps.isolation_level,
        backend.supported_environments().join(", ")
    );
}

fn show_config(path: Option<&PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => {
            let mut config = load_config_from_path(path)?;
            apply_env_overrides(&mut config);
            config
        }
        None => load_config()?,
    };

    println!("{}", serde_json::to_string_pretty(&config)?);

    let validation = validate_config(&config);
    for error in &validation.errors {
        eprintln!("error: {}", error);
    }
    for warning in &validation.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}
