//! tardy - a small durable background-job engine.
//!
//! Usage:
//!   tardy serve [--config tardy.yaml]   Run the dispatcher and the HTTP API
//!   tardy validate <config>             Validate a configuration file
//!   tardy next <cron> [--timezone TZ]   Print the next fire times of a cron expression

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tardy::api::{create_api_state, start_server};
use tardy::demo::{DataCleanupService, register_demo_handlers};
use tardy::{
    Clock, CronExpr, Dispatcher, Event, EventBus, EventHandler, GlobalConfig, HandlerRegistry,
    InMemoryStore, JobClient, JobStore, Payload, StorageConfig, SystemClock, YamlLoader,
};
use tracing::{error, info, warn};

/// tardy - a small durable background-job engine
#[derive(Parser)]
#[command(name = "tardy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher and the HTTP API
    Serve {
        /// Path to the configuration file (defaults apply when omitted)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Host to bind the API to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind the API to
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of workers
        #[arg(short = 'w', long)]
        workers: Option<usize>,
    },

    /// Validate a configuration file without running
    Validate {
        /// Path to the configuration file
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },

    /// Print the next fire times of a cron expression
    Next {
        /// Cron expression or shortcut (e.g. "0 0 * * *", "@hourly")
        #[arg(value_name = "CRON")]
        cron: String,

        /// IANA timezone the expression is evaluated in
        #[arg(short, long, default_value = "UTC")]
        timezone: String,

        /// Number of fire times to print
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

/// Event handler that logs job lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobEnqueued {
                job_id,
                handler,
                scheduled_at,
                ..
            } => match scheduled_at {
                Some(at) => info!(job_id = %job_id, handler = %handler, "Job scheduled for {}", at),
                None => info!(job_id = %job_id, handler = %handler, "Job enqueued"),
            },
            Event::JobStarted {
                job_id,
                worker,
                attempt,
                ..
            } => {
                info!(job_id = %job_id, worker = %worker, attempt, "Job started");
            }
            Event::JobSucceeded {
                job_id,
                attempt,
                duration,
                ..
            } => {
                info!(job_id = %job_id, attempt, "Job succeeded in {:?}", duration);
            }
            Event::JobRetryScheduled {
                job_id,
                failed_attempt,
                max_attempts,
                next_at,
                error,
                ..
            } => {
                warn!(
                    job_id = %job_id,
                    error = %error,
                    "Attempt {}/{} failed, retrying at {}",
                    failed_attempt, max_attempts, next_at
                );
            }
            Event::JobFailed {
                job_id,
                attempt,
                error,
                exhausted,
                ..
            } => {
                error!(job_id = %job_id, attempt, exhausted, error = %error, "Job failed");
            }
            Event::JobDeleted { job_id, .. } => {
                info!(job_id = %job_id, "Job deleted");
            }
            Event::RecurringFired { key, job_id, .. } => {
                info!(schedule = %key, job_id = %job_id, "Recurring schedule fired");
            }
            Event::RecurringSuppressed { key, .. } => {
                info!(schedule = %key, "Recurring fire skipped, previous instance still live");
            }
            Event::LeaseReclaimed { job_id, state, .. } => {
                warn!(job_id = %job_id, state = %state, "Expired lease reclaimed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            workers,
        } => {
            let mut config = match config {
                Some(path) => {
                    info!("Loading configuration from: {}", path.display());
                    YamlLoader::load_global_config(&path)?
                }
                None => GlobalConfig::default(),
            };
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(workers) = workers {
                config.dispatcher.workers = workers;
            }
            serve(config).await?;
        }
        Commands::Validate { config } => {
            validate_config(&config)?;
        }
        Commands::Next {
            cron,
            timezone,
            count,
        } => {
            print_next_fire_times(&cron, &timezone, count)?;
        }
    }

    Ok(())
}

/// Open the configured store and run the engine on it.
async fn serve(config: GlobalConfig) -> Result<(), Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage; jobs are lost on restart");
            run(Arc::new(InMemoryStore::new()), config).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let store = Arc::new(tardy::SqliteStore::new(path).await?);
            let result = run(Arc::clone(&store), config).await;
            store.close().await;
            result
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the 'sqlite' feature".into())
        }
    }
}

/// Run the dispatcher and the API server until Ctrl+C.
async fn run<S: JobStore + 'static>(
    store: Arc<S>,
    config: GlobalConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    // Create event bus with logging handler
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let mut registry = HandlerRegistry::new();
    let cleanup = if config.demo.enabled {
        let service = Arc::new(DataCleanupService::new(&config.demo));
        register_demo_handlers(
            &mut registry,
            Arc::clone(&service),
            &config.demo,
            Arc::clone(&clock),
        );
        Some(service)
    } else {
        None
    };
    info!("Registered handlers: {}", registry.names().join(", "));

    let client = JobClient::new(Arc::clone(&store))
        .with_clock(Arc::clone(&clock))
        .with_event_bus(Arc::clone(&event_bus));

    // Register configured recurring schedules
    for entry in &config.recurring {
        if !registry.contains(&entry.handler) {
            return Err(format!(
                "recurring '{}' references unknown handler '{}'",
                entry.key, entry.handler
            )
            .into());
        }
        let payload = Payload::new(&entry.handler).with_args(entry.args.clone());
        let schedule = match entry.max_attempts {
            Some(max_attempts) => {
                client
                    .enqueue_recurring_with(
                        entry.key.as_str(),
                        payload,
                        &entry.cron,
                        &entry.timezone,
                        max_attempts,
                    )
                    .await?
            }
            None => {
                client
                    .enqueue_recurring(entry.key.as_str(), payload, &entry.cron, &entry.timezone)
                    .await?
            }
        };
        info!(
            "  - {} ({} {}): next fire at {}",
            schedule.key, schedule.cron, schedule.timezone, schedule.next_fire_at
        );
    }

    let dispatcher_config = config.dispatcher.to_dispatcher_config();
    info!(
        "Starting dispatcher '{}' with {} worker(s)...",
        dispatcher_config.name, dispatcher_config.workers
    );
    let dispatcher = Dispatcher::new(Arc::clone(&store), registry.clone())
        .with_clock(clock)
        .with_event_bus(Arc::clone(&event_bus))
        .with_retry_policy(config.retry.clone())
        .with_config(dispatcher_config);
    let (handle, dispatcher_task) = dispatcher.start();

    let state = create_api_state(client, handle.clone(), registry, cleanup);
    let server = start_server(config.server.clone(), state).await?;
    info!("Press Ctrl+C to stop");

    // Wait for Ctrl+C
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            server.abort();
            handle.shutdown().await?;
        }
        _ = dispatcher_task => {
            server.abort();
            info!("Dispatcher stopped");
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration file without running.
fn validate_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    match YamlLoader::load_global_config(path) {
        Ok(config) => {
            info!(
                "Configuration is valid: {} worker(s), {} recurring schedule(s)",
                config.dispatcher.workers,
                config.recurring.len()
            );
            for entry in &config.recurring {
                info!(
                    "  - {} -> {} ({} {}): OK",
                    entry.key, entry.handler, entry.cron, entry.timezone
                );
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Print the next fire times of a cron expression.
fn print_next_fire_times(
    cron: &str,
    timezone: &str,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let expr = CronExpr::parse(cron, timezone)?;
    let times = expr.next_n_after(Utc::now(), count);

    if times.is_empty() {
        println!("'{}' never fires again", expr.expression());
        return Ok(());
    }

    println!("Next fire times of '{}' ({}):", expr.expression(), expr.timezone());
    for time in times {
        println!("  {}", time);
    }

    Ok(())
}
