//! txbench command line.
//!
//! Runs the flight booking workload against one of the in-memory backends and
//! prints the report.
//!
//! Usage:
//!   txbench --backend connection --lanes 16 --iterations 10000 --max-attempts 20
//!   txbench --config bench.toml --duration 30 --format json
//!   txbench --backend session --duration 10 --booking-sleep-ms 5

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;
use txbench::{
    Reporter, RunConfig, Scenario,
    aggregate::RunAggregate,
    executor::Cancellation,
    memory::{MemoryDocClient, MemoryEngine, MemorySqlPool},
    report::{JsonReporter, StdoutReporter, SummaryReport},
    scope::{Backend, BackendKind, ConnectionBackend, SessionBackend},
    workloads::{BookingStore, FlightBooking},
};

/// Transactional flight booking benchmark.
#[derive(Parser, Debug)]
#[command(name = "txbench", version, about = "Transactional benchmark with conflict-aware retries")]
struct Args {
    /// TOML run configuration. Flags override its values.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Transactional model of the backend.
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,

    /// Number of concurrent lanes.
    #[arg(long)]
    lanes: Option<usize>,

    /// Total bookings across all lanes.
    #[arg(long)]
    iterations: Option<u64>,

    /// Stop admitting bookings after this many seconds.
    #[arg(long, value_name = "SECS")]
    duration: Option<u64>,

    /// Think time inside each booking transaction, in milliseconds.
    #[arg(long, value_name = "MS")]
    booking_sleep_ms: Option<u64>,

    /// Number of days audit rows are spread over.
    #[arg(long)]
    day_range: Option<u64>,

    /// Attempts per booking, the first one included.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Pause between attempts of the same booking.
    #[arg(long, value_name = "MS")]
    retry_delay: Option<u64>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Session,
    Connection,
}

impl From<BackendArg> for BackendKind {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Session => BackendKind::Session,
            BackendArg::Connection => BackendKind::Connection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

impl Args {
    fn into_config(self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => RunConfig::default(),
        };

        if let Some(backend) = self.backend {
            config.backend.kind = backend.into();
        }
        if let Some(lanes) = self.lanes {
            config.concurrency = lanes;
        }
        if let Some(iterations) = self.iterations {
            config.iterations = Some(iterations);
        }
        if let Some(duration) = self.duration {
            config.duration_secs = Some(duration);
        }
        if let Some(sleep) = self.booking_sleep_ms {
            config.operation_delay_ms = sleep;
        }
        if let Some(day_range) = self.day_range {
            config.workload.day_range = day_range;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.retry.max_attempts = Some(max_attempts);
        }
        if let Some(delay) = self.retry_delay {
            config.retry.delay_ms = Some(delay);
        }

        config.validate()?;
        Ok(config)
    }
}

async fn book<B>(config: &RunConfig, backend: B, cancellation: Cancellation) -> Result<SummaryReport>
where
    B: Backend,
    B::Scope: BookingStore,
{
    let workload = FlightBooking::builder()
        .backend(backend)
        .day_range(config.workload.day_range)
        .seed_schedules(config.workload.seed_schedules)
        .tx_options(config.tx)
        .build();

    let summary = Scenario::<_, _, RunAggregate>::builder()
        .name(format!("flight-booking/{}", config.backend.kind))
        .workload(workload)
        .executor(config.executor())
        .cancellation(cancellation)
        .build()
        .run()
        .await?;
    Ok(SummaryReport::from(&summary))
}

async fn run(config: &RunConfig, cancellation: Cancellation) -> Result<SummaryReport> {
    let engine = Arc::new(MemoryEngine::new());
    match config.backend.kind {
        BackendKind::Session => {
            let client = MemoryDocClient::new(engine, config.max_handles());
            let backend = SessionBackend::new(client, config.acquire_timeout());
            book(config, backend, cancellation).await
        }
        BackendKind::Connection => {
            let pool = MemorySqlPool::new(engine, config.max_handles());
            let backend = ConnectionBackend::new(pool, config.acquire_timeout());
            book(config, backend, cancellation).await
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let format = args.format;
    let config = args.into_config()?;
    if config.budget().is_unbounded() {
        tracing::info!("No iteration or duration budget, running until interrupted.");
    }

    let cancellation = Cancellation::new();
    tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, letting in-flight transactions finish...");
                cancellation.cancel();
            }
        }
    });

    let report = run(&config, cancellation).await?;
    let reported = match format {
        Format::Text => StdoutReporter.report(&report).await,
        Format::Json => JsonReporter.report(&report).await,
    };
    reported.map_err(|e| anyhow!(e))?;

    Ok(if report.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
