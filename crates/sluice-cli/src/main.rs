//! sluice demo host.
//!
//! Produces a batch of jobs spread over a few tenants, pushes them through a
//! (optionally buffered) dispatcher and prints a JSON summary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, ensure};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde::Serialize;
use sluice_core::{
    BufferedDispatcher, DispatchStats, Dispatcher, DispatcherBuilder, DistributionId,
    EnqueueStatus, ProcessError, ProcessResult, Processor, QueueError, Settings, Source,
    SourceType,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use ulid::Ulid;

const INGEST: SourceType = SourceType::new("demo.ingest.v1");
const ENRICH: SourceType = SourceType::new("demo.enrich.v1");
const LEGACY: SourceType = SourceType::new("demo.legacy.v1");

#[derive(Debug, Parser)]
#[command(name = "sluice", about = "Run a batch of demo jobs through a dispatcher")]
struct Args {
    /// JSON settings file (backend, buffer, dispatch)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of jobs to produce
    #[arg(short = 'n', long, default_value_t = 100)]
    count: u32,

    /// Number of tenants (distributions) to spread jobs over
    #[arg(short, long, default_value_t = 4)]
    tenants: u32,

    /// Probability that an enrich attempt fails
    #[arg(long, default_value_t = 0.1)]
    fail_rate: f64,

    /// Enrich attempts before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,

    /// Every n-th job is of a type nobody handles (0 disables)
    #[arg(long, default_value_t = 25)]
    legacy_every: u32,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ingest,
    Enrich,
    Legacy,
}

#[derive(Debug)]
struct Job {
    id: Ulid,
    tenant: i64,
    stage: Stage,
    attempts: u32,
}

impl Job {
    fn new(tenant: i64, stage: Stage) -> Self {
        Self {
            id: Ulid::new(),
            tenant,
            stage,
            attempts: 0,
        }
    }
}

impl Source for Job {
    fn source_type(&self) -> SourceType {
        match self.stage {
            Stage::Ingest => INGEST,
            Stage::Enrich => ENRICH,
            Stage::Legacy => LEGACY,
        }
    }

    fn distribution_id(&self) -> DistributionId {
        DistributionId::new(self.tenant)
    }
}

/// Accepts a job and hands back its enrich step.
struct IngestProcessor;

#[async_trait]
impl Processor<Job> for IngestProcessor {
    fn source_type(&self) -> SourceType {
        INGEST
    }

    async fn process(&self, job: &mut Job) -> Result<ProcessResult<Job>, ProcessError> {
        let next = Job {
            id: job.id,
            ..Job::new(job.tenant, Stage::Enrich)
        };
        Ok(ProcessResult::success().with_requeue([next]))
    }
}

/// Flaky step: retries itself until it succeeds or runs out of attempts.
struct EnrichProcessor {
    fail_rate: f64,
    max_attempts: u32,
}

#[async_trait]
impl Processor<Job> for EnrichProcessor {
    fn source_type(&self) -> SourceType {
        ENRICH
    }

    async fn process(&self, job: &mut Job) -> Result<ProcessResult<Job>, ProcessError> {
        job.attempts += 1;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        let failed = rand::thread_rng().gen_bool(self.fail_rate);
        if !failed {
            return Ok(ProcessResult::success());
        }
        if job.attempts < self.max_attempts {
            return Ok(ProcessResult::success().requeue_current());
        }
        Err(ProcessError::failed(format!(
            "enrich {} gave up after {} attempts",
            job.id, job.attempts
        )))
    }
}

/// Direct or buffered, depending on the settings.
enum Frontend {
    Direct(Dispatcher<Job>),
    Buffered(BufferedDispatcher<Job>),
}

impl Frontend {
    fn dispatcher(&self) -> &Dispatcher<Job> {
        match self {
            Frontend::Direct(dispatcher) => dispatcher,
            Frontend::Buffered(buffered) => buffered.dispatcher(),
        }
    }

    async fn enqueue(&self, job: Job) -> Result<EnqueueStatus, QueueError> {
        match self {
            Frontend::Direct(dispatcher) => dispatcher.enqueue(job).await,
            Frontend::Buffered(buffered) => buffered.enqueue(job).await,
        }
    }

    fn complete_enqueue(&self) {
        match self {
            Frontend::Direct(dispatcher) => dispatcher.complete_enqueue(),
            Frontend::Buffered(buffered) => buffered.complete_enqueue(),
        }
    }

    async fn dispatch(&self) -> Result<DispatchStats, QueueError> {
        match self {
            Frontend::Direct(dispatcher) => dispatcher.dispatch().await,
            Frontend::Buffered(buffered) => buffered.dispatch().await,
        }
    }

    fn dispose(&self) {
        match self {
            Frontend::Direct(dispatcher) => dispatcher.dispose(),
            Frontend::Buffered(buffered) => buffered.dispose(),
        }
    }
}

impl Clone for Frontend {
    fn clone(&self) -> Self {
        match self {
            Frontend::Direct(dispatcher) => Frontend::Direct(dispatcher.clone()),
            Frontend::Buffered(buffered) => Frontend::Buffered(buffered.clone()),
        }
    }
}

#[derive(Debug, Serialize)]
struct Summary {
    produced: u32,
    dropped: u32,
    buffered: bool,
    stats: DispatchStats,
    dead_letters: usize,
    failures: usize,
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true))
            .try_init()
            .context("failed to initialize tracing subscriber")?;
    } else {
        registry
            .with(fmt::layer().compact())
            .try_init()
            .context("failed to initialize tracing subscriber")?;
    }
    Ok(())
}

fn build_frontend(settings: &Settings, args: &Args) -> anyhow::Result<Frontend> {
    let builder = DispatcherBuilder::from_settings(settings)
        .register(IngestProcessor)
        .register(EnrichProcessor {
            fail_rate: args.fail_rate,
            max_attempts: args.max_attempts,
        })
        .expect_types(&[INGEST, ENRICH]);

    let frontend = match &settings.buffer {
        Some(buffer) => Frontend::Buffered(builder.build_buffered(buffer.clone())?),
        None => Frontend::Direct(builder.build()?),
    };
    Ok(frontend)
}

async fn produce(frontend: Frontend, args: &Args) -> anyhow::Result<u32> {
    let mut dropped = 0;
    for n in 0..args.count {
        let tenant = i64::from(n % args.tenants);
        let stage = if args.legacy_every > 0 && n % args.legacy_every == args.legacy_every - 1 {
            Stage::Legacy
        } else {
            Stage::Ingest
        };
        if !frontend.enqueue(Job::new(tenant, stage)).await?.is_accepted() {
            dropped += 1;
        }
    }
    frontend.complete_enqueue();
    Ok(dropped)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json)?;

    ensure!(
        (0.0..=1.0).contains(&args.fail_rate),
        "--fail-rate must be between 0 and 1"
    );
    ensure!(args.tenants > 0, "--tenants must be at least 1");

    let settings = match &args.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let frontend = build_frontend(&settings, &args)?;
    let dispatcher = frontend.dispatcher().clone();

    let dead_letters = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&dead_letters);
    dispatcher.dead_letter_handlers().add(Arc::new(move |job: &Job| {
        counter.fetch_add(1, Ordering::SeqCst);
        warn!(id = %job.id, tenant = job.tenant, "no processor for job");
    }));

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failures);
    dispatcher
        .unsuccessful_handlers()
        .add(Arc::new(move |result: &ProcessResult<Job>| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = result.error_detail() {
                warn!(%error, "job failed");
            }
        }));

    let cancel = dispatcher.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            cancel.cancel();
        }
    });

    info!(
        count = args.count,
        tenants = args.tenants,
        buffered = settings.buffer.is_some(),
        "starting"
    );

    let consumer = tokio::spawn({
        let frontend = frontend.clone();
        async move { frontend.dispatch().await }
    });
    let dropped = produce(frontend.clone(), &args).await?;
    let stats = consumer.await.context("dispatch task panicked")??;

    let summary = Summary {
        produced: args.count,
        dropped,
        buffered: settings.buffer.is_some(),
        stats,
        dead_letters: dead_letters.load(Ordering::SeqCst),
        failures: failures.load(Ordering::SeqCst),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    frontend.dispose();
    Ok(())
}
