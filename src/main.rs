use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metric_access::batch::{
    AccessContext, AccessDataProcess, BatchWorkerPool, ChannelDispatcher, KvQueueDispatcher,
    SubTaskDispatcher, TaskSource,
};
use metric_access::datasource::UnifyQueryClient;
use metric_access::kv::{RedisStore, SharedKv};
use metric_access::realtime::{ConsumerFactory, MetadataClient, RealTimeAccess, StorageApi};
use metric_access::realtime::RealTimeContext;
use metric_access::shutdown::{install_signal_handlers, join_with_timeout};
use metric_access::strategy::{KvStrategyCache, StrategyCache};
use metric_access::{AccessMetrics, AccessSettings, HostCache, ShutdownState, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Parser)]
#[command(name = "metric-access")]
#[command(about = "Metric access pipeline feeding detector queues", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "METRIC_ACCESS_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the real-time Kafka loops of this node
    RealTime {
        /// Run every loop once and exit
        #[arg(long)]
        once: bool,
    },
    /// Run batch access cycles of one strategy group
    AccessGroup {
        #[arg(long)]
        group_key: String,
        /// Seconds between cycles
        #[arg(long, default_value_t = 60)]
        period: u64,
        /// Run sub-tasks in-process with this many workers instead of the KV queue
        #[arg(long, default_value_t = 0)]
        workers: usize,
        /// Run one cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Drain batch sub-tasks from the KV queue
    BatchWorker {
        #[arg(long, default_value_t = num_cpus::get())]
        workers: usize,
    },
    /// Print the resolved configuration
    ShowConfig,
}

fn init_logging(
    #[cfg_attr(not(feature = "telemetry"), allow(unused_variables))] settings: &AccessSettings,
    debug: bool,
) -> Result<()> {
    #[cfg(feature = "telemetry")]
    {
        use metric_access::telemetry::{init_telemetry, TelemetryConfig};
        if std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
            init_telemetry(TelemetryConfig::from_env(settings), debug)?;
            return Ok(());
        }
    }
    metric_access::init_tracing(debug);
    Ok(())
}

#[cfg(feature = "kafka")]
fn kafka_factory(settings: &AccessSettings) -> Result<Arc<dyn ConsumerFactory>> {
    Ok(Arc::new(metric_access::realtime::kafka::RdKafkaFactory::new(
        settings.kafka.clone(),
    )))
}

#[cfg(not(feature = "kafka"))]
fn kafka_factory(_settings: &AccessSettings) -> Result<Arc<dyn ConsumerFactory>> {
    anyhow::bail!("real-time access needs the `kafka` feature")
}

fn batch_context(
    settings: &Arc<AccessSettings>,
    kv: &SharedKv,
    dispatcher: Arc<dyn SubTaskDispatcher>,
) -> Result<Arc<AccessContext>> {
    let data_source = UnifyQueryClient::new(
        &settings.access.unify_query_url,
        settings.access.query_timeout,
    )
    .context("Failed to build unify query client")?;
    Ok(Arc::new(AccessContext {
        settings: Arc::clone(settings),
        kv: Arc::clone(kv),
        strategies: Arc::new(KvStrategyCache::new(Arc::clone(kv))),
        data_source: Arc::new(data_source),
        clock: Arc::new(SystemClock),
        hosts: HostCache::new(),
        metrics: Arc::new(AccessMetrics::new()),
        dispatcher,
    }))
}

async fn run_real_time(
    settings: Arc<AccessSettings>,
    kv: SharedKv,
    shutdown: Arc<ShutdownState>,
    once: bool,
) -> Result<()> {
    let storage_api: Option<Box<dyn StorageApi>> = match &settings.access.metadata_api_url {
        Some(url) => Some(Box::new(MetadataClient::new(
            url.clone(),
            settings.access.query_timeout,
        )?)),
        None => None,
    };
    let strategies: Arc<dyn StrategyCache> = Arc::new(KvStrategyCache::new(Arc::clone(&kv)));
    let metrics = Arc::new(AccessMetrics::new());
    let access = RealTimeAccess::new(RealTimeContext {
        kafka: kafka_factory(&settings)?,
        settings,
        kv,
        strategies,
        storage_api,
        clock: Arc::new(SystemClock),
        hosts: HostCache::new(),
        metrics: Arc::clone(&metrics),
    });
    info!(node_id = access.node_id(), once, "starting real-time access");
    if once {
        access.run_once(&shutdown).await?;
    } else {
        access.run(shutdown).await?;
    }
    log_metrics(&metrics);
    Ok(())
}

async fn run_access_group(
    settings: Arc<AccessSettings>,
    kv: SharedKv,
    shutdown: Arc<ShutdownState>,
    group_key: String,
    period: Duration,
    workers: usize,
    once: bool,
) -> Result<()> {
    let token = shutdown.token();
    let mut pool_tasks = Vec::new();
    let ctx = if workers > 0 {
        let (dispatcher, rx) = ChannelDispatcher::channel(workers * 4);
        let ctx = batch_context(&settings, &kv, Arc::new(dispatcher))?;
        let handles =
            BatchWorkerPool::new(Arc::clone(&ctx), TaskSource::channel(rx), workers).spawn(token.clone());
        pool_tasks.extend(handles.into_iter().map(|h| ("batch_worker", h)));
        ctx
    } else {
        batch_context(&settings, &kv, Arc::new(KvQueueDispatcher::new(Arc::clone(&kv))))?
    };

    loop {
        if let Err(e) = ctx.hosts.refresh(&kv).await {
            warn!("host cache refresh failed: {}", e);
        }
        match AccessDataProcess::new(Arc::clone(&ctx), group_key.clone()).process().await {
            Ok(outcome) => info!(strategy_group_key = %group_key, ?outcome, "access cycle finished"),
            Err(e) => e.log(&format!("access group {}", group_key)),
        }
        if once {
            break;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    shutdown.begin_shutdown();
    join_with_timeout(pool_tasks, settings.real_time.shutdown_timeout).await;
    log_metrics(&ctx.metrics);
    Ok(())
}

async fn run_batch_worker(
    settings: Arc<AccessSettings>,
    kv: SharedKv,
    shutdown: Arc<ShutdownState>,
    workers: usize,
) -> Result<()> {
    let ctx = batch_context(&settings, &kv, Arc::new(KvQueueDispatcher::new(Arc::clone(&kv))))?;
    if let Err(e) = ctx.hosts.refresh(&kv).await {
        warn!("host cache refresh failed: {}", e);
    }
    let handles = BatchWorkerPool::new(Arc::clone(&ctx), TaskSource::Kv(Arc::clone(&kv)), workers)
        .spawn(shutdown.token());
    shutdown.token().cancelled().await;
    join_with_timeout(
        handles.into_iter().map(|h| ("batch_worker", h)).collect(),
        settings.real_time.shutdown_timeout,
    )
    .await;
    log_metrics(&ctx.metrics);
    Ok(())
}

fn log_metrics(metrics: &AccessMetrics) {
    info!(
        uptime_secs = metrics.uptime().as_secs(),
        metrics = ?metrics.snapshot(),
        "final access counters"
    );
    debug!("{}", metrics.export_prometheus());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Arc::new(
        AccessSettings::load(cli.config.as_deref()).context("Failed to load configuration")?,
    );

    if let Command::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(settings.as_ref())?);
        return Ok(());
    }

    init_logging(&settings, cli.debug)?;
    info!(version = metric_access::VERSION, "metric-access starting");

    let kv: SharedKv = Arc::new(
        RedisStore::connect(&settings.redis_url)
            .await
            .context("Failed to connect to redis")?,
    );
    let shutdown = Arc::new(ShutdownState::new());
    let signals = install_signal_handlers(Arc::clone(&shutdown));

    let result = match cli.command {
        Command::RealTime { once } => run_real_time(settings, kv, Arc::clone(&shutdown), once).await,
        Command::AccessGroup {
            group_key,
            period,
            workers,
            once,
        } => {
            run_access_group(
                settings,
                kv,
                Arc::clone(&shutdown),
                group_key,
                Duration::from_secs(period),
                workers,
                once,
            )
            .await
        }
        Command::BatchWorker { workers } => {
            run_batch_worker(settings, kv, Arc::clone(&shutdown), workers).await
        }
        Command::ShowConfig => Ok(()),
    };

    signals.abort();
    #[cfg(feature = "telemetry")]
    metric_access::telemetry::shutdown_telemetry();
    info!(
        drain_ms = shutdown.shutdown_duration().map(|d| d.as_millis() as u64),
        "metric-access stopped"
    );
    result
}
