//! Component runner: one pipeline role per process.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use logflume::config::Config;
use logflume::dispatch::{Dispatcher, HandlerRegistry};
use logflume::executor::{DomainExecutor, RawTransactionSubmitter};
use logflume::handlers::Erc20Projector;
use logflume::infra::postgres::{PgDomainOutbox, PgIngestStore};
use logflume::infra::{listen_for_signals, Result, ShutdownSignal};
use logflume::ingest::{PublishSink, Publisher, Scanner};
use logflume::metrics::MetricsRegistry;
use logflume::rpc::{AlloyReadClient, AlloyWriteClient};
use logflume::server;

fn print_help() {
    eprintln!(
        "\
logflume

USAGE:
  logflume <command>

COMMANDS:
  ingest      Run the log-range scanner for one shard
  publisher   Run the ingest outbox publisher
  dispatch    Run one dispatcher worker (HANDLER_KIND selects the handler)
  executor    Run the domain outbox executor
  serve       Serve only the /metrics and /healthz endpoint

ENVIRONMENT:
  DATABASE_URL, RPC_READ_URL        required
  RPC_WRITE_URL                     required by the executor role
  POLL_INTERVAL_MS (300)            scanner poll interval
  STEP_INIT / STEP_MIN / STEP_MAX   adaptive block step bounds
  HEAD_RPS / LOGS_RPS / WRITE_RPS   per-method rate caps
  SUBSCRIPTIONS                     JSON list of {{address?, topic0?}}
  CURSOR_ID / START_BLOCK           shard cursor id and initial block
  ADDRESS_SHARDS                    partition-key shard count
  HANDLER_KIND / PARTITION_SELECTOR dispatcher scope
  DISPATCH_BATCH_SIZE / MAX_ATTEMPTS
  PUBLISH_BATCH_SIZE / EXECUTOR_BATCH_SIZE / EXECUTOR_ENABLED
  METRICS_ADDR (0.0.0.0:9090)       observability endpoint"
    );
}

/// Default transport sink: structured log per published event. The
/// dispatcher consumes the published view from the database, so the sink
/// is an at-least-once notification channel, not the delivery mechanism.
struct TracingSink;

#[async_trait]
impl PublishSink for TracingSink {
    async fn publish(&self, event_id: &str) -> Result<()> {
        info!(event_id = %event_id, "event published");
        Ok(())
    }
}

struct Runtime {
    config: Config,
    metrics: Arc<MetricsRegistry>,
    shutdown: ShutdownSignal,
}

impl Runtime {
    fn bootstrap() -> anyhow::Result<Self> {
        let config = Config::from_env()?;
        let shutdown = ShutdownSignal::new();
        listen_for_signals(shutdown.clone());

        let metrics = Arc::new(MetricsRegistry::new());
        let endpoint_metrics = metrics.clone();
        let endpoint_shutdown = shutdown.clone();
        let addr = config.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = server::serve_metrics(addr, endpoint_metrics, endpoint_shutdown).await {
                tracing::error!(error = %e, "metrics endpoint failed");
            }
        });

        Ok(Self {
            config,
            metrics,
            shutdown,
        })
    }
}

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(Erc20Projector));
    registry
}

async fn run_ingest(rt: Runtime) -> anyhow::Result<()> {
    let pool = server::connect_pool(&rt.config).await?;
    let store = Arc::new(PgIngestStore::new(pool));
    let read = AlloyReadClient::new(rt.config.read_client.clone(), rt.metrics.clone())?;
    let breaker = read.breaker();

    let mut scanner = Scanner::new(
        rt.config.scanner.clone(),
        Arc::new(read),
        store,
        rt.metrics.clone(),
        rt.shutdown.clone(),
    )
    .with_read_breaker(breaker);

    scanner.run().await?;
    Ok(())
}

async fn run_publisher(rt: Runtime) -> anyhow::Result<()> {
    let pool = server::connect_pool(&rt.config).await?;
    let store = Arc::new(PgIngestStore::new(pool));

    let publisher = Publisher::new(
        rt.config.publisher.clone(),
        store,
        Arc::new(TracingSink),
        rt.metrics.clone(),
        rt.shutdown.clone(),
    );

    publisher.run().await?;
    Ok(())
}

async fn run_dispatch(rt: Runtime) -> anyhow::Result<()> {
    if rt.config.dispatcher.handler_kind.is_empty() {
        anyhow::bail!("HANDLER_KIND is required for the dispatch role");
    }

    let pool = server::connect_pool(&rt.config).await?;
    let registry = build_registry();

    let dispatcher = Dispatcher::new(
        rt.config.dispatcher.clone(),
        pool,
        &registry,
        rt.metrics.clone(),
        rt.shutdown.clone(),
    )?;

    dispatcher.run().await?;
    Ok(())
}

async fn run_executor(rt: Runtime) -> anyhow::Result<()> {
    let write_config = rt
        .config
        .write_client
        .clone()
        .ok_or_else(|| anyhow::anyhow!("RPC_WRITE_URL is required for the executor role"))?;

    let pool = server::connect_pool(&rt.config).await?;
    let write = Arc::new(AlloyWriteClient::new(write_config, rt.metrics.clone())?);
    let breaker = write.breaker();

    let executor = DomainExecutor::new(
        rt.config.executor.clone(),
        Arc::new(PgDomainOutbox::new(pool)),
        Arc::new(RawTransactionSubmitter::new(write)),
        rt.metrics.clone(),
        rt.shutdown.clone(),
    )
    .with_write_breaker(breaker);

    executor.run().await?;
    Ok(())
}

async fn run_serve(rt: Runtime) -> anyhow::Result<()> {
    rt.shutdown.wait().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    server::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_help();
        std::process::exit(2);
    };

    match command {
        "ingest" => run_ingest(Runtime::bootstrap()?).await,
        "publisher" => run_publisher(Runtime::bootstrap()?).await,
        "dispatch" => run_dispatch(Runtime::bootstrap()?).await,
        "executor" => run_executor(Runtime::bootstrap()?).await,
        "serve" => run_serve(Runtime::bootstrap()?).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}\n");
            print_help();
            std::process::exit(2);
        }
    }
}
