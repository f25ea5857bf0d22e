//! Operator tooling: migrations, range replay, failure resets, status.

use sqlx::postgres::PgPoolOptions;

use logflume::executor::CommandSource;
use logflume::infra::postgres::{PgDomainOutbox, PgIngestStore, PgInboxStore};
use logflume::metrics::MetricsRegistry;
use logflume::rpc::{AlloyReadClient, ReadClient, ReadClientConfig};

fn print_help() {
    eprintln!(
        "\
logflume-admin

USAGE:
  logflume-admin <command> [options]

COMMANDS:
  migrate          Run database migrations
  replay           Upsert inbox rows back to PENDING for a block range
  reset-failures   Reset FAIL (and optionally DLQ) inbox rows to PENDING
  status           Dump head, cursors, outbox and inbox counts

COMMON OPTIONS:
  --database-url <postgres_url>   (defaults to env DATABASE_URL)

replay OPTIONS:
  --handler <kind>                (required) Handler kind to replay for
  --from <block>                  (required) First block, inclusive
  --to <block>                    (required) Last block, inclusive

reset-failures OPTIONS:
  --handler <kind>                (required) Handler kind to reset
  --dlq                           Also reset DLQ rows

status OPTIONS:
  --rpc-read-url <url>            (defaults to env RPC_READ_URL; head is
                                  omitted when neither is set)"
    );
}

#[derive(Default)]
struct Options {
    database_url: Option<String>,
    rpc_read_url: Option<String>,
    handler: Option<String>,
    from: Option<u64>,
    to: Option<u64>,
    dlq: bool,
}

fn parse_options(args: &[String]) -> anyhow::Result<Options> {
    let mut options = Options::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let mut take_value = |name: &str| -> anyhow::Result<String> {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{name} requires a value"))
        };

        match arg.as_str() {
            "--database-url" => options.database_url = Some(take_value("--database-url")?),
            "--rpc-read-url" => options.rpc_read_url = Some(take_value("--rpc-read-url")?),
            "--handler" => options.handler = Some(take_value("--handler")?),
            "--from" => options.from = Some(take_value("--from")?.parse()?),
            "--to" => options.to = Some(take_value("--to")?.parse()?),
            "--dlq" => options.dlq = true,
            other => anyhow::bail!("unknown option: {other}"),
        }
    }

    Ok(options)
}

fn require_database_url(options: &Options) -> anyhow::Result<String> {
    options
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required (or pass --database-url)"))
}

async fn connect(options: &Options) -> anyhow::Result<sqlx::PgPool> {
    let url = require_database_url(options)?;
    let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
    Ok(pool)
}

async fn cmd_migrate(options: Options) -> anyhow::Result<()> {
    let pool = connect(&options).await?;
    logflume::migrations::run_postgres(&pool).await?;
    println!("migrations applied");
    Ok(())
}

async fn cmd_replay(options: Options) -> anyhow::Result<()> {
    let handler = options
        .handler
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--handler is required"))?;
    let from = options
        .from
        .ok_or_else(|| anyhow::anyhow!("--from is required"))?;
    let to = options
        .to
        .ok_or_else(|| anyhow::anyhow!("--to is required"))?;
    if from > to {
        anyhow::bail!("--from must not exceed --to");
    }

    let pool = connect(&options).await?;
    let inbox = PgInboxStore::new(pool);
    let (inserted, reset) = inbox.replay_range(&handler, from, to).await?;

    println!("replayed [{from}, {to}] for {handler}: inserted={inserted} reset={reset}");
    Ok(())
}

async fn cmd_reset_failures(options: Options) -> anyhow::Result<()> {
    let handler = options
        .handler
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--handler is required"))?;

    let pool = connect(&options).await?;
    let inbox = PgInboxStore::new(pool);
    let reset = inbox.reset_failures(&handler, options.dlq).await?;

    let scope = if options.dlq { "FAIL+DLQ" } else { "FAIL" };
    println!("reset {reset} {scope} rows to PENDING for {handler}");
    Ok(())
}

async fn cmd_status(options: Options) -> anyhow::Result<()> {
    let pool = connect(&options).await?;
    let ingest = PgIngestStore::new(pool.clone());
    let inbox = PgInboxStore::new(pool.clone());
    let outbox = PgDomainOutbox::new(pool);

    let rpc_url = options
        .rpc_read_url
        .clone()
        .or_else(|| std::env::var("RPC_READ_URL").ok());

    match rpc_url {
        Some(url) => {
            let client = AlloyReadClient::new(
                ReadClientConfig {
                    url,
                    ..ReadClientConfig::default()
                },
                std::sync::Arc::new(MetricsRegistry::new()),
            )?;
            match client.get_head_block().await {
                Ok(head) => println!("head: {head}"),
                Err(e) => println!("head: unavailable ({e})"),
            }
        }
        None => println!("head: unavailable (no RPC_READ_URL)"),
    }

    println!("cursors:");
    for (id, block) in ingest.cursors().await? {
        println!("  {id}: {block}");
    }

    println!("ingest outbox pending: {}", ingest.pending_outbox_count().await?);

    println!("inbox:");
    for row in inbox.status_counts().await? {
        println!("  {} {}: {}", row.handler_kind, row.status, row.count);
    }

    println!("domain outbox pending: {}", outbox.count_pending().await?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        print_help();
        std::process::exit(2);
    };

    let options = parse_options(&args[1..])?;

    match command {
        "migrate" => cmd_migrate(options).await,
        "replay" => cmd_replay(options).await,
        "reset-failures" => cmd_reset_failures(options).await,
        "status" => cmd_status(options).await,
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
