//! Flashsale CLI
//!
//! Drives the library against Redis (`--redis-url`) or an in-process store.
//!
//! ```text
//! flashsale next-id --prefix order --count 5
//! flashsale simulate --stock 1 --users 50 --attempts 2 --metrics
//! flashsale shop --id 1 --strategy logical --repeat 3
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashsale::adapters::{InMemoryKeyValueStore, InMemoryVoucherStore, RedisKeyValueStore};
use flashsale::cache::CacheClient;
use flashsale::domain::{KeyValueStore, RequestContext, SeckillVoucher, UserId, VoucherId};
use flashsale::error::{Error, Result};
use flashsale::id_generator::IdGenerator;
use flashsale::seckill::{ReservationOutcome, VoucherOrderService};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flashsale - cache-aside caching and seckill ordering over Redis
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis URL; an in-process store is used when absent
    #[arg(long, env = "FLASHSALE_REDIS_URL", global = true)]
    redis_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mint ids and print their layout
    NextId {
        /// Business prefix of the daily sequence
        #[arg(long, default_value = "order")]
        prefix: String,

        /// Number of ids to mint
        #[arg(long, default_value = "1")]
        count: u32,
    },

    /// Race concurrent users for a seckill voucher
    Simulate {
        /// Initial stock of the voucher
        #[arg(long, default_value = "1")]
        stock: i64,

        /// Distinct users
        #[arg(long, default_value = "50")]
        users: u64,

        /// Concurrent attempts per user
        #[arg(long, default_value = "1")]
        attempts: u32,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Read a demo shop through the cache
    Shop {
        /// Shop id (1-3 exist)
        #[arg(long)]
        id: u64,

        /// Cache strategy
        #[arg(long, value_enum, default_value_t = Strategy::PassThrough)]
        strategy: Strategy,

        /// Cache TTL in seconds
        #[arg(long, default_value = "1800")]
        ttl_secs: u64,

        /// Number of reads
        #[arg(long, default_value = "1")]
        repeat: u32,

        /// Print Prometheus metrics after the reads
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    PassThrough,
    Logical,
    Mutex,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let kv = connect(args.redis_url.as_deref()).await?;

    match args.command {
        Command::NextId { prefix, count } => next_id(kv, &prefix, count).await,
        Command::Simulate {
            stock,
            users,
            attempts,
            metrics,
        } => simulate(kv, stock, users, attempts, metrics).await,
        Command::Shop {
            id,
            strategy,
            ttl_secs,
            repeat,
            metrics,
        } => shop(kv, id, strategy, Duration::from_secs(ttl_secs), repeat, metrics).await,
    }
}

async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn KeyValueStore>> {
    match redis_url {
        Some(url) => {
            let store = RedisKeyValueStore::connect(url).await?;
            info!("Connected to Redis");
            Ok(Arc::new(store))
        }
        None => {
            info!("No Redis URL given, using in-process store");
            Ok(Arc::new(InMemoryKeyValueStore::new()))
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

async fn next_id(kv: Arc<dyn KeyValueStore>, prefix: &str, count: u32) -> Result<()> {
    let ids = IdGenerator::new(kv);
    for _ in 0..count {
        let id = ids.next_id(prefix).await?;
        let issued_at = id
            .issued_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\tissued_at={}\tsequence={}",
            id,
            issued_at,
            id.sequence()
        );
    }
    Ok(())
}

async fn simulate(
    kv: Arc<dyn KeyValueStore>,
    stock: i64,
    users: u64,
    attempts: u32,
    metrics: bool,
) -> Result<()> {
    let voucher_id = VoucherId(1);
    let now = chrono::Utc::now();
    let store = InMemoryVoucherStore::new();
    store.put_voucher(SeckillVoucher::new(
        voucher_id,
        stock,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::hours(1),
    ));

    let service = Arc::new(VoucherOrderService::new(Arc::new(store.clone()), kv));
    info!(stock, users, attempts, "Starting seckill simulation");

    let mut handles = Vec::new();
    for user in 1..=users {
        for _ in 0..attempts {
            let service = Arc::clone(&service);
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new(UserId(user));
                service.seckill_voucher(&ctx, voucher_id).await
            }));
        }
    }

    let mut committed = 0u64;
    for handle in handles {
        let outcome = handle
            .await
            .map_err(|e| Error::Internal(format!("reservation task failed: {}", e)))?;
        match outcome {
            Ok(ReservationOutcome::Committed(_)) => committed += 1,
            Ok(ReservationOutcome::Rejected(_)) => {}
            Err(e) => warn!(error = %e, "Reservation errored"),
        }
    }

    let stats = service.stats();
    println!("attempts:           {}", stats.attempts);
    println!("committed:          {}", committed);
    println!("insufficient_stock: {}", stats.insufficient_stock);
    println!("already_ordered:    {}", stats.already_ordered);
    println!("lock_contention:    {}", stats.lock_contention);
    println!("failures:           {}", stats.failures);
    println!(
        "remaining stock:    {}",
        store.stock(voucher_id).unwrap_or_default()
    );

    if metrics {
        print!("{}", flashsale::metrics::render(None, Some(&stats))?);
    }
    Ok(())
}

const SHOP_KEY_PREFIX: &str = "cache:shop:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Shop {
    id: u64,
    name: String,
    area: String,
}

/// Stand-in for the database query behind the cache
async fn load_shop(id: u64) -> Result<Option<Shop>> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    let found = match id {
        1 => Some(("Tea House", "Downtown")),
        2 => Some(("Noodle Bar", "Harbor")),
        3 => Some(("Bakery", "Old Town")),
        _ => None,
    };
    Ok(found.map(|(name, area)| Shop {
        id,
        name: name.to_string(),
        area: area.to_string(),
    }))
}

async fn shop(
    kv: Arc<dyn KeyValueStore>,
    id: u64,
    strategy: Strategy,
    ttl: Duration,
    repeat: u32,
    metrics: bool,
) -> Result<()> {
    let client = CacheClient::new(kv)?;
    let loader = Arc::new(load_shop);

    if strategy == Strategy::Logical {
        // Hot keys are warmed ahead of time
        if let Some(shop) = load_shop(id).await? {
            let key = flashsale::cache::cache_key(SHOP_KEY_PREFIX, id);
            client.set_with_logical_expire(&key, &shop, ttl).await?;
        }
    }

    for _ in 0..repeat {
        let found: Option<Shop> = match strategy {
            Strategy::PassThrough => {
                client
                    .query_with_pass_through(SHOP_KEY_PREFIX, id, loader.as_ref(), ttl)
                    .await?
            }
            Strategy::Mutex => {
                client
                    .query_with_mutex(SHOP_KEY_PREFIX, id, loader.as_ref(), ttl)
                    .await?
            }
            Strategy::Logical => {
                client
                    .query_with_logical_expire(SHOP_KEY_PREFIX, id, Arc::clone(&loader), ttl)
                    .await?
            }
        };
        match found {
            Some(shop) => println!("{}", serde_json::to_string(&shop)?),
            None => println!("shop {} not found", id),
        }
    }

    let stats = client.stats();
    info!(
        hits = stats.hits,
        null_hits = stats.null_hits,
        misses = stats.misses,
        loader_calls = stats.loader_calls,
        hit_ratio = client.hit_ratio(),
        "Cache statistics"
    );
    if metrics {
        print!("{}", flashsale::metrics::render(Some(&stats), None)?);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let redis_directive: Directive = "redis=warn"
        .parse()
        .map_err(|e| Error::Config(format!("invalid log directive: {}", e)))?;
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(redis_directive);

    // Logs go to stderr so command output stays pipeable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}
