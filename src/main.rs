use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use coupon_ledger::config::{Config, StoreBackend};
use coupon_ledger::{
    CouponError, CouponResult, CouponService, CouponStore, Database, DiscountKind, MemoryStore,
    NewCoupon, Redemption,
};

#[derive(Parser)]
#[command(name = "coupon-ledger", version, about = "Manage and redeem discount coupons")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new active coupon
    Create(CreateArgs),
    /// List all coupons
    List,
    /// Show one coupon
    Show { code: String },
    /// Re-enable a coupon
    Activate { code: String },
    /// Disable a coupon
    Deactivate { code: String },
    /// Check a coupon against an order without redeeming it
    Validate(OrderArgs),
    /// Redeem a coupon against an order
    Apply(OrderArgs),
    /// List redemptions of a coupon
    Redemptions { code: String },
    /// Deactivate expired coupons once
    Sweep,
    /// Run the expiry sweep on SWEEP_SCHEDULE until interrupted
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Percentage,
    FixedAmount,
}

impl From<KindArg> for DiscountKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Percentage => Self::Percentage,
            KindArg::FixedAmount => Self::FixedAmount,
        }
    }
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    code: String,
    #[arg(long, value_enum)]
    kind: KindArg,
    /// Percentage points or currency amount
    #[arg(long)]
    value: Decimal,
    #[arg(long)]
    min_order: Option<Decimal>,
    /// Cap for percentage coupons
    #[arg(long)]
    max_discount: Option<Decimal>,
    #[arg(long)]
    usage_limit: i64,
    #[arg(long)]
    per_user_limit: Option<i64>,
    /// RFC 3339 timestamp
    #[arg(long)]
    valid_from: DateTime<Utc>,
    /// RFC 3339 timestamp
    #[arg(long)]
    valid_until: DateTime<Utc>,
}

#[derive(Args)]
struct OrderArgs {
    code: String,
    #[arg(long)]
    user: String,
    #[arg(long)]
    amount: Decimal,
}

const EXIT_APPLIED: u8 = 0;
/// Exit status of `apply` when the coupon is refused
const EXIT_REJECTED: u8 = 2;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let service = CouponService::new(open_store(&config.backend).await?);

    match cli.command {
        Command::Create(args) => {
            let coupon = service
                .create(NewCoupon {
                    code: args.code,
                    discount_kind: args.kind.into(),
                    discount_value: args.value,
                    minimum_order_amount: args.min_order,
                    maximum_discount_amount: args.max_discount,
                    usage_limit: args.usage_limit,
                    per_user_limit: args.per_user_limit,
                    valid_from: args.valid_from,
                    valid_until: args.valid_until,
                })
                .await?;
            print_json(&coupon)?;
        }
        Command::List => print_json(&service.list().await?)?,
        Command::Show { code } => print_json(&service.get(&code).await?)?,
        Command::Activate { code } => print_json(&service.activate(&code).await?)?,
        Command::Deactivate { code } => print_json(&service.deactivate(&code).await?)?,
        Command::Validate(order) => {
            let check = service
                .validate(&order.code, &order.user, order.amount)
                .await?;
            print_json(&check)?;
        }
        Command::Apply(order) => {
            let result = service.apply(&order.code, &order.user, order.amount).await;
            return Ok(ExitCode::from(report_apply(&order.code, result)?));
        }
        Command::Redemptions { code } => print_json(&service.redemptions(&code).await?)?,
        Command::Sweep => print_json(&service.sweep_expired().await?)?,
        Command::Watch => watch(service, &config.sweep_schedule).await?,
    }

    Ok(ExitCode::SUCCESS)
}

async fn open_store(backend: &StoreBackend) -> Result<Arc<dyn CouponStore>> {
    Ok(match backend {
        StoreBackend::Sqlite {
            url,
            max_connections,
        } => {
            let database = Database::new(url, *max_connections)
                .await
                .with_context(|| format!("opening database {url}"))?;
            Arc::new(database)
        }
        StoreBackend::Memory => {
            warn!("DATABASE_URL=memory - coupons will not outlive this process");
            Arc::new(MemoryStore::new())
        }
    })
}

async fn watch(service: CouponService, schedule: &str) -> Result<()> {
    info!("Starting coupon expiry sweeper");

    // Run once immediately
    if let Err(e) = service.sweep_expired().await {
        error!("Error during initial sweep: {}", e);
    }

    let mut sched = JobScheduler::new().await?;

    let job_service = service.clone();
    sched
        .add(Job::new_async(schedule, move |_uuid, _l| {
            let service = job_service.clone();
            Box::pin(async move {
                if let Err(e) = service.sweep_expired().await {
                    error!("Error sweeping expired coupons: {}", e);
                }
            })
        })?)
        .await?;

    info!("Scheduler started - sweeping on '{}'", schedule);
    sched.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down sweeper");
    sched.shutdown().await?;

    Ok(())
}

/// Prints the outcome of `apply` and picks the process exit status.
fn report_apply(code: &str, result: CouponResult<Redemption>) -> Result<u8> {
    match result {
        Ok(redemption) => {
            print_json(&redemption)?;
            Ok(EXIT_APPLIED)
        }
        Err(CouponError::Rejected(reason)) => {
            error!("Coupon {} not applied: {}", code, reason);
            print_json(&reason)?;
            Ok(EXIT_REJECTED)
        }
        Err(e) => Err(e).context("applying coupon"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
