//! # Daybook — journaling service scheduler
//!
//! Runs the recurring-schedule engine: reminder nudges, email report
//! subscriptions, and print subscriptions, plus the manual "send now" paths.
//!
//! Usage:
//!   daybook serve                        # run the dispatch worker loop
//!   daybook tick                         # one scheduler pass (cron-friendly)
//!   daybook send-report --user u1 --days 30
//!   daybook order-print --user u1 --days 90 --address "1 Main St"
//!   daybook digest --user u1 --date 2024-03-09
//!   daybook add-user --id u1 --timezone America/New_York --email a@b.c

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use daybook_channels::{HttpPolisher, HttpRenderer, SmtpReportSender, WebhookNotifier};
use daybook_core::clock::SystemClock;
use daybook_core::{Clock, DaybookConfig, User};
use daybook_engine::digest::{DigestBuilder, Polisher};
use daybook_engine::{
    DispatchWorker, EngineDb, EntryFilter, HttpVendorGateway, PrintOutcome, run_worker_loop,
};

#[derive(Parser)]
#[command(name = "daybook", version, about = "Daybook — journaling service scheduler")]
struct Cli {
    /// Path to config file (default: ~/.daybook/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch worker on its tick interval.
    Serve,
    /// Run a single scheduler pass and exit.
    Tick,
    /// Send an email report for a trailing window, outside the cadence.
    SendReport {
        #[arg(long)]
        user: String,
        /// Trailing window in days, ending today.
        #[arg(long, default_value = "30")]
        days: u32,
        /// Entry selection: daily, individual, or both.
        #[arg(long, default_value = "both")]
        filter: String,
        /// Leave photo entries out of the report.
        #[arg(long)]
        no_images: bool,
    },
    /// Place an ad-hoc print order for a trailing window.
    OrderPrint {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "90")]
        days: u32,
        #[arg(long)]
        address: String,
        /// Print in black and white instead of color.
        #[arg(long)]
        grayscale: bool,
    },
    /// Build one user's daily digest for a given date.
    Digest {
        #[arg(long)]
        user: String,
        /// Journal day (YYYY-MM-DD); defaults to yesterday in the user's zone.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Register a user (operator bootstrap).
    AddUser {
        #[arg(long)]
        id: String,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        #[arg(long)]
        email: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "daybook=debug,daybook_engine=debug,daybook_channels=debug"
    } else {
        "daybook=info,daybook_engine=info,daybook_channels=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => {
            let expanded = shellexpand::tilde(path).to_string();
            DaybookConfig::load_from(std::path::Path::new(&expanded))?
        }
        None => DaybookConfig::load()?,
    };

    let db_path = shellexpand::tilde(&config.database.path).to_string();
    let db = Arc::new(EngineDb::open(std::path::Path::new(&db_path))?);

    match cli.command {
        Command::Serve => {
            let worker = Arc::new(build_worker(db, &config)?);
            run_worker_loop(worker, config.engine.tick_interval_secs).await;
            Ok(())
        }
        Command::Tick => {
            let worker = build_worker(db, &config)?;
            let summary = worker.tick().await;
            println!(
                "tick: {} reminders, {} emails, {} prints, {} polled, {} digests, {} failures",
                summary.reminders_sent,
                summary.emails_sent,
                summary.prints_fulfilled,
                summary.orders_polled,
                summary.digests_built,
                summary.failures,
            );
            Ok(())
        }
        Command::SendReport {
            user,
            days,
            filter,
            no_images,
        } => {
            let filter = EntryFilter::parse(&filter)
                .ok_or_else(|| anyhow::anyhow!("unknown filter '{filter}'"))?;
            let worker = build_worker(db, &config)?;
            let sent = worker
                .send_report_now(&user, days, filter, !no_images)
                .await?;
            println!("report sent: {sent} entries");
            Ok(())
        }
        Command::OrderPrint {
            user,
            days,
            address,
            grayscale,
        } => {
            let worker = build_worker(db, &config)?;
            match worker
                .order_print_now(&user, days, &address, !grayscale)
                .await?
            {
                PrintOutcome::Submitted(order) => {
                    println!(
                        "order {} submitted: {} entries, {} pages",
                        order.id, order.entry_count, order.page_count
                    );
                }
                PrintOutcome::EmptyPeriod(order) => {
                    println!("order {}: no entries in period, nothing printed", order.id);
                }
            }
            Ok(())
        }
        Command::Digest { user, date } => {
            let digests = DigestBuilder::new(db.clone(), build_polisher(&config)?);
            let clock = SystemClock;
            let date = match date {
                Some(date) => date,
                None => {
                    let u = db
                        .get_user(&user)?
                        .ok_or_else(|| anyhow::anyhow!("unknown user '{user}'"))?;
                    clock.today_in(u.tz()?) - chrono::Duration::days(1)
                }
            };
            match digests.build(&user, date, clock.now_utc()).await? {
                Some(entry) => println!("digest built for {date}: {} chars", entry.body.len()),
                None => println!("nothing to digest for {date}"),
            }
            Ok(())
        }
        Command::AddUser { id, timezone, email } => {
            let mut user = User::new(&id, &timezone, SystemClock.now_utc());
            if let Some(email) = email {
                user = user.with_email(&email);
            }
            db.upsert_user(&user)?;
            println!("user {id} registered ({timezone})");
            Ok(())
        }
    }
}

fn build_worker(db: Arc<EngineDb>, config: &DaybookConfig) -> Result<DispatchWorker> {
    let vendor = HttpVendorGateway::new(
        &config.vendor.base_url,
        &config.vendor.api_key,
        config.vendor.timeout_secs,
    )?;
    let renderer = HttpRenderer::new(config.render.clone())?;
    let digests = DigestBuilder::new(db.clone(), build_polisher(config)?);

    Ok(DispatchWorker::new(
        db.clone(),
        Arc::new(SystemClock),
        Arc::new(WebhookNotifier::new(config.notify.clone())),
        Arc::new(SmtpReportSender::new(db, config.smtp.clone())),
        Arc::new(renderer),
        Arc::new(vendor),
        digests,
        config.engine.clone(),
    ))
}

fn build_polisher(config: &DaybookConfig) -> Result<Option<Arc<dyn Polisher>>> {
    if config.polish.enabled {
        Ok(Some(Arc::new(HttpPolisher::new(config.polish.clone())?)))
    } else {
        Ok(None)
    }
}
