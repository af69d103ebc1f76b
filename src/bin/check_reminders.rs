use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use petcare_relay::config;
use petcare_relay::notifier::SmtpNotifier;
use petcare_relay::reminder::{compose, is_due, ReminderDispatcher, TickSlot};
use petcare_relay::store;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single reminder check and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Evaluate at this local time ("YYYY-MM-DD HH:MM") instead of now
    #[arg(long, value_parser = parse_instant)]
    at: Option<NaiveDateTime>,

    /// Print the reminders that would fire without sending or logging anything
    #[arg(long)]
    dry_run: bool,
}

fn parse_instant(s: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").map_err(|e| format!("{s}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let now = args.at.unwrap_or_else(|| Local::now().naive_local());

    let store = store::connect(&cfg.store)
        .await
        .context("failed to initialise record store")?;

    if args.dry_run {
        let slot = TickSlot::capture(now);
        let rows = store.active_reminders().await?;
        let mut reminders = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                Ok(reminder) => reminders.push(reminder),
                Err(bad) => warn!(reminder_id = %bad.reminder_id, reason = %bad.reason, "skipping unusable reminder row"),
            }
        }
        let due: Vec<_> = reminders.iter().filter(|r| is_due(&r.reminder, &slot)).collect();
        info!(evaluated = reminders.len(), due = due.len(), time = %slot.time, "dry run");
        for row in due {
            let (subject, body) = compose(row);
            println!(
                "to: {}\nsubject: {}\n\n{}",
                row.contact.owner_email.as_deref().unwrap_or("<no owner email>"),
                subject,
                body
            );
        }
        return Ok(());
    }

    let notifier = Arc::new(SmtpNotifier::from_config(&cfg.smtp).context("invalid SMTP settings")?);
    let mut dispatcher = ReminderDispatcher::new(store, notifier, false);
    let report = dispatcher.tick(now).await?;
    info!(?report, "reminder check complete");
    Ok(())
}
