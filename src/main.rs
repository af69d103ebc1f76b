use anyhow::{anyhow, Context, Result};
use clap::Parser;
use petcare_relay::config;
use petcare_relay::normalizer::TelemetryClass;
use petcare_relay::notifier::SmtpNotifier;
use petcare_relay::reminder::ReminderDispatcher;
use petcare_relay::store;
use petcare_relay::worker::SubscriptionWorker;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let store = store::connect(&cfg.store)
        .await
        .context("failed to initialise record store")?;
    let notifier = Arc::new(SmtpNotifier::from_config(&cfg.smtp).context("invalid SMTP settings")?);

    // Dispatcher and workers share nothing but the store handle.
    let dispatcher = ReminderDispatcher::new(store.clone(), notifier, cfg.reminders.dedup);
    let poll_interval = cfg.reminders.poll_interval();
    tokio::spawn(dispatcher.run_forever(poll_interval));

    let mut workers = Vec::new();
    for (class, settings) in [
        (TelemetryClass::Health, cfg.workers.health.clone()),
        (TelemetryClass::Feeding, cfg.workers.feeding.clone()),
    ] {
        let worker = SubscriptionWorker::new(class, settings, store.clone());
        let broker = cfg.broker.clone();
        workers.push(tokio::spawn(async move {
            let err = worker.run(&broker).await;
            (worker.class(), err)
        }));
    }

    info!("petcare relay started");
    let (finished, _, _) = tokio::select! {
        res = futures::future::select_all(workers) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            return Ok(());
        }
    };

    let (class, err) = finished.context("worker task panicked")?;
    error!(worker = class.as_str(), error = %err, "subscription worker stopped");
    Err(anyhow!("{} worker stopped: {}", class.as_str(), err))
}
