use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod browser;
mod cache;
mod config;
mod error;
mod extract;
mod listing_finder;
mod models;
mod retry;
mod sink;
#[cfg(test)]
mod testing;
mod traits;

use browser::ChromiumLauncher;
use cache::ResultCache;
use config::Settings;
use listing_finder::{ListingFinder, ProgressFn};
use sink::{CsvSheetSink, MultiSink, RowSink, WebhookSheetSink};
use traits::ClientConfig;

#[derive(Debug, Parser)]
#[command(name = "listing-scraper", version, about = "Scrape client listing sites into spreadsheets")]
struct Cli {
    /// JSON file holding the client configurations
    #[arg(short, long, value_name = "FILE", default_value = "clients.json")]
    clients: PathBuf,

    /// Only scrape these client ids (default: every active client)
    #[arg(long = "client", value_name = "ID")]
    client_ids: Vec<String>,

    /// Ignore cached results and scrape again
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Drop every cached result before running
    #[arg(long, default_value_t = false)]
    clear_cache: bool,

    /// Keep running and repeat on this cron schedule (e.g. "0 0 6 * * *")
    #[arg(long, value_name = "EXPR")]
    cron: Option<String>,
}

/// Everything one run needs, shared with scheduled jobs.
#[derive(Clone)]
struct App {
    finder: ListingFinder,
    sink: Arc<dyn RowSink>,
    clients: Arc<Vec<ClientConfig>>,
    default_sheet: Option<String>,
}

impl App {
    async fn run_once(&self) -> Result<()> {
        self.finder.cache().lock().await.clear_expired().await;

        let result = self.finder.run_clients(&self.clients).await;

        match sink::publish(self.sink.as_ref(), &self.clients, &result, self.default_sheet.as_deref()).await {
            Ok(written) => {
                info!("Wrote {} rows. {}", written, result.summary());
                Ok(())
            }
            Err(e) => {
                error!("Writing rows failed: {}. {}", e, result.summary());
                Err(e.into())
            }
        }
    }
}

fn select_clients(all: Vec<ClientConfig>, ids: &[String]) -> Vec<ClientConfig> {
    if ids.is_empty() {
        all.into_iter().filter(ClientConfig::is_active).collect()
    } else {
        all.into_iter().filter(|c| ids.contains(&c.id)).collect()
    }
}

fn build_sink(settings: &Settings) -> Arc<dyn RowSink> {
    let mut sinks: Vec<Box<dyn RowSink>> = Vec::new();
    if let Some(url) = &settings.sheet_webhook_url {
        sinks.push(Box::new(WebhookSheetSink::new(url.clone())));
    }
    if let Some(dir) = &settings.csv_output_dir {
        sinks.push(Box::new(CsvSheetSink::new(dir.clone())));
    }
    Arc::new(MultiSink::new(sinks))
}

fn log_progress() -> ProgressFn {
    Arc::new(|client: &str, message: &str, percent: Option<u8>| match percent {
        Some(p) => info!("[{}] {} ({}%)", client, message, p),
        None => info!("[{}] {}", client, message),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!("Starting listing scraper");

    let mut settings = Settings::from_env()?;
    settings.scrape.use_cache = !cli.no_cache;

    let clients = select_clients(config::load_clients(&cli.clients)?, &cli.client_ids);
    if clients.is_empty() {
        bail!("no clients selected from {}", cli.clients.display());
    }

    let mut cache = ResultCache::open(&settings.cache_database_url, cache::default_ttl()).await;
    if cli.clear_cache && !cache.is_empty() {
        info!("Clearing {} cached results", cache.len());
        cache.clear().await;
    }

    let launcher = Arc::new(ChromiumLauncher::new(settings.chrome_executable.clone()));
    let app = App {
        finder: ListingFinder::new(launcher, cache, settings.scrape.clone()).with_progress(log_progress()),
        sink: build_sink(&settings),
        clients: Arc::new(clients),
        default_sheet: settings.default_sheet_id.clone(),
    };

    let Some(schedule) = cli.cron else {
        return app.run_once().await;
    };

    // Run once immediately, then on schedule
    if let Err(e) = app.run_once().await {
        error!("Error during initial run: {}", e);
    }

    let sched = JobScheduler::new().await?;
    let job_app = app.clone();
    sched
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let app = job_app.clone();
            Box::pin(async move {
                if let Err(e) = app.run_once().await {
                    error!("Error during scheduled run: {}", e);
                }
            })
        })?)
        .await?;

    info!("Scheduler started with schedule {}", schedule);
    sched.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
