use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::cache::ResultCache;
use crate::config::{DetailMode, ScrapeSettings};
use crate::error::{Result, ScrapeError};
use crate::extract::detail::{blocked_resources, extract_detail};
use crate::extract::listing::extract_listings;
use crate::models::{ClientFailure, Field, ListingRecord, RunResult};
use crate::traits::{BrowserLauncher, BrowserSession, ClientConfig};

/// Progress callback: `(client id or "all", message, percent)`.
pub type ProgressFn = Arc<dyn Fn(&str, &str, Option<u8>) + Send + Sync>;

pub const ALL_CLIENTS: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    Navigating,
    ExtractingListings,
    ExtractingDetails(usize),
    Caching,
    Done,
    Failed,
}

#[derive(Clone)]
pub struct ListingFinder {
    launcher: Arc<dyn BrowserLauncher>,
    cache: Arc<Mutex<ResultCache>>,
    settings: ScrapeSettings,
    progress: Option<ProgressFn>,
}

impl ListingFinder {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, cache: ResultCache, settings: ScrapeSettings) -> Self {
        Self {
            launcher,
            cache: Arc::new(Mutex::new(cache)),
            settings,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cache(&self) -> Arc<Mutex<ResultCache>> {
        Arc::clone(&self.cache)
    }

    fn report(&self, client: &str, message: &str, percent: Option<u8>) {
        if let Some(progress) = &self.progress {
            progress(client, message, percent);
        }
    }

    fn enter(&self, config: &ClientConfig, phase: ClientPhase) {
        debug!("{} -> {:?}", config.name, phase);
    }

    /// Scrapes every client, a batch at a time, and collects the outcome.
    ///
    /// A failing client never aborts its siblings.
    pub async fn run_clients(&self, configs: &[ClientConfig]) -> RunResult {
        let mut result = RunResult::default();
        let batch_size = self.settings.batch_size.max(1);
        let batches = configs.len().div_ceil(batch_size);

        self.report(ALL_CLIENTS, &format!("Scraping {} clients", configs.len()), Some(0));

        for (index, batch) in configs.chunks(batch_size).enumerate() {
            if index > 0 {
                sleep(self.settings.batch_delay).await;
            }
            info!("Processing batch {}/{} ({} clients)", index + 1, batches, batch.len());

            let outcomes = futures::future::join_all(
                batch
                    .iter()
                    .map(|config| async move { (config, self.run_client(config).await) }),
            )
            .await;

            for (config, outcome) in outcomes {
                match outcome {
                    Ok(records) => {
                        result.successful_clients.push(config.name.clone());
                        result.rows.extend(records);
                    }
                    Err(e) => {
                        error!("Scrape failed for {}: {}", config.name, e);
                        result.failed_clients.push(ClientFailure {
                            name: config.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }

            let percent = ((index + 1) * 100 / batches.max(1)).min(100) as u8;
            self.report(
                ALL_CLIENTS,
                &format!("Finished batch {}/{}", index + 1, batches),
                Some(percent),
            );
        }

        if result.is_total_failure() {
            error!("Every client failed: {}", result.summary());
        } else {
            info!("{}", result.summary());
        }
        self.report(ALL_CLIENTS, &result.summary(), Some(100));

        result
    }

    /// Returns cached records when fresh, otherwise scrapes the client and caches the result.
    pub async fn run_client(&self, config: &ClientConfig) -> Result<Vec<ListingRecord>> {
        let key = config.cache_key();
        self.report(&config.id, &format!("Starting {}", config.name), Some(0));

        if self.settings.use_cache
            && let Some(records) = self.cache.lock().await.get(&key).await
        {
            info!("Using {} cached listings for {}", records.len(), config.name);
            self.report(&config.id, &format!("Loaded {} cached listings", records.len()), Some(100));
            return Ok(records);
        }

        let records = match self.scrape_fresh(config).await {
            Ok(records) => records,
            Err(e) => {
                self.enter(config, ClientPhase::Failed);
                self.report(&config.id, &format!("Failed: {e}"), None);
                return Err(e);
            }
        };

        self.enter(config, ClientPhase::Caching);
        if records.is_empty() {
            warn!("No listings extracted for {}; not caching", config.name);
        } else {
            self.cache.lock().await.set(&key, records.clone()).await;
        }

        self.enter(config, ClientPhase::Done);
        info!("Scraped {} listings for {}", records.len(), config.name);
        self.report(&config.id, &format!("Scraped {} listings", records.len()), Some(100));
        Ok(records)
    }

    async fn scrape_fresh(&self, config: &ClientConfig) -> Result<Vec<ListingRecord>> {
        self.enter(config, ClientPhase::Navigating);

        let limit = self.settings.client_timeout;
        let mut session: Option<Box<dyn BrowserSession>> = None;
        let outcome = timeout(limit, async {
            let session = session.insert(self.launcher.launch().await?);
            self.scrape_with(session.as_ref(), config).await
        })
        .await;

        // Pages abandoned by a timeout go down with the browser.
        if let Some(mut session) = session
            && let Err(e) = session.close().await
        {
            warn!("Failed to close browser for {}: {}", config.name, e);
        }

        outcome.unwrap_or_else(|_| {
            Err(ScrapeError::ClientTimeout {
                seconds: limit.as_secs(),
            })
        })
    }

    async fn scrape_with(&self, session: &dyn BrowserSession, config: &ClientConfig) -> Result<Vec<ListingRecord>> {
        self.enter(config, ClientPhase::ExtractingListings);
        let records = self.load_listings(session, config).await?;
        self.report(&config.id, &format!("Found {} listings", records.len()), Some(10));

        Ok(self.enrich(session, config, records).await)
    }

    async fn load_listings(&self, session: &dyn BrowserSession, config: &ClientConfig) -> Result<Vec<ListingRecord>> {
        let timeouts = self.settings.timeouts;
        let label = format!("Listings page of {}", config.name);

        self.settings
            .retry
            .run(&label, |_| async move {
                let mut page = session.new_page().await?;
                if let Err(e) = page.block_requests(&blocked_resources()).await {
                    debug!("Resource blocking unavailable: {}", e);
                }

                let result = extract_listings(page.as_mut(), config, timeouts).await;

                if let Err(e) = page.close().await {
                    debug!("Failed to close listings page: {}", e);
                }
                result
            })
            .await
    }

    async fn enrich(
        &self,
        session: &dyn BrowserSession,
        config: &ClientConfig,
        records: Vec<ListingRecord>,
    ) -> Vec<ListingRecord> {
        let total = records.len();
        if total == 0 || !config.field_map.has_detail_rules() {
            return records;
        }
        self.enter(config, ClientPhase::ExtractingDetails(total));

        match self.settings.detail_mode {
            DetailMode::Sequential { delay } => {
                let mut enriched = Vec::with_capacity(total);
                for (index, mut record) in records.into_iter().enumerate() {
                    if index > 0 {
                        sleep(delay).await;
                    }
                    self.enrich_one(session, config, &mut record, index, total).await;
                    enriched.push(record);
                }
                enriched
            }
            DetailMode::Parallel { limit } => {
                stream::iter(records.into_iter().enumerate())
                    .map(|(index, mut record)| async move {
                        self.enrich_one(session, config, &mut record, index, total).await;
                        record
                    })
                    .buffered(limit.max(1))
                    .collect()
                    .await
            }
        }
    }

    async fn enrich_one(
        &self,
        session: &dyn BrowserSession,
        config: &ClientConfig,
        record: &mut ListingRecord,
        index: usize,
        total: usize,
    ) {
        let Some(link) = record.link().map(str::to_string) else {
            return;
        };

        let partial = extract_detail(session, &link, config, self.settings.timeouts, &self.settings.retry).await;
        record.merge(partial);
        record.set(Field::Brand, config.name.clone());

        let percent = 10 + (80 * (index + 1) / total) as u8;
        self.report(
            &config.id,
            &format!("Processed listing {}/{}", index + 1, total),
            Some(percent),
        );
    }
}
