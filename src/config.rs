//! Environment-driven settings and client configuration loading

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{Result, ScrapeError};
use crate::extract::listing::PageTimeouts;
use crate::retry::RetryPolicy;
use crate::traits::ClientConfig;

/// How detail pages of one client are visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailMode {
    /// One page at a time with a pause between requests
    Sequential { delay: Duration },
    /// At most `limit` pages in flight
    Parallel { limit: usize },
}

const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_DETAIL_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    pub detail_mode: DetailMode,
    pub timeouts: PageTimeouts,
    pub client_timeout: Duration,
    pub retry: RetryPolicy,
    pub use_cache: bool,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            batch_size: 2,
            batch_delay: Duration::from_secs(5),
            detail_mode: DetailMode::Parallel {
                limit: DEFAULT_DETAIL_CONCURRENCY,
            },
            timeouts: PageTimeouts {
                navigation: Duration::from_secs(60),
                selector: Duration::from_secs(30),
            },
            client_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache_database_url: String,
    pub sheet_webhook_url: Option<String>,
    pub csv_output_dir: Option<PathBuf>,
    pub default_sheet_id: Option<String>,
    pub chrome_executable: Option<PathBuf>,
    pub scrape: ScrapeSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let defaults = ScrapeSettings::default();

        let production = var("SCRAPER_ENV").is_some_and(|env| env.eq_ignore_ascii_case("production"));
        let sequential = production || parse_var::<bool>(&var, "SEQUENTIAL_DETAILS")?.unwrap_or(false);

        let request_delay = millis(&var, "REQUEST_DELAY_MS", DEFAULT_REQUEST_DELAY)?;
        let detail_concurrency = parse_var::<usize>(&var, "DETAIL_CONCURRENCY")?
            .unwrap_or(DEFAULT_DETAIL_CONCURRENCY)
            .max(1);

        // Sequential wins whenever it is requested.
        let detail_mode = if sequential {
            DetailMode::Sequential { delay: request_delay }
        } else {
            DetailMode::Parallel {
                limit: detail_concurrency,
            }
        };

        let batch_size = if production {
            1
        } else {
            parse_var::<usize>(&var, "SCRAPE_BATCH_SIZE")?
                .unwrap_or(defaults.batch_size)
                .max(1)
        };

        let scrape = ScrapeSettings {
            batch_size,
            batch_delay: millis(&var, "BATCH_DELAY_MS", defaults.batch_delay)?,
            detail_mode,
            timeouts: PageTimeouts {
                navigation: secs(&var, "NAVIGATION_TIMEOUT_SECS", defaults.timeouts.navigation)?,
                selector: secs(&var, "SELECTOR_TIMEOUT_SECS", defaults.timeouts.selector)?,
            },
            client_timeout: secs(&var, "CLIENT_TIMEOUT_SECS", defaults.client_timeout)?,
            retry: RetryPolicy::new(
                parse_var::<u32>(&var, "MAX_ATTEMPTS")?.unwrap_or(defaults.retry.max_attempts),
                millis(&var, "RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
            ),
            use_cache: defaults.use_cache,
        };

        let settings = Self {
            cache_database_url: var("CACHE_DATABASE_URL")
                .unwrap_or_else(|| "sqlite:database/cache.db".to_string()),
            sheet_webhook_url: var("SHEET_WEBHOOK_URL"),
            csv_output_dir: var("CSV_OUTPUT_DIR").map(PathBuf::from),
            default_sheet_id: var("DEFAULT_SHEET_ID"),
            chrome_executable: var("CHROME_EXECUTABLE").map(PathBuf::from),
            scrape,
        };

        if settings.sheet_webhook_url.is_none() && settings.csv_output_dir.is_none() {
            return Err(ScrapeError::config(
                "set SHEET_WEBHOOK_URL or CSV_OUTPUT_DIR so rows have somewhere to go",
            ));
        }

        Ok(settings)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(key)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| ScrapeError::config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

fn millis(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    Ok(parse_var(var, key)?.map_or(default, Duration::from_millis))
}

fn secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    Ok(parse_var(var, key)?.map_or(default, Duration::from_secs))
}

/// Reads and validates every client configuration in a JSON array file.
pub fn load_clients(path: &Path) -> Result<Vec<ClientConfig>> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        ScrapeError::config(format!("cannot read client file {}: {e}", path.display()))
    })?;
    let clients = parse_clients(&raw)?;
    info!("Loaded {} client configurations from {}", clients.len(), path.display());
    Ok(clients)
}

pub fn parse_clients(raw: &str) -> Result<Vec<ClientConfig>> {
    let clients: Vec<ClientConfig> = serde_json::from_str(raw)
        .map_err(|e| ScrapeError::config(format!("invalid client configuration: {e}")))?;

    for client in &clients {
        client.listings_url()?;
    }

    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_with_csv_sink() {
        let settings = settings(&[("CSV_OUTPUT_DIR", "out")]).unwrap();

        assert_eq!(settings.cache_database_url, "sqlite:database/cache.db");
        assert_eq!(settings.scrape.batch_size, 2);
        assert_eq!(settings.scrape.detail_mode, DetailMode::Parallel { limit: 5 });
        assert_eq!(settings.scrape.retry.max_attempts, 3);
        assert_eq!(settings.scrape.client_timeout, Duration::from_secs(300));
    }

    #[test]
    fn unset_variables_fall_back_to_scrape_defaults() {
        let settings = settings(&[("CSV_OUTPUT_DIR", "out")]).unwrap();
        assert_eq!(settings.scrape, ScrapeSettings::default());
    }

    #[test]
    fn missing_sink_is_configuration_error() {
        let err = settings(&[]).unwrap_err();
        assert!(matches!(err, ScrapeError::Configuration(_)));
    }

    #[test]
    fn production_is_sequential_one_client_at_a_time() {
        let settings = settings(&[
            ("SHEET_WEBHOOK_URL", "https://sheets.test/hook"),
            ("SCRAPER_ENV", "production"),
            ("SCRAPE_BATCH_SIZE", "4"),
            ("DETAIL_CONCURRENCY", "8"),
            ("REQUEST_DELAY_MS", "250"),
        ])
        .unwrap();

        assert_eq!(settings.scrape.batch_size, 1);
        assert_eq!(
            settings.scrape.detail_mode,
            DetailMode::Sequential {
                delay: Duration::from_millis(250)
            }
        );
    }

    #[test]
    fn sequential_takes_precedence_over_concurrency() {
        let settings = settings(&[
            ("CSV_OUTPUT_DIR", "out"),
            ("SEQUENTIAL_DETAILS", "true"),
            ("DETAIL_CONCURRENCY", "3"),
        ])
        .unwrap();

        assert!(matches!(settings.scrape.detail_mode, DetailMode::Sequential { .. }));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = settings(&[("CSV_OUTPUT_DIR", "out"), ("MAX_ATTEMPTS", "three")]).unwrap_err();
        assert!(err.to_string().contains("MAX_ATTEMPTS=three"));
    }

    #[test]
    fn parses_client_files() {
        let raw = r#"[{
            "id": "alpha",
            "name": "Hotel Alpha",
            "status": "active",
            "listingsUrl": "https://alpha.test/listings",
            "elementSelectors": {
                "listingsPageContainer": { "selector": ".card" },
                "listingDetailPageUrl": { "selector": "a" }
            }
        }]"#;

        let clients = parse_clients(raw).unwrap();
        assert_eq!(clients.len(), 1);

        let relative = raw.replace("https://alpha.test/listings", "/listings");
        assert!(matches!(parse_clients(&relative), Err(ScrapeError::Configuration(_))));
    }
}
