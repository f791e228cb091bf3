//! Listings page extraction

use std::collections::HashSet;
use std::time::Duration;

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::Result;
use crate::extract::{absolute_link, resolve_rule};
use crate::models::{Field, ListingRecord};
use crate::traits::{ClientConfig, PageHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTimeouts {
    pub navigation: Duration,
    pub selector: Duration,
}

/// Loads the listings page on `page` and extracts one partial record per container.
pub async fn extract_listings(
    page: &mut dyn PageHandle,
    config: &ClientConfig,
    timeouts: PageTimeouts,
) -> Result<Vec<ListingRecord>> {
    let base = config.listings_url()?;
    let container = config.field_map.listing_container();

    info!("Loading listings page for {}: {}", config.name, base);
    page.goto(base.as_str(), timeouts.navigation).await?;
    page.wait_for_selector(container, timeouts.selector).await?;

    let html = page.content().await?;
    Ok(parse_listings(&html, &base, config))
}

/// Resolves every listing-page rule for each container in `html`.
///
/// Records without a detail link are dropped, as are repeated links.
pub fn parse_listings(html: &str, base: &Url, config: &ClientConfig) -> Vec<ListingRecord> {
    let document = Html::parse_document(html);
    let container = config.field_map.listing_container();

    let Ok(container_selector) = Selector::parse(container) else {
        warn!("Invalid listings container selector for {}: {}", config.name, container);
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut containers = 0;

    for element in document.select(&container_selector) {
        containers += 1;
        let mut record = ListingRecord::new(&config.id);

        for (field, rule) in config.field_map.listing_rules() {
            let mut value = resolve_rule(element, field, rule, base);
            if field == Field::Link {
                value = absolute_link(&value, base);
            }
            record.set(field, value);
        }
        record.set(Field::Brand, config.name.clone());

        let Some(link) = record.link().map(str::to_string) else {
            debug!("Dropping listing {} of {}: no detail link", containers, config.name);
            continue;
        };
        if !seen.insert(link) {
            continue;
        }

        records.push(record);
    }

    if containers == 0 {
        warn!("No listing elements found for {} with selector {}", config.name, container);
    } else {
        info!(
            "Found {} listings ({} containers) for {}",
            records.len(),
            containers,
            config.name
        );
    }

    records
}
