//! Detail page extraction with retries

use scraper::{Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, ScrapeError};
use crate::extract::listing::PageTimeouts;
use crate::extract::resolve_rule;
use crate::models::PartialRecord;
use crate::retry::RetryPolicy;
use crate::traits::{BrowserSession, ClientConfig, PageHandle};

/// Subresources aborted on scraped pages: images, media, fonts and trackers.
pub const BLOCKED_RESOURCES: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico",
    "*.mp4", "*.webm", "*.mp3",
    "*.woff", "*.woff2", "*.ttf", "*.otf",
    "*google-analytics.com*", "*googletagmanager.com*", "*doubleclick.net*",
    "*facebook.net*", "*hotjar.com*", "*segment.io*",
];

pub fn blocked_resources() -> Vec<String> {
    BLOCKED_RESOURCES.iter().map(|p| (*p).to_string()).collect()
}

/// Visits `url` and resolves every detail-page rule.
///
/// Never fails: once the retry policy gives up an empty result is returned and
/// the caller keeps its listing-page fields.
pub async fn extract_detail(
    session: &dyn BrowserSession,
    url: &str,
    config: &ClientConfig,
    timeouts: PageTimeouts,
    retry: &RetryPolicy,
) -> PartialRecord {
    let label = format!("Detail page {url}");

    match retry
        .run(&label, |attempt| async move {
            debug!("Loading detail page {} (attempt {})", url, attempt);
            attempt_detail(session, url, config, timeouts).await
        })
        .await
    {
        Ok(partial) => partial,
        Err(e) => {
            warn!(
                "Giving up on detail page {} after {} attempts: {}",
                url, retry.max_attempts, e
            );
            PartialRecord::new()
        }
    }
}

async fn attempt_detail(
    session: &dyn BrowserSession,
    url: &str,
    config: &ClientConfig,
    timeouts: PageTimeouts,
) -> Result<PartialRecord> {
    let mut page = session.new_page().await?;
    let result = load_detail(page.as_mut(), url, config, timeouts).await;

    if let Err(e) = page.close().await {
        debug!("Failed to close detail page {}: {}", url, e);
    }

    result
}

async fn load_detail(
    page: &mut dyn PageHandle,
    url: &str,
    config: &ClientConfig,
    timeouts: PageTimeouts,
) -> Result<PartialRecord> {
    if let Err(e) = page.block_requests(&blocked_resources()).await {
        debug!("Resource blocking unavailable for {}: {}", url, e);
    }

    page.goto(url, timeouts.navigation).await?;

    let container = config.field_map.detail_container().unwrap_or("body");
    page.wait_for_selector(container, timeouts.selector).await?;

    let html = page.content().await?;
    parse_detail(&html, url, config)
}

/// Resolves detail-page rules from a rendered detail page.
pub fn parse_detail(html: &str, url: &str, config: &ClientConfig) -> Result<PartialRecord> {
    let base = Url::parse(url).map_err(|e| ScrapeError::Browser(format!("bad detail URL {url}: {e}")))?;
    let document = Html::parse_document(html);

    let container = config
        .field_map
        .detail_container()
        .and_then(|selector| Selector::parse(selector).ok())
        .and_then(|selector| document.select(&selector).next());
    let root = container.unwrap_or_else(|| document.root_element());

    let mut partial = PartialRecord::new();
    for (field, rule) in config.field_map.detail_rules() {
        let value = resolve_rule(root, field, rule, &base);
        if value.is_empty() && config.field_map.is_required(field) {
            return Err(ScrapeError::MissingRequiredField {
                field: field.to_string(),
                url: url.to_string(),
            });
        }
        if !value.is_empty() {
            partial.insert(field, value);
        }
    }

    info!("Resolved {} detail fields from {}", partial.len(), url);
    Ok(partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Field;

    fn client() -> ClientConfig {
        serde_json::from_value(serde_json::json!({
            "id": "alpha",
            "name": "Hotel Alpha",
            "listingsUrl": "https://alpha.test/listings",
            "elementSelectors": {
                "listingsPageContainer": { "selector": ".card" },
                "listingDetailPageUrl": { "selector": "a" },
                "listingDetailContainer": { "selector": "main.hotel" },
                "listingTitle": { "selector": "h1", "getDataFromDetailsPage": true },
                "listingPrice": { "selector": ".rate", "getDataFromDetailsPage": true },
                "listingImage": { "selector": "img.cover", "getDataFromDetailsPage": true },
                "listingDescription": { "selector": ".about", "getDataFromDetailsPage": true }
            }
        }))
        .unwrap()
    }

    #[test]
    fn resolves_detail_rules_inside_container() {
        let html = r#"<html><body>
            <h1>Site header</h1>
            <main class="hotel">
                <h1> Casa Azul </h1>
                <span class="rate">USD 1,480.00</span>
                <img class="cover" src="/img/casa.jpg">
            </main>
        </body></html>"#;

        let partial = parse_detail(html, "https://alpha.test/h/1", &client()).unwrap();

        assert_eq!(partial.get(&Field::Title).map(String::as_str), Some("Casa Azul"));
        assert_eq!(partial.get(&Field::Price).map(String::as_str), Some("1480"));
        assert_eq!(
            partial.get(&Field::ImageLink).map(String::as_str),
            Some("https://alpha.test/img/casa.jpg")
        );
        assert!(!partial.contains_key(&Field::Description));
    }

    #[test]
    fn empty_required_field_is_an_error() {
        let html = r#"<main class="hotel"><h1>Casa Azul</h1><span class="rate">90</span></main>"#;

        let err = parse_detail(html, "https://alpha.test/h/1", &client()).unwrap_err();

        assert!(matches!(
            err,
            ScrapeError::MissingRequiredField { ref field, .. } if field == "image_link"
        ));
    }
}
