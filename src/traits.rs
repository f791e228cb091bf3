//! Client configuration and the browser seams the scraper runs against

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::{Result, ScrapeError};
use crate::models::Field;

const LISTINGS_CONTAINER_KEY: &str = "listingsPageContainer";
const DETAIL_CONTAINER_KEY: &str = "listingDetailContainer";

/// How to pull one value out of the DOM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRule {
    /// CSS selector relative to the current root; `None` targets the root itself
    #[serde(default)]
    pub selector: Option<String>,
    /// Attribute to read instead of text content
    #[serde(default, rename = "selectorIfAttribute")]
    pub attribute: Option<String>,
    #[serde(default, rename = "getDataFromDetailsPage")]
    pub resolve_on_detail_page: bool,
    /// Empty detail-page value counts as a transient failure
    #[serde(default)]
    pub required: bool,
}

impl ElementRule {
    pub fn selector(&self) -> Option<&str> {
        self.selector.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn attribute(&self) -> Option<&str> {
        self.attribute.as_deref().filter(|a| !a.trim().is_empty())
    }
}

/// Per-client extraction rules, validated when the client config is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "HashMap<String, ElementRule>")]
pub struct FieldMap {
    listing_container: ElementRule,
    detail_container: Option<ElementRule>,
    rules: BTreeMap<Field, ElementRule>,
}

impl FieldMap {
    pub fn new(
        listing_container: ElementRule,
        detail_container: Option<ElementRule>,
        rules: BTreeMap<Field, ElementRule>,
    ) -> Result<Self> {
        let map = Self {
            listing_container,
            detail_container,
            rules,
        };
        map.validate()?;
        Ok(map)
    }

    pub fn listing_container(&self) -> &str {
        self.listing_container.selector().unwrap_or_default()
    }

    pub fn detail_container(&self) -> Option<&str> {
        self.detail_container.as_ref().and_then(ElementRule::selector)
    }

    pub fn rule(&self, field: Field) -> Option<&ElementRule> {
        self.rules.get(&field)
    }

    /// Rules resolved against each container on the listings page.
    ///
    /// The detail link is always resolved here, whatever its flag says.
    pub fn listing_rules(&self) -> impl Iterator<Item = (Field, &ElementRule)> {
        self.rules
            .iter()
            .filter(|(field, rule)| !rule.resolve_on_detail_page || **field == Field::Link)
            .map(|(field, rule)| (*field, rule))
    }

    /// Rules resolved on each listing's detail page.
    pub fn detail_rules(&self) -> impl Iterator<Item = (Field, &ElementRule)> {
        self.rules
            .iter()
            .filter(|(field, rule)| rule.resolve_on_detail_page && **field != Field::Link)
            .map(|(field, rule)| (*field, rule))
    }

    pub fn has_detail_rules(&self) -> bool {
        self.detail_rules().next().is_some()
    }

    pub fn is_required(&self, field: Field) -> bool {
        self.rule(field).is_some_and(|rule| {
            rule.resolve_on_detail_page && (rule.required || field.required_on_detail_page())
        })
    }

    fn validate(&self) -> Result<()> {
        if self.listing_container.selector().is_none() {
            return Err(ScrapeError::config(format!(
                "`{LISTINGS_CONTAINER_KEY}` needs a selector"
            )));
        }

        if !self.rules.contains_key(&Field::Link) {
            return Err(ScrapeError::config(format!(
                "`{}` rule is required",
                Field::Link.key()
            )));
        }

        let mut selectors = vec![self.listing_container.selector()];
        selectors.push(self.detail_container());
        selectors.extend(self.rules.values().map(ElementRule::selector));

        for selector in selectors.into_iter().flatten() {
            scraper::Selector::parse(selector)
                .map_err(|e| ScrapeError::config(format!("invalid selector `{selector}`: {e:?}")))?;
        }

        for (field, rule) in &self.rules {
            if rule.selector().is_none() && rule.attribute().is_none() {
                return Err(ScrapeError::config(format!(
                    "`{}` needs a selector or an attribute",
                    field.key()
                )));
            }
        }

        Ok(())
    }
}

impl TryFrom<HashMap<String, ElementRule>> for FieldMap {
    type Error = ScrapeError;

    fn try_from(mut raw: HashMap<String, ElementRule>) -> Result<Self> {
        let listing_container = raw
            .remove(LISTINGS_CONTAINER_KEY)
            .ok_or_else(|| ScrapeError::config(format!("`{LISTINGS_CONTAINER_KEY}` rule is required")))?;
        let detail_container = raw.remove(DETAIL_CONTAINER_KEY);

        let mut rules = BTreeMap::new();
        for (key, rule) in raw {
            let field = Field::from_key(&key)
                .ok_or_else(|| ScrapeError::config(format!("unknown rule `{key}`")))?;
            rules.insert(field, rule);
        }

        Self::new(listing_container, detail_container, rules)
    }
}

/// Configuration for one client website
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub id: String,
    /// Display name, written into every row's brand column
    pub name: String,
    #[serde(default)]
    pub status: String,
    pub listings_url: String,
    #[serde(default)]
    pub sheet_id: Option<String>,
    #[serde(rename = "elementSelectors")]
    pub field_map: FieldMap,
}

impl ClientConfig {
    /// Composite key used by the result cache.
    pub fn cache_key(&self) -> String {
        format!("{}-{}", self.id, self.listings_url)
    }

    pub fn is_active(&self) -> bool {
        self.status.eq_ignore_ascii_case("active")
    }

    pub fn listings_url(&self) -> Result<Url> {
        Url::parse(&self.listings_url).map_err(|e| {
            ScrapeError::config(format!(
                "client {} has an invalid listings URL `{}`: {e}",
                self.id, self.listings_url
            ))
        })
    }
}

/// Starts a browser for one client scrape.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>>;
}

/// A running browser able to open pages.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn PageHandle>>;

    /// Shuts the browser down, closing every page still open.
    async fn close(&mut self) -> Result<()>;
}

/// One browser tab.
#[async_trait]
pub trait PageHandle: Send {
    /// Abort requests whose URL matches any of the wildcard `patterns`.
    async fn block_requests(&mut self, patterns: &[String]) -> Result<()>;

    async fn goto(&mut self, url: &str, timeout: Duration) -> Result<()>;

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<()>;

    /// Rendered HTML of the current document.
    async fn content(&mut self) -> Result<String>;

    async fn close(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "id": "c1",
            "name": "Hotel Alpha",
            "status": "Active",
            "listingsUrl": "https://alpha.test/listings",
            "sheetId": "sheet-1",
            "elementSelectors": {
                "listingsPageContainer": { "selector": ".card", "selectorIfAttribute": null },
                "listingDetailPageUrl": { "selector": "a.more", "selectorIfAttribute": null },
                "listingDetailContainer": { "selector": "main", "selectorIfAttribute": null },
                "listingTitle": { "selector": "h1", "selectorIfAttribute": null, "getDataFromDetailsPage": true },
                "listingCity": { "selector": null, "selectorIfAttribute": "data-city" }
            }
        }"#
    }

    #[test]
    fn parses_client_config() {
        let config: ClientConfig = serde_json::from_str(sample_json()).unwrap();

        assert!(config.is_active());
        assert_eq!(config.cache_key(), "c1-https://alpha.test/listings");
        assert_eq!(config.field_map.listing_container(), ".card");
        assert_eq!(config.field_map.detail_container(), Some("main"));

        let listing: Vec<Field> = config.field_map.listing_rules().map(|(f, _)| f).collect();
        assert_eq!(listing, vec![Field::City, Field::Link]);

        let detail: Vec<Field> = config.field_map.detail_rules().map(|(f, _)| f).collect();
        assert_eq!(detail, vec![Field::Title]);
        assert!(config.field_map.is_required(Field::Title));
        assert!(!config.field_map.is_required(Field::City));
    }

    #[test]
    fn rejects_unknown_rule_names() {
        let json = sample_json().replace("listingCity", "listingTown");
        let err = serde_json::from_str::<ClientConfig>(&json).unwrap_err();
        assert!(err.to_string().contains("unknown rule `listingTown`"));
    }

    #[test]
    fn rejects_invalid_selectors() {
        let json = sample_json().replace("\"h1\"", "\"h1[\"");
        let err = serde_json::from_str::<ClientConfig>(&json).unwrap_err();
        assert!(err.to_string().contains("invalid selector"));
    }

    #[test]
    fn detail_link_always_resolves_on_listings_page() {
        let json = sample_json().replace(
            r#"{ "selector": "a.more", "selectorIfAttribute": null }"#,
            r#"{ "selector": "a.more", "getDataFromDetailsPage": true }"#,
        );
        let config: ClientConfig = serde_json::from_str(&json).unwrap();

        assert!(config.field_map.listing_rules().any(|(f, _)| f == Field::Link));
        assert!(config.field_map.detail_rules().all(|(f, _)| f != Field::Link));
    }

    #[test]
    fn requires_detail_link_rule() {
        let json = sample_json().replace("listingDetailPageUrl", "listingDescription");
        let err = serde_json::from_str::<ClientConfig>(&json).unwrap_err();
        assert!(err.to_string().contains("listingDetailPageUrl"));
    }
}
