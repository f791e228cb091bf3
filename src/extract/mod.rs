//! DOM helpers shared by the listing and detail extractors.
//!
//! All helpers work on a parsed HTML snapshot of the rendered page and never
//! fail: anything that does not resolve comes back as an empty string.

pub mod detail;
pub mod listing;

use scraper::{ElementRef, Selector};
use url::Url;

use crate::models::Field;
use crate::traits::ElementRule;

fn target<'a>(root: ElementRef<'a>, selector: Option<&str>) -> Option<ElementRef<'a>> {
    match selector {
        None => Some(root),
        Some(selector) => {
            let selector = Selector::parse(selector).ok()?;
            root.select(&selector).next()
        }
    }
}

fn attr(element: ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolves `raw` against `base`, keeping `raw` as-is when it cannot be joined.
pub fn absolutize(raw: &str, base: &Url) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    base.join(raw).map_or_else(|_| raw.to_string(), |url| url.to_string())
}

/// Trimmed text of the selected element, or the named attribute when one is given.
pub fn resolve_text(root: ElementRef<'_>, selector: Option<&str>, attribute: Option<&str>) -> String {
    if selector.is_none() && attribute.is_none() {
        return String::new();
    }

    let Some(element) = target(root, selector) else {
        return String::new();
    };

    match attribute {
        Some(name) => attr(element, name).unwrap_or_default(),
        None => element.text().collect::<String>().trim().to_string(),
    }
}

/// Absolute form of a link, or empty when `raw` cannot be made absolute.
pub fn absolute_link(raw: &str, base: &Url) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    base.join(raw).map(|url| url.to_string()).unwrap_or_default()
}

/// Like [`resolve_text`], but an anchor's `href` is returned as an absolute URL.
pub fn resolve_link(
    root: ElementRef<'_>,
    selector: Option<&str>,
    attribute: Option<&str>,
    base: &Url,
) -> String {
    if attribute.is_some() {
        return resolve_text(root, selector, attribute);
    }
    if selector.is_none() {
        return String::new();
    }

    target(root, selector)
        .and_then(|el| attr(el, "href"))
        .map(|href| absolute_link(&href, base))
        .unwrap_or_default()
}

/// Image URL from `src`, then lazy-loading `data-src`.
///
/// With an explicit attribute only that attribute is read.
pub fn resolve_image(
    root: ElementRef<'_>,
    selector: Option<&str>,
    attribute: Option<&str>,
    base: &Url,
) -> String {
    if selector.is_none() && attribute.is_none() {
        return String::new();
    }

    let Some(element) = target(root, selector) else {
        return String::new();
    };

    if let Some(name) = attribute {
        return attr(element, name).unwrap_or_default();
    }

    // Placeholders from lazy loaders are inline data URIs.
    attr(element, "src")
        .filter(|src| !src.starts_with("data:"))
        .or_else(|| attr(element, "data-src"))
        .map(|src| absolutize(&src, base))
        .unwrap_or_default()
}

/// Reduces a displayed price to its integer amount, e.g. `"$1,234.56 - $1,999"` to `"1234"`.
pub fn normalize_price(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-' | ' '))
        .collect();

    let first = cleaned
        .split(|c: char| c == '-' || c.is_whitespace())
        .find(|token| token.chars().any(|c| c.is_ascii_digit()))
        .unwrap_or_default();

    let without_thousands = first.replace(',', "");
    without_thousands
        .split('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Applies one rule to `root`, picking the helper the field calls for.
pub fn resolve_rule(root: ElementRef<'_>, field: Field, rule: &ElementRule, base: &Url) -> String {
    let selector = rule.selector();
    let attribute = rule.attribute();

    let value = match field {
        Field::Link => resolve_link(root, selector, attribute, base),
        Field::ImageLink => resolve_image(root, selector, attribute, base),
        _ => resolve_text(root, selector, attribute),
    };

    if field.is_price() {
        normalize_price(&value)
    } else {
        value
    }
}
