// HTML capability
//
// CSS selection over page text, used by the sandbox's cheerio shim, the host
// extractors and pattern mining. Elements cross the script boundary as plain
// serializable records.

use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use std::collections::BTreeMap;
use url::Url;

/// One selected element
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Element {
    pub tag: String,
    /// Outer HTML, re-parsable as a fragment for nested selection
    pub html: String,
    pub inner: String,
    pub text: String,
    pub attrs: BTreeMap<String, String>,
}

impl Element {
    fn from_ref(element: ElementRef<'_>) -> Self {
        Self {
            tag: element.value().name().to_string(),
            html: element.html(),
            inner: element.inner_html(),
            text: element.text().collect::<String>(),
            attrs: element
                .value()
                .attrs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| anyhow!("Invalid selector '{}': {:?}", selector, e))
}

/// Select from a full document
pub fn select(html: &str, selector: &str) -> Result<Vec<Element>> {
    let document = Html::parse_document(html);
    let selector = parse_selector(selector)?;
    Ok(document.select(&selector).map(Element::from_ref).collect())
}

/// Select inside an HTML fragment (e.g. an element's outer HTML)
pub fn select_fragment(html: &str, selector: &str) -> Result<Vec<Element>> {
    let fragment = Html::parse_fragment(html);
    let selector = parse_selector(selector)?;
    Ok(fragment.select(&selector).map(Element::from_ref).collect())
}

/// Values of `attr` on every element matching `selector`, resolved against `base`
pub fn attr_urls(html: &str, selector: &str, attr: &str, base: &Url) -> Vec<String> {
    let Ok(elements) = select(html, selector) else {
        return Vec::new();
    };
    elements
        .iter()
        .filter_map(|el| el.attr(attr))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .filter_map(|value| base.join(value).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(String::from)
        .collect()
}
