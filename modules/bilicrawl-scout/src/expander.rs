use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use bilicrawl_common::ContentItem;

static CARD_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.video-page-card-small").unwrap());
static LINK_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());
static THUMB_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").unwrap());

/// Pull related-content cards out of a rendered detail page.
///
/// Cards without a link, or whose link is not a content link, are skipped.
/// The first card for a given id wins; filtering against processed ids is
/// left to the caller.
pub fn extract_recommendations(html: &str) -> Vec<ContentItem> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for card in document.select(&CARD_SELECTOR) {
        let Some(link) = card.select(&LINK_SELECTOR).next() else {
            continue;
        };
        let Some(href) = link.value().attr("href") else {
            continue;
        };
        let Some(id) = content_id_from_href(href) else {
            debug!(href, "Skipping non-content recommendation link");
            continue;
        };
        if !seen.insert(id.clone()) {
            continue;
        }

        let title = link
            .select(&THUMB_SELECTOR)
            .next()
            .and_then(|img| img.value().attr("alt"))
            .map(|alt| alt.trim().to_string())
            .filter(|alt| !alt.is_empty());

        items.push(ContentItem::new(id, title));
    }

    items
}

/// Content id from a `/video/<id>` link, absolute, protocol-relative or
/// root-relative.
pub fn content_id_from_href(href: &str) -> Option<String> {
    let path = if href.starts_with("//") {
        Url::parse(&format!("https:{href}")).ok()?.path().to_string()
    } else if href.contains("://") {
        Url::parse(href).ok()?.path().to_string()
    } else {
        href.split(['?', '#']).next().unwrap_or_default().to_string()
    };

    let mut segments = path.split('/').filter(|s| !s.is_empty());
    segments.by_ref().find(|s| *s == "video")?;
    segments.next().map(str::to_string)
}
