use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use bilicrawl_common::{CommenterRecord, RawCommentThread, RawCommenter};

use crate::error::CrawlError;

/// Which badge tiers produce a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceFilter {
    tiers: Vec<String>,
}

impl AcceptanceFilter {
    pub fn new<I, S>(tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tiers: tiers.into_iter().map(Into::into).collect(),
        }
    }

    /// A level is accepted when it contains any configured tier.
    pub fn accepts(&self, level: &str) -> bool {
        self.tiers.iter().any(|tier| level.contains(tier.as_str()))
    }
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self::new(["level_2", "level_3"])
    }
}

#[derive(Debug, Default)]
pub struct ExtractionReport {
    pub records: Vec<CommenterRecord>,
    /// Well-formed commenters whose badge was missing or not accepted.
    pub rejected: u32,
    pub errors: Vec<CrawlError>,
}

/// Turn one page's comment threads into commenter records.
///
/// A malformed thread is logged and recorded in `errors`; the rest of the
/// page is still processed.
pub fn extract_commenters(
    content_id: &str,
    threads: &[RawCommentThread],
    filter: &AcceptanceFilter,
    now: DateTime<Utc>,
) -> ExtractionReport {
    let mut report = ExtractionReport::default();

    for (index, thread) in threads.iter().enumerate() {
        match parse_thread(index, thread) {
            Ok(Some(parsed)) if filter.accepts(&parsed.level) => {
                report.records.push(CommenterRecord {
                    uid: parsed.uid,
                    nickname: parsed.nickname,
                    level: parsed.level,
                    comment: thread.body_text.clone(),
                    label: false,
                    timestamp: now,
                    content_id: content_id.to_string(),
                });
            }
            Ok(Some(parsed)) => {
                debug!(uid = parsed.uid.as_str(), level = parsed.level.as_str(), "Commenter tier not accepted");
                report.rejected += 1;
            }
            Ok(None) => report.rejected += 1,
            Err(err) => {
                warn!(item_id = content_id, index, error = %err, "Failed to extract commenter");
                report.errors.push(err);
            }
        }
    }

    report
}

struct ParsedCommenter {
    uid: String,
    nickname: String,
    level: String,
}

/// `Ok(None)` when the commenter has no badge.
fn parse_thread(index: usize, thread: &RawCommentThread) -> Result<Option<ParsedCommenter>, CrawlError> {
    let malformed = |message: &str| CrawlError::Extraction {
        index,
        message: message.to_string(),
    };

    let commenter: &RawCommenter = thread
        .commenter
        .as_ref()
        .ok_or_else(|| malformed("missing commenter header"))?;
    let href = commenter
        .profile_href
        .as_deref()
        .ok_or_else(|| malformed("missing profile link"))?;
    let uid = uid_from_href(href).ok_or_else(|| malformed("profile link has no uid"))?;

    let Some(level) = commenter.badge_src.as_deref().and_then(level_from_badge) else {
        return Ok(None);
    };

    let nickname = commenter
        .name_text
        .as_deref()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();

    Ok(Some(ParsedCommenter {
        uid,
        nickname,
        level,
    }))
}

/// Last non-empty path segment, ignoring query and fragment.
pub fn uid_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .map(str::trim)
        .rfind(|s| !s.is_empty())
        .map(str::to_string)
}

/// File stem of the badge image: `.../level_3.svg` -> `level_3`.
pub fn level_from_badge(src: &str) -> Option<String> {
    let path = src.split(['?', '#']).next().unwrap_or_default();
    let file = path.rsplit('/').next()?;
    let stem = file.split('.').next()?.trim();
    (!stem.is_empty()).then(|| stem.to_string())
}
