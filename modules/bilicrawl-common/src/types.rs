use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title recorded for a recommendation card whose thumbnail carries no alt text.
pub const UNTITLED: &str = "no title";

// --- Content ---

/// A video discovered via a seed list or a related-content card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub title: Option<String>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>, title: Option<String>) -> Self {
        Self {
            id: id.into(),
            title,
        }
    }

    /// Title as stored in the frontier file.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(UNTITLED)
    }
}

/// Build the detail-page URL for a content id.
pub fn content_url(base_url: &str, id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), id)
}

// --- Commenters ---

/// One accepted commenter observation.
///
/// Field names match the documents the downstream labeling step reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommenterRecord {
    pub uid: String,
    pub nickname: String,
    /// Badge identifier, e.g. `level_3`.
    pub level: String,
    pub comment: Option<String>,
    /// Set by the labeling step; always false at extraction time.
    #[serde(default)]
    pub label: bool,
    pub timestamp: DateTime<Utc>,
    /// Item the comment was observed on.
    #[serde(default)]
    pub content_id: String,
}

/// Commenter header as the render layer sees it, before any parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCommenter {
    pub profile_href: Option<String>,
    pub name_text: Option<String>,
    pub badge_src: Option<String>,
}

/// A commenter header paired with the body of the comment it wrote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCommentThread {
    pub commenter: Option<RawCommenter>,
    pub body_text: Option<String>,
}

/// Pair two independently queried sequences by index.
///
/// Render layers that can only list commenter headers and comment bodies
/// separately use this; bodies past the end of `commenters` are dropped and
/// commenters past the end of `bodies` get no body.
pub fn pair_by_position(commenters: Vec<RawCommenter>, bodies: Vec<String>) -> Vec<RawCommentThread> {
    let mut bodies = bodies.into_iter();
    commenters
        .into_iter()
        .map(|commenter| RawCommentThread {
            commenter: Some(commenter),
            body_text: bodies.next(),
        })
        .collect()
}

// --- Session ---

/// Serialized authenticated browsing context (storage-state document).
///
/// Opaque to the crawler; only browser adapters look inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(serde_json::Value);

impl SessionToken {
    pub fn new(state: serde_json::Value) -> Self {
        Self(state)
    }

    /// A token carrying no cookies; browsing happens logged out.
    pub fn anonymous() -> Self {
        Self(serde_json::json!({ "cookies": [], "origins": [] }))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    pub fn cookies(&self) -> Vec<serde_json::Value> {
        self.0
            .get("cookies")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default()
    }
}
