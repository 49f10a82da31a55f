use std::fmt;
use std::path::PathBuf;

/// Result type alias for crawl operations.
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Where in the per-item pipeline a render failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OpenContext,
    Navigate,
    ScrollExhaustion,
    Content,
    CommentWait,
    CommentQuery,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::OpenContext => "open_context",
            Stage::Navigate => "navigate",
            Stage::ScrollExhaustion => "scroll_exhaustion",
            Stage::Content => "content",
            Stage::CommentWait => "comment_wait",
            Stage::CommentQuery => "comment_query",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
    #[error("Render failed for {item_id} at {stage}: {message}")]
    Render {
        item_id: String,
        stage: Stage,
        message: String,
    },

    #[error("Malformed comment element #{index}: {message}")]
    Extraction { index: usize, message: String },

    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State file {path} is not valid JSON: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ledger write failed: {0}")]
    Ledger(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Authentication unavailable: {0}")]
    AuthenticationUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    pub(crate) fn render(item_id: &str, stage: Stage, err: impl fmt::Display) -> Self {
        CrawlError::Render {
            item_id: item_id.to_string(),
            stage,
            message: err.to_string(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CrawlError::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors halt the run; the rest are scoped to one item or element.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CrawlError::Render { .. } | CrawlError::Extraction { .. }
        )
    }
}
