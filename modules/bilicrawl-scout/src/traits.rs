// Capability seams for the crawler.
//
// Browser replaces the headless-browser automation layer, SessionProvider the
// human login step, HarvestStore the document store. The crawler only talks
// to these traits; production adapters live in `browser` and `store`, test
// doubles in `testing`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use bilicrawl_common::{CommenterRecord, ContentItem, RawCommentThread, SessionToken};

use crate::scroll::{ScrollOutcome, ScrollPolicy};

// ---------------------------------------------------------------------------
// Browser
// ---------------------------------------------------------------------------

/// Shared browsing engine. Hands out independent contexts, one per item.
#[async_trait]
pub trait Browser: Send + Sync {
    async fn open_context(&self, session: &SessionToken) -> Result<Box<dyn RenderSurface>>;
}

/// One browsing context showing one page. Exclusively owned by the task
/// processing an item; callers must `close` it on every path.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()>;

    /// Trigger lazy loading (scroll to the bottom).
    async fn reveal_more(&self) -> Result<()>;

    /// Growth metric for scroll exhaustion (document scroll height).
    async fn growth_metric(&self) -> Result<u64>;

    /// Run the whole scroll-exhaustion loop inside the page and keep that
    /// render for the extraction calls that follow. `None` means the caller
    /// drives `reveal_more`/`growth_metric` itself.
    async fn scroll_in_page(&self, _policy: ScrollPolicy) -> Result<Option<ScrollOutcome>> {
        Ok(None)
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()>;

    /// Rendered HTML of the page.
    async fn content(&self) -> Result<String>;

    /// Commenter headers paired with their comment bodies.
    async fn comment_threads(&self) -> Result<Vec<RawCommentThread>>;

    async fn close(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SessionProvider
// ---------------------------------------------------------------------------

/// Produces an authenticated session when none is persisted.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn obtain_session(&self) -> Result<SessionToken>;
}

// ---------------------------------------------------------------------------
// HarvestStore
// ---------------------------------------------------------------------------

/// Durable sink for commenter records and the content catalog.
#[async_trait]
pub trait HarvestStore: Send + Sync {
    async fn commenter_exists(&self, uid: &str) -> Result<bool>;

    /// Insert unless a record with the same uid exists. Returns whether it was inserted.
    async fn insert_commenter_if_absent(&self, record: &CommenterRecord) -> Result<bool>;

    /// Batch form of `insert_commenter_if_absent`, one flag per record.
    /// Stores that rewrite whole files override this to write once.
    async fn insert_commenters_if_absent(&self, records: &[CommenterRecord]) -> Result<Vec<bool>> {
        let mut inserted = Vec::with_capacity(records.len());
        for record in records {
            inserted.push(self.insert_commenter_if_absent(record).await?);
        }
        Ok(inserted)
    }

    /// Remove records sharing a uid, keeping the earliest. Returns how many were removed.
    async fn remove_duplicate_commenters(&self) -> Result<u64>;

    /// Record discovered items with `label = false`; known ids keep their title.
    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<()>;

    fn name(&self) -> &str;
}
