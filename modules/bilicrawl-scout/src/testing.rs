// Test doubles for the crawler.
//
// One per capability seam:
// - ScriptedBrowser / ScriptedSurface (Browser, RenderSurface): pages keyed by content id
// - MemoryHarvestStore (HarvestStore): in-memory records and catalog
// - ScriptedSessionProvider (SessionProvider): fixed token or failure
//
// Plus fixtures for related-card HTML, comment threads and records.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use bilicrawl_common::{
    CommenterRecord, ContentItem, RawCommentThread, RawCommenter, SessionToken,
};

use crate::traits::{Browser, HarvestStore, RenderSurface, SessionProvider};

// ---------------------------------------------------------------------------
// ScriptedPage
// ---------------------------------------------------------------------------

/// What a content page looks like once rendered.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPage {
    /// Successive growth-metric samples; the last one repeats.
    pub heights: Vec<u64>,
    pub html: String,
    pub threads: Vec<RawCommentThread>,
    pub fail_navigation: bool,
    pub fail_scroll: bool,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self {
            heights: vec![1_000],
            html: video_page_html(&[]),
            ..Default::default()
        }
    }

    pub fn with_cards(mut self, cards: &[(&str, Option<&str>)]) -> Self {
        self.html = video_page_html(cards);
        self
    }

    pub fn with_threads(mut self, threads: Vec<RawCommentThread>) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_heights(mut self, heights: Vec<u64>) -> Self {
        self.heights = heights;
        self
    }

    pub fn failing_navigation(mut self) -> Self {
        self.fail_navigation = true;
        self
    }

    pub fn failing_scroll(mut self) -> Self {
        self.fail_scroll = true;
        self
    }
}

// ---------------------------------------------------------------------------
// ScriptedBrowser
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BrowserLog {
    navigations: Mutex<Vec<String>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// HashMap-based browser. Navigating to an unregistered id fails.
/// Builder pattern: `.on_item()`, `.failing_contexts()`, `.cancel_on_navigation()`.
pub struct ScriptedBrowser {
    pages: Arc<HashMap<String, ScriptedPage>>,
    log: Arc<BrowserLog>,
    fail_open: bool,
    cancel_on: Option<(String, CancellationToken)>,
}

impl ScriptedBrowser {
    pub fn new() -> Self {
        Self {
            pages: Arc::new(HashMap::new()),
            log: Arc::new(BrowserLog::default()),
            fail_open: false,
            cancel_on: None,
        }
    }

    pub fn on_item(mut self, id: &str, page: ScriptedPage) -> Self {
        Arc::make_mut(&mut self.pages).insert(id.to_string(), page);
        self
    }

    pub fn failing_contexts(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Cancel `token` as soon as `id` is navigated to.
    pub fn cancel_on_navigation(mut self, id: &str, token: CancellationToken) -> Self {
        self.cancel_on = Some((id.to_string(), token));
        self
    }

    /// Ids navigated to, in order (failed navigations included).
    pub fn navigations(&self) -> Vec<String> {
        self.log.navigations.lock().unwrap().clone()
    }

    pub fn contexts_opened(&self) -> usize {
        self.log.opened.load(Ordering::SeqCst)
    }

    pub fn contexts_closed(&self) -> usize {
        self.log.closed.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn open_context(&self, _session: &SessionToken) -> Result<Box<dyn RenderSurface>> {
        if self.fail_open {
            bail!("browser has disconnected");
        }
        self.log.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSurface {
            pages: self.pages.clone(),
            log: self.log.clone(),
            cancel_on: self.cancel_on.clone(),
            state: Mutex::new(SurfaceState::default()),
        }))
    }
}

#[derive(Default)]
struct SurfaceState {
    page: Option<ScriptedPage>,
    height_idx: usize,
    reveals: u32,
}

/// One scripted browsing context.
pub struct ScriptedSurface {
    pages: Arc<HashMap<String, ScriptedPage>>,
    log: Arc<BrowserLog>,
    cancel_on: Option<(String, CancellationToken)>,
    state: Mutex<SurfaceState>,
}

impl ScriptedSurface {
    /// A surface already showing a page that reports `heights`.
    pub fn with_heights(heights: Vec<u64>) -> Self {
        Self {
            pages: Arc::new(HashMap::new()),
            log: Arc::new(BrowserLog::default()),
            cancel_on: None,
            state: Mutex::new(SurfaceState {
                page: Some(ScriptedPage::new().with_heights(heights)),
                ..Default::default()
            }),
        }
    }

    pub fn reveal_count(&self) -> u32 {
        self.state.lock().unwrap().reveals
    }

    fn with_page<T>(&self, f: impl FnOnce(&mut SurfaceState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        if state.page.is_none() {
            bail!("no page loaded");
        }
        f(&mut state)
    }
}

fn id_from_url(url: &str) -> String {
    url.rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl RenderSurface for ScriptedSurface {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let id = id_from_url(url);
        self.log.navigations.lock().unwrap().push(id.clone());

        if let Some((ref target, ref token)) = self.cancel_on {
            if *target == id {
                token.cancel();
            }
        }

        let Some(page) = self.pages.get(&id) else {
            bail!("net::ERR_NAME_NOT_RESOLVED at {url}");
        };
        if page.fail_navigation {
            bail!("Timeout {}ms exceeded navigating to {url}", timeout.as_millis());
        }

        let mut state = self.state.lock().unwrap();
        state.page = Some(page.clone());
        state.height_idx = 0;
        Ok(())
    }

    async fn reveal_more(&self) -> Result<()> {
        self.with_page(|state| {
            if state.page.as_ref().is_some_and(|p| p.fail_scroll) {
                bail!("Execution context was destroyed");
            }
            state.reveals += 1;
            Ok(())
        })
    }

    async fn growth_metric(&self) -> Result<u64> {
        self.with_page(|state| {
            let heights = state.page.as_ref().map(|p| p.heights.clone()).unwrap_or_default();
            let metric = heights
                .get(state.height_idx)
                .or(heights.last())
                .copied()
                .unwrap_or(0);
            state.height_idx += 1;
            Ok(metric)
        })
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        self.with_page(|state| {
            let has_comments = state.page.as_ref().is_some_and(|p| !p.threads.is_empty());
            if !has_comments {
                bail!("Timeout {}ms exceeded waiting for {selector}", timeout.as_millis());
            }
            Ok(())
        })
    }

    async fn content(&self) -> Result<String> {
        self.with_page(|state| Ok(state.page.as_ref().map(|p| p.html.clone()).unwrap_or_default()))
    }

    async fn comment_threads(&self) -> Result<Vec<RawCommentThread>> {
        self.with_page(|state| Ok(state.page.as_ref().map(|p| p.threads.clone()).unwrap_or_default()))
    }

    async fn close(&self) -> Result<()> {
        self.log.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryHarvestStore
// ---------------------------------------------------------------------------

/// In-memory store. `push_raw` bypasses the uid check to simulate
/// out-of-band writers.
pub struct MemoryHarvestStore {
    records: Mutex<Vec<CommenterRecord>>,
    catalog: Mutex<BTreeMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryHarvestStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            catalog: Mutex::new(BTreeMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn records(&self) -> Vec<CommenterRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn uids(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.uid).collect()
    }

    pub fn catalog(&self) -> BTreeMap<String, String> {
        self.catalog.lock().unwrap().clone()
    }

    pub fn push_raw(&self, record: CommenterRecord) {
        self.records.lock().unwrap().push(record);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("store unavailable");
        }
        Ok(())
    }
}

impl Default for MemoryHarvestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HarvestStore for MemoryHarvestStore {
    async fn commenter_exists(&self, uid: &str) -> Result<bool> {
        Ok(self.records.lock().unwrap().iter().any(|r| r.uid == uid))
    }

    async fn insert_commenter_if_absent(&self, record: &CommenterRecord) -> Result<bool> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.uid == record.uid) {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    async fn remove_duplicate_commenters(&self) -> Result<u64> {
        self.check_writable()?;
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.uid.clone()));
        Ok((before - records.len()) as u64)
    }

    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<()> {
        self.check_writable()?;
        let mut catalog = self.catalog.lock().unwrap();
        for item in items {
            catalog
                .entry(item.id.clone())
                .or_insert_with(|| item.display_title().to_string());
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// ScriptedSessionProvider
// ---------------------------------------------------------------------------

pub struct ScriptedSessionProvider {
    token: Option<SessionToken>,
    calls: AtomicUsize,
}

impl ScriptedSessionProvider {
    pub fn returning(token: SessionToken) -> Self {
        Self {
            token: Some(token),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            token: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for ScriptedSessionProvider {
    async fn obtain_session(&self) -> Result<SessionToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.token {
            Some(token) => Ok(token.clone()),
            None => bail!("operator did not log in"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A detail page whose related-content column lists `cards` as (id, title).
pub fn video_page_html(cards: &[(&str, Option<&str>)]) -> String {
    let mut column = String::new();
    for (id, title) in cards {
        let img = match title {
            Some(t) => format!(r#"<img src="//i0.hdslb.com/bfs/archive/{id}.jpg" alt="{t}">"#),
            None => format!(r#"<img src="//i0.hdslb.com/bfs/archive/{id}.jpg">"#),
        };
        column.push_str(&format!(
            r#"<div class="video-page-card-small"><div class="pic-box"><a href="/video/{id}/">{img}</a></div><div class="info"><a href="/video/{id}/"><p class="title">{}</p></a></div></div>"#,
            title.unwrap_or_default()
        ));
    }
    format!(
        r#"<html><head><title>video</title></head><body><div id="reco_list"><div class="rec-list">{column}</div></div></body></html>"#
    )
}

/// A comment thread as the render layer reports it. `level: None` means no badge.
pub fn thread(uid: &str, name: &str, level: Option<&str>, body: Option<&str>) -> RawCommentThread {
    RawCommentThread {
        commenter: Some(RawCommenter {
            profile_href: Some(format!("//space.bilibili.com/{uid}")),
            name_text: Some(name.to_string()),
            badge_src: level.map(|l| {
                format!("https://i0.hdslb.com/bfs/seed/jinkela/short/webcomponent/user-level/{l}.svg")
            }),
        }),
        body_text: body.map(String::from),
    }
}

/// 2024-05-01T10:00:00Z
pub fn fixed_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_714_557_600, 0).unwrap_or_default()
}

pub fn commenter_record(uid: &str, level: &str) -> CommenterRecord {
    CommenterRecord {
        uid: uid.to_string(),
        nickname: format!("user{uid}"),
        level: level.to_string(),
        comment: Some("nice video".to_string()),
        label: false,
        timestamp: fixed_time(),
        content_id: "BV001".to_string(),
    }
}
