use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use typed_builder::TypedBuilder;

use bilicrawl_common::{content_url, Config, ContentItem, SessionToken};

use crate::checkpoint::CheckpointStore;
use crate::error::{CrawlError, Result, Stage};
use crate::expander::extract_recommendations;
use crate::extractor::{extract_commenters, AcceptanceFilter};
use crate::frontier::FrontierFile;
use crate::ledger::{DedupLedger, LedgerTally};
use crate::scroll::{self, ScrollPolicy};
use crate::stats::CrawlStats;
use crate::traits::{Browser, RenderSurface};

/// Custom element wrapping each commenter header on a detail page.
pub const COMMENT_SELECTOR: &str = "bili-comment-user-info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Init,
    SeedRound,
    ExpandRound(u32),
    Finalize,
    Done,
    Failed,
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlPhase::Init => f.write_str("init"),
            CrawlPhase::SeedRound => f.write_str("seed_round"),
            CrawlPhase::ExpandRound(k) => write!(f, "expand_round({k})"),
            CrawlPhase::Finalize => f.write_str("finalize"),
            CrawlPhase::Done => f.write_str("done"),
            CrawlPhase::Failed => f.write_str("failed"),
        }
    }
}

/// Tunables for one crawl run.
#[derive(Debug, Clone, TypedBuilder)]
pub struct CrawlSettings {
    /// Expand rounds after the seed round.
    #[builder(default = 10)]
    pub round_budget: u32,
    #[builder(default = 1)]
    pub max_concurrent_items: usize,
    #[builder(default = Duration::from_secs(60))]
    pub nav_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub settle_delay: Duration,
    #[builder(default = Duration::from_secs(6))]
    pub selector_timeout: Duration,
    #[builder(default)]
    pub scroll: ScrollPolicy,
    #[builder(default)]
    pub acceptance: AcceptanceFilter,
    #[builder(default = "https://www.bilibili.com/video/".to_string(), setter(into))]
    pub content_base_url: String,
}

impl CrawlSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .round_budget(config.round_budget)
            .max_concurrent_items(config.max_concurrent_items.max(1))
            .nav_timeout(config.nav_timeout)
            .settle_delay(config.settle_delay)
            .selector_timeout(config.selector_timeout)
            .scroll(ScrollPolicy {
                max_stable_retries: config.scroll_max_stable,
                sample_delay: config.scroll_delay,
                max_samples: config.scroll_max_samples,
            })
            .acceptance(AcceptanceFilter::new(config.accepted_levels.iter().cloned()))
            .content_base_url(config.content_base_url.clone())
            .build()
    }
}

#[derive(Debug, Default)]
struct RunState {
    used: BTreeSet<String>,
    failed: HashSet<String>,
    in_flight: HashSet<String>,
}

#[derive(Debug, Default, Clone, Copy)]
struct HarvestReport {
    tally: LedgerTally,
    rejected: u32,
    errors: u32,
}

#[derive(Debug)]
enum ItemOutcome {
    NotStarted,
    Skipped,
    Failed,
    Expanded {
        added: usize,
        harvest: Option<HarvestReport>,
    },
    Harvested(HarvestReport),
}

/// Round-based crawl over related-content links, harvesting commenters on
/// every page it renders.
#[derive(TypedBuilder)]
pub struct Crawler {
    browser: Arc<dyn Browser>,
    ledger: Arc<DedupLedger>,
    checkpoint: CheckpointStore,
    frontier: FrontierFile,
    session: SessionToken,
    settings: CrawlSettings,
    #[builder(default)]
    cancel: CancellationToken,
    #[builder(default, setter(skip))]
    state: Mutex<RunState>,
    #[builder(default, setter(skip))]
    frontier_lock: Mutex<()>,
}

impl Crawler {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the crawl from `seeds` until the round budget is spent, the
    /// frontier runs dry, or the run is cancelled.
    ///
    /// Only fatal errors are returned; per-item failures are counted.
    pub async fn run(&self, seeds: Vec<String>) -> Result<CrawlStats> {
        let mut stats = CrawlStats::default();

        let result = match self.run_rounds(seeds, &mut stats).await {
            Ok(()) => self.finalize(&mut stats).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                enter(CrawlPhase::Done);
                Ok(stats)
            }
            Err(e) => {
                error!(phase = %CrawlPhase::Failed, error = %e, "Crawl halted");
                Err(e)
            }
        }
    }

    async fn run_rounds(&self, seeds: Vec<String>, stats: &mut CrawlStats) -> Result<()> {
        enter(CrawlPhase::Init);
        let used = self.checkpoint.load().await?;
        self.state.lock().await.used = used;

        enter(CrawlPhase::SeedRound);
        let mut candidates = self.round(0, seeds, stats).await?;

        for k in 1..=self.settings.round_budget {
            if self.cancel.is_cancelled() {
                break;
            }
            if candidates.is_empty() {
                info!(round = k, "No candidates left, stopping early");
                break;
            }

            enter(CrawlPhase::ExpandRound(k));
            let used = self.refresh_used().await?;
            {
                let _guard = self.frontier_lock.lock().await;
                self.frontier.compact(&used).await?;
            }
            candidates = self.round(k, candidates, stats).await?;
        }

        stats.cancelled = self.cancel.is_cancelled();
        Ok(())
    }

    async fn finalize(&self, stats: &mut CrawlStats) -> Result<()> {
        enter(CrawlPhase::Finalize);
        if stats.cancelled {
            info!("Run cancelled, skipped remaining rounds");
        }
        stats.duplicates_removed = self.ledger.compact().await?;
        Ok(())
    }

    /// Union the on-disk checkpoint into the in-memory used set.
    async fn refresh_used(&self) -> Result<BTreeSet<String>> {
        let on_disk = self.checkpoint.load().await?;
        let mut state = self.state.lock().await;
        state.used.extend(on_disk);
        Ok(state.used.clone())
    }

    /// Expand `seeds`, derive candidates from the frontier, harvest them.
    /// Returns the candidates, which seed the next round.
    async fn round(&self, round: u32, seeds: Vec<String>, stats: &mut CrawlStats) -> Result<Vec<String>> {
        let seeds = dedup_preserving_order(seeds);
        info!(round, seeds = seeds.len(), "Expansion stage");

        // Fatal errors cancel this child so no further items start.
        let halt = self.cancel.child_token();

        let outcomes: Vec<Result<ItemOutcome>> = stream::iter(seeds.into_iter().map(|id| {
            let halt = halt.clone();
            async move { self.expand_item(id, &halt).await }
        }))
        .buffer_unordered(self.settings.max_concurrent_items.max(1))
        .collect()
        .await;
        tally_outcomes(outcomes, stats)?;

        if self.cancel.is_cancelled() {
            return Ok(Vec::new());
        }

        let candidates = {
            let (used, failed) = {
                let state = self.state.lock().await;
                (state.used.clone(), state.failed.clone())
            };
            let _guard = self.frontier_lock.lock().await;
            self.frontier.candidate_ids(&used, &failed).await?
        };
        info!(round, candidates = candidates.len(), "Harvest stage");

        let outcomes: Vec<Result<ItemOutcome>> =
            stream::iter(candidates.iter().cloned().map(|id| {
                let halt = halt.clone();
                async move { self.harvest_item(id, &halt).await }
            }))
            .buffer_unordered(self.settings.max_concurrent_items.max(1))
            .collect()
            .await;
        tally_outcomes(outcomes, stats)?;

        stats.rounds_completed += 1;
        Ok(candidates)
    }

    // --- Expansion ---

    async fn expand_item(&self, id: String, halt: &CancellationToken) -> Result<ItemOutcome> {
        if halt.is_cancelled() {
            return Ok(ItemOutcome::NotStarted);
        }
        if !self.claim(&id).await {
            info!(item_id = id.as_str(), "Already processed, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        info!(item_id = id.as_str(), "Expanding");
        let result = match self.open_surface(&id).await {
            Ok(surface) => {
                let result = self.expand_on(surface.as_ref(), &id).await;
                close_surface(surface.as_ref(), &id).await;
                result
            }
            Err(e) => Err(e),
        };

        let mut state = self.state.lock().await;
        state.in_flight.remove(&id);
        match result {
            Ok((added, harvest)) => {
                state.used.insert(id.clone());
                if let Err(e) = self.checkpoint.persist(&state.used).await {
                    halt.cancel();
                    return Err(e);
                }
                info!(item_id = id.as_str(), added, used = state.used.len(), "Item processed");
                Ok(ItemOutcome::Expanded { added, harvest })
            }
            Err(e) => self.item_failed(&mut state, &id, e, halt),
        }
    }

    async fn expand_on(
        &self,
        surface: &dyn RenderSurface,
        id: &str,
    ) -> Result<(usize, Option<HarvestReport>)> {
        self.render(surface, id).await?;

        let html = surface
            .content()
            .await
            .map_err(|e| CrawlError::render(id, Stage::Content, e))?;

        let used = self.state.lock().await.used.clone();
        let discovered: Vec<ContentItem> = extract_recommendations(&html)
            .into_iter()
            .filter(|item| item.id != id && !used.contains(&item.id))
            .collect();

        let added = {
            let _guard = self.frontier_lock.lock().await;
            self.frontier.merge_and_persist(discovered.clone()).await?
        };
        self.ledger.catalog(&discovered).await?;
        info!(item_id = id, discovered = discovered.len(), added, "Frontier updated");

        let harvest = match self.harvest_on(surface, id).await {
            Ok(report) => Some(report),
            Err(e) if !e.is_fatal() => {
                info!(item_id = id, error = %e, "No comments harvested while expanding");
                None
            }
            Err(e) => return Err(e),
        };

        Ok((added, harvest))
    }

    // --- Harvest ---

    async fn harvest_item(&self, id: String, halt: &CancellationToken) -> Result<ItemOutcome> {
        if halt.is_cancelled() {
            return Ok(ItemOutcome::NotStarted);
        }
        {
            let state = self.state.lock().await;
            if state.used.contains(&id) || state.failed.contains(&id) {
                return Ok(ItemOutcome::Skipped);
            }
        }

        info!(item_id = id.as_str(), "Harvesting comments");
        let result = match self.open_surface(&id).await {
            Ok(surface) => {
                let result = match self.render(surface.as_ref(), &id).await {
                    Ok(()) => self.harvest_on(surface.as_ref(), &id).await,
                    Err(e) => Err(e),
                };
                close_surface(surface.as_ref(), &id).await;
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(report) => Ok(ItemOutcome::Harvested(report)),
            Err(e) => {
                let mut state = self.state.lock().await;
                self.item_failed(&mut state, &id, e, halt)
            }
        }
    }

    async fn harvest_on(&self, surface: &dyn RenderSurface, id: &str) -> Result<HarvestReport> {
        surface
            .wait_for_selector(COMMENT_SELECTOR, self.settings.selector_timeout)
            .await
            .map_err(|e| CrawlError::render(id, Stage::CommentWait, e))?;

        let threads = surface
            .comment_threads()
            .await
            .map_err(|e| CrawlError::render(id, Stage::CommentQuery, e))?;

        let extraction = extract_commenters(id, &threads, &self.settings.acceptance, Utc::now());
        let tally = self.ledger.record_all(&extraction.records).await?;

        info!(
            item_id = id,
            threads = threads.len(),
            inserted = tally.inserted,
            duplicates = tally.duplicates,
            rejected = extraction.rejected,
            errors = extraction.errors.len(),
            "Comments harvested"
        );

        Ok(HarvestReport {
            tally,
            rejected: extraction.rejected,
            errors: extraction.errors.len() as u32,
        })
    }

    // --- Shared per-item plumbing ---

    /// Reserve `id` for expansion unless it is used, failed or already in flight.
    async fn claim(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.used.contains(id) || state.failed.contains(id) || state.in_flight.contains(id) {
            return false;
        }
        state.in_flight.insert(id.to_string());
        true
    }

    async fn open_surface(&self, id: &str) -> Result<Box<dyn RenderSurface>> {
        self.browser
            .open_context(&self.session)
            .await
            .map_err(|e| CrawlError::render(id, Stage::OpenContext, e))
    }

    /// Navigate, let the page settle, and scroll until it stops growing.
    async fn render(&self, surface: &dyn RenderSurface, id: &str) -> Result<()> {
        let url = content_url(&self.settings.content_base_url, id);
        surface
            .navigate(&url, self.settings.nav_timeout)
            .await
            .map_err(|e| CrawlError::render(id, Stage::Navigate, e))?;

        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }

        let outcome = scroll::exhaust(surface, self.settings.scroll)
            .await
            .map_err(|e| CrawlError::render(id, Stage::ScrollExhaustion, e))?;
        if !outcome.stabilized {
            warn!(item_id = id, samples = outcome.samples, "Page still growing after scroll budget");
        }
        Ok(())
    }

    fn item_failed(
        &self,
        state: &mut RunState,
        id: &str,
        err: CrawlError,
        halt: &CancellationToken,
    ) -> Result<ItemOutcome> {
        if err.is_fatal() {
            halt.cancel();
            return Err(err);
        }
        match &err {
            CrawlError::Render { stage, .. } => {
                warn!(item_id = id, stage = %stage, error = %err, "Item failed, skipping for this run");
            }
            _ => warn!(item_id = id, error = %err, "Item failed, skipping for this run"),
        }
        state.failed.insert(id.to_string());
        Ok(ItemOutcome::Failed)
    }
}

/// Contexts are closed on every path; a failed close only costs a log line.
async fn close_surface(surface: &dyn RenderSurface, id: &str) {
    if let Err(e) = surface.close().await {
        warn!(item_id = id, error = %e, "Failed to close browser context");
    }
}

fn enter(phase: CrawlPhase) {
    info!(phase = %phase, "Crawl phase");
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Fold item outcomes into `stats`, surfacing the first fatal error.
fn tally_outcomes(outcomes: Vec<Result<ItemOutcome>>, stats: &mut CrawlStats) -> Result<()> {
    let mut fatal = None;
    for outcome in outcomes {
        match outcome {
            Ok(ItemOutcome::NotStarted) => {}
            Ok(ItemOutcome::Skipped) => stats.items_skipped += 1,
            Ok(ItemOutcome::Failed) => stats.items_failed += 1,
            Ok(ItemOutcome::Expanded { added, harvest }) => {
                stats.items_expanded += 1;
                stats.frontier_additions += added as u32;
                if let Some(report) = harvest {
                    add_harvest(stats, report);
                }
            }
            Ok(ItemOutcome::Harvested(report)) => {
                stats.items_harvested += 1;
                add_harvest(stats, report);
            }
            Err(e) => {
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
    }
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn add_harvest(stats: &mut CrawlStats, report: HarvestReport) {
    stats.add_tally(report.tally);
    stats.commenters_rejected += report.rejected;
    stats.extraction_errors += report.errors;
}
