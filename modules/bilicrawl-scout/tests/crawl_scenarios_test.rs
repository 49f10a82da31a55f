//! End-to-end crawl scenarios against a scripted browser and file-backed state.
//!
//! Every test gets its own temp directory holding the checkpoint, frontier,
//! archive and JSON harvest store, so restarts can be simulated by building a
//! fresh crawler over the same directory.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bilicrawl_common::{CommenterRecord, SessionToken};
use bilicrawl_scout::checkpoint::CheckpointStore;
use bilicrawl_scout::frontier::FrontierFile;
use bilicrawl_scout::ledger::DedupLedger;
use bilicrawl_scout::scroll::ScrollPolicy;
use bilicrawl_scout::store::JsonFileHarvestStore;
use bilicrawl_scout::testing::{thread, ScriptedBrowser, ScriptedPage};
use bilicrawl_scout::{CrawlSettings, CrawlStats, Crawler};

fn video_site() -> ScriptedBrowser {
    ScriptedBrowser::new()
        .on_item(
            "BV001",
            ScriptedPage::new()
                .with_heights(vec![800, 1_600, 2_400, 2_400])
                .with_cards(&[
                    ("BV002", Some("Cats compilation")),
                    ("BV003", None),
                    ("BV001", Some("self link")),
                ])
                .with_threads(vec![
                    thread("1001", "alice", Some("level_2"), Some("great")),
                    thread("1002", "bob", Some("level_1"), Some("meh")),
                    thread("1003", "carol", Some("level_3"), None),
                    thread("1001", "alice", Some("level_2"), Some("again")),
                ]),
        )
        .on_item(
            "BV002",
            ScriptedPage::new().with_threads(vec![thread("2001", "dan", Some("level_3"), Some("hi"))]),
        )
        .on_item(
            "BV003",
            ScriptedPage::new().with_threads(vec![thread("3001", "erin", Some("level_2"), None)]),
        )
}

async fn run_crawl(dir: &Path, browser: Arc<ScriptedBrowser>, round_budget: u32) -> CrawlStats {
    let store = JsonFileHarvestStore::open(dir.join("user_info.json"), dir.join("video_info.json"))
        .await
        .unwrap();

    let settings = CrawlSettings::builder()
        .round_budget(round_budget)
        .settle_delay(Duration::ZERO)
        .scroll(ScrollPolicy {
            max_stable_retries: 2,
            sample_delay: Duration::ZERO,
            max_samples: 20,
        })
        .build();

    Crawler::builder()
        .browser(browser)
        .ledger(Arc::new(DedupLedger::new(Arc::new(store))))
        .checkpoint(CheckpointStore::new(dir.join("used_ids.json")))
        .frontier(
            FrontierFile::new(dir.join("account_info.json"), dir.join("surfaced_ids.json"))
                .with_candidates_file(dir.join("video_ids.json")),
        )
        .session(SessionToken::anonymous())
        .settings(settings)
        .build()
        .run(vec!["BV001".to_string()])
        .await
        .unwrap()
}

fn records(dir: &Path) -> Vec<CommenterRecord> {
    serde_json::from_str(&std::fs::read_to_string(dir.join("user_info.json")).unwrap()).unwrap()
}

fn used(dir: &Path) -> BTreeSet<String> {
    serde_json::from_str(&std::fs::read_to_string(dir.join("used_ids.json")).unwrap()).unwrap()
}

fn set(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn single_seed_one_round_from_empty_state() {
    let dir = tempfile::tempdir().unwrap();
    let browser = Arc::new(video_site());

    let stats = run_crawl(dir.path(), browser.clone(), 1).await;

    let frontier: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("account_info.json")).unwrap())
            .unwrap();
    assert_eq!(frontier["BV002"], "Cats compilation");
    assert_eq!(frontier["BV003"], "no title");
    assert!(frontier.get("BV001").is_none());

    assert!(used(dir.path()).contains("BV001"));

    let records = records(dir.path());
    let alice: Vec<_> = records.iter().filter(|r| r.uid == "1001").collect();
    assert_eq!(alice.len(), 1);
    assert_eq!(alice[0].content_id, "BV001");
    assert!(records.iter().any(|r| r.uid == "1003" && r.level == "level_3"));
    assert!(records.iter().all(|r| r.uid != "1002"));

    let candidates: Vec<String> =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("video_ids.json")).unwrap())
            .unwrap();
    assert!(candidates.is_empty(), "round 1 candidates were all expanded");

    assert_eq!(stats.items_expanded, 3);
    assert_eq!(stats.items_failed, 0);
    assert_eq!(browser.contexts_opened(), browser.contexts_closed());
}

#[tokio::test]
async fn replaying_against_unchanged_state_adds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    run_crawl(dir.path(), Arc::new(video_site()), 1).await;
    let before = records(dir.path());

    let browser = Arc::new(video_site());
    let stats = run_crawl(dir.path(), browser.clone(), 1).await;

    assert_eq!(records(dir.path()), before);
    assert_eq!(stats.commenters_inserted, 0);
    assert!(browser.navigations().is_empty());
}

#[tokio::test]
async fn restart_resumes_from_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();

    // Seed round only: BV002 and BV003 are harvested but left for expansion.
    run_crawl(dir.path(), Arc::new(video_site()), 0).await;
    assert_eq!(used(dir.path()), set(&["BV001"]));

    let browser = Arc::new(video_site());
    let stats = run_crawl(dir.path(), browser.clone(), 1).await;

    assert!(!browser.navigations().contains(&"BV001".to_string()));
    assert_eq!(stats.items_expanded, 2);
    assert_eq!(stats.commenters_inserted, 0);
    assert_eq!(used(dir.path()), set(&["BV001", "BV002", "BV003"]));
}
