//! Discovered-but-unprocessed content, keyed by id.
//!
//! The frontier file is only ever read-merged-written: a new expansion batch
//! adds ids it has not seen and never overwrites a title it has. Compaction
//! moves processed ids into the surfaced archive rather than dropping them,
//! so no discovered title is ever lost.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use bilicrawl_common::ContentItem;

use crate::error::Result;
use crate::persist::{read_json_opt, write_json_atomic};

/// Id → title mapping in discovery order. Equality ignores order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Frontier {
    entries: IndexMap<String, String>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn title(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Union `items` in. Titles already present win. Returns how many ids were new.
    pub fn merge<I>(&mut self, items: I) -> usize
    where
        I: IntoIterator<Item = ContentItem>,
    {
        let mut added = 0;
        for item in items {
            if !self.entries.contains_key(&item.id) {
                let title = item.display_title().to_string();
                self.entries.insert(item.id, title);
                added += 1;
            }
        }
        added
    }

    /// Union another frontier in with the same existing-wins rule.
    pub fn absorb(&mut self, other: Frontier) -> usize {
        let mut added = 0;
        for (id, title) in other.entries {
            if let Entry::Vacant(slot) = self.entries.entry(id) {
                slot.insert(title);
                added += 1;
            }
        }
        added
    }

    /// Ids still waiting for processing, in frontier order.
    pub fn candidate_ids(&self, used: &BTreeSet<String>, skip: &HashSet<String>) -> Vec<String> {
        self.entries
            .keys()
            .filter(|id| !used.contains(*id) && !skip.contains(*id))
            .cloned()
            .collect()
    }

    /// Remove and return every entry whose id is in `used`.
    pub fn split_processed(&mut self, used: &BTreeSet<String>) -> Frontier {
        let (processed, pending): (IndexMap<_, _>, IndexMap<_, _>) =
            std::mem::take(&mut self.entries)
                .into_iter()
                .partition(|(id, _)| used.contains(id));
        self.entries = pending;
        Frontier { entries: processed }
    }
}

impl FromIterator<(String, String)> for Frontier {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// File-backed frontier plus its surfaced archive and candidate list.
pub struct FrontierFile {
    path: PathBuf,
    surfaced_path: PathBuf,
    candidates_path: Option<PathBuf>,
}

impl FrontierFile {
    pub fn new(path: impl Into<PathBuf>, surfaced_path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            surfaced_path: surfaced_path.into(),
            candidates_path: None,
        }
    }

    /// Also write each round's candidate ids to `path`.
    pub fn with_candidates_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.candidates_path = Some(path.into());
        self
    }

    /// Load the frontier. A missing or blank file is empty; an unparsable one
    /// is an error, since overwriting it would destroy discovered titles.
    pub async fn load(&self) -> Result<Frontier> {
        Ok(read_json_opt(&self.path).await?.unwrap_or_default())
    }

    pub async fn load_surfaced(&self) -> Result<Frontier> {
        Ok(read_json_opt(&self.surfaced_path).await?.unwrap_or_default())
    }

    /// Read the file, merge `items` in (existing titles win), write it back.
    /// Returns how many ids were new.
    pub async fn merge_and_persist(&self, items: Vec<ContentItem>) -> Result<usize> {
        let mut frontier = self.load().await?;
        let added = frontier.merge(items);
        if added > 0 {
            write_json_atomic(&self.path, &frontier).await?;
        }
        Ok(added)
    }

    /// Move processed entries into the surfaced archive. Returns how many moved.
    pub async fn compact(&self, used: &BTreeSet<String>) -> Result<usize> {
        let mut frontier = self.load().await?;
        let processed = frontier.split_processed(used);
        if processed.is_empty() {
            return Ok(0);
        }
        let moved = processed.len();

        // Archive first: a crash between the two writes leaves an id in both
        // files, which the next compaction resolves.
        let mut surfaced = self.load_surfaced().await?;
        surfaced.absorb(processed);
        write_json_atomic(&self.surfaced_path, &surfaced).await?;
        write_json_atomic(&self.path, &frontier).await?;

        info!(moved, pending = frontier.len(), "Compacted frontier");
        Ok(moved)
    }

    /// Derive the next candidates from the persisted frontier.
    pub async fn candidate_ids(
        &self,
        used: &BTreeSet<String>,
        skip: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let candidates = self.load().await?.candidate_ids(used, skip);
        if let Some(ref path) = self.candidates_path {
            write_json_atomic(path, &candidates).await?;
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CrawlError;

    fn item(id: &str, title: &str) -> ContentItem {
        ContentItem::new(id, Some(title.to_string()))
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn existing_titles_win_on_merge() {
        let mut frontier = Frontier::new();
        frontier.merge([item("A", "t1")]);

        let added = frontier.merge([item("A", "t2"), item("B", "t3")]);

        assert_eq!(added, 1);
        assert_eq!(frontier.title("A"), Some("t1"));
        assert_eq!(frontier.title("B"), Some("t3"));
        assert_eq!(frontier.len(), 2);
    }

    #[test]
    fn untitled_items_get_placeholder() {
        let mut frontier = Frontier::new();
        frontier.merge([ContentItem::new("A", None)]);
        assert_eq!(frontier.title("A"), Some(bilicrawl_common::UNTITLED));
    }

    #[test]
    fn candidates_exclude_used_and_skipped() {
        let mut frontier = Frontier::new();
        frontier.merge([item("A", "a"), item("B", "b"), item("C", "c")]);

        let skip: HashSet<String> = ["C".to_string()].into_iter().collect();
        assert_eq!(frontier.candidate_ids(&set(&["A"]), &skip), vec!["B"]);
    }

    #[tokio::test]
    async fn candidates_follow_discovery_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = FrontierFile::new(dir.path().join("account_info.json"), dir.path().join("s.json"));

        file.merge_and_persist(vec![item("BVz", "z"), item("BVa", "a")])
            .await
            .unwrap();
        file.merge_and_persist(vec![item("BVm", "m"), item("BVz", "again")])
            .await
            .unwrap();

        let ids = file.candidate_ids(&BTreeSet::new(), &HashSet::new()).await.unwrap();
        assert_eq!(ids, vec!["BVz", "BVa", "BVm"]);

        let raw = std::fs::read_to_string(dir.path().join("account_info.json")).unwrap();
        assert!(raw.find("BVz").unwrap() < raw.find("BVa").unwrap());
    }

    #[test]
    fn split_processed_partitions_by_used() {
        let mut frontier = Frontier::new();
        frontier.merge([item("A", "a"), item("B", "b")]);

        let processed = frontier.split_processed(&set(&["A"]));

        assert!(processed.contains("A"));
        assert!(!frontier.contains("A"));
        assert!(frontier.contains("B"));
    }

    #[tokio::test]
    async fn file_merge_is_non_destructive() {
        let dir = tempfile::tempdir().unwrap();
        let file = FrontierFile::new(dir.path().join("account_info.json"), dir.path().join("s.json"));

        file.merge_and_persist(vec![item("A", "t1")]).await.unwrap();
        let added = file
            .merge_and_persist(vec![item("A", "t2"), item("B", "t3")])
            .await
            .unwrap();

        assert_eq!(added, 1);
        let loaded = file.load().await.unwrap();
        let expected: Frontier = [("A", "t1"), ("B", "t3")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(loaded, expected);
    }

    #[tokio::test]
    async fn file_merge_keeps_entries_written_by_others() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_info.json");
        std::fs::write(&path, r#"{"X": "external"}"#).unwrap();

        let file = FrontierFile::new(&path, dir.path().join("s.json"));
        file.merge_and_persist(vec![item("A", "a")]).await.unwrap();

        let loaded = file.load().await.unwrap();
        assert_eq!(loaded.title("X"), Some("external"));
        assert_eq!(loaded.title("A"), Some("a"));
    }

    #[tokio::test]
    async fn corrupt_frontier_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account_info.json");
        std::fs::write(&path, "{oops").unwrap();

        let file = FrontierFile::new(&path, dir.path().join("s.json"));
        let err = file.merge_and_persist(vec![item("A", "a")]).await.unwrap_err();

        assert!(matches!(err, CrawlError::CorruptState { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{oops");
    }

    #[tokio::test]
    async fn compaction_moves_titles_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let file = FrontierFile::new(
            dir.path().join("account_info.json"),
            dir.path().join("surfaced_ids.json"),
        );
        file.merge_and_persist(vec![item("A", "a"), item("B", "b")])
            .await
            .unwrap();

        let moved = file.compact(&set(&["A"])).await.unwrap();

        assert_eq!(moved, 1);
        let frontier = file.load().await.unwrap();
        let surfaced = file.load_surfaced().await.unwrap();
        assert!(!frontier.contains("A"));
        assert!(frontier.contains("B"));
        assert_eq!(surfaced.title("A"), Some("a"));
    }

    #[tokio::test]
    async fn candidates_are_written_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let candidates_path = dir.path().join("video_ids.json");
        let file = FrontierFile::new(
            dir.path().join("account_info.json"),
            dir.path().join("surfaced_ids.json"),
        )
        .with_candidates_file(&candidates_path);
        file.merge_and_persist(vec![item("A", "a"), item("B", "b")])
            .await
            .unwrap();

        let ids = file.candidate_ids(&set(&["B"]), &HashSet::new()).await.unwrap();

        assert_eq!(ids, vec!["A"]);
        let written: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(candidates_path).unwrap()).unwrap();
        assert_eq!(written, vec!["A"]);
    }
}
