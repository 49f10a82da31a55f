// JSON-file persistence: `user_info.json` holds the commenter records,
// `video_info.json` the content catalog. Both are rewritten atomically.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use bilicrawl_common::{CommenterRecord, ContentItem};

use crate::persist::{read_json_opt, write_json_atomic};
use crate::traits::HarvestStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    title: String,
    #[serde(default)]
    label: bool,
}

struct FileState {
    records: Vec<CommenterRecord>,
    uids: HashSet<String>,
    catalog: BTreeMap<String, CatalogEntry>,
}

pub struct JsonFileHarvestStore {
    records_path: PathBuf,
    catalog_path: PathBuf,
    state: Mutex<FileState>,
}

impl JsonFileHarvestStore {
    /// Open (or start) the record and catalog files. Unparsable files are an
    /// error rather than being silently replaced.
    pub async fn open(
        records_path: impl Into<PathBuf>,
        catalog_path: impl Into<PathBuf>,
    ) -> crate::error::Result<Self> {
        let records_path = records_path.into();
        let catalog_path = catalog_path.into();

        let records: Vec<CommenterRecord> =
            read_json_opt(&records_path).await?.unwrap_or_default();
        let catalog: BTreeMap<String, CatalogEntry> =
            read_json_opt(&catalog_path).await?.unwrap_or_default();
        let uids = records.iter().map(|r| r.uid.clone()).collect();

        info!(
            path = %records_path.display(),
            records = records.len(),
            catalog = catalog.len(),
            "Opened file harvest store"
        );

        Ok(Self {
            records_path,
            catalog_path,
            state: Mutex::new(FileState {
                records,
                uids,
                catalog,
            }),
        })
    }
}

/// Keep the first record for every uid. Returns the survivors and how many were dropped.
fn dedup_by_uid(records: Vec<CommenterRecord>) -> (Vec<CommenterRecord>, u64) {
    let before = records.len();
    let mut seen = HashSet::new();
    let kept: Vec<CommenterRecord> = records
        .into_iter()
        .filter(|r| seen.insert(r.uid.clone()))
        .collect();
    let removed = (before - kept.len()) as u64;
    (kept, removed)
}

#[async_trait]
impl HarvestStore for JsonFileHarvestStore {
    async fn commenter_exists(&self, uid: &str) -> Result<bool> {
        Ok(self.state.lock().await.uids.contains(uid))
    }

    async fn insert_commenter_if_absent(&self, record: &CommenterRecord) -> Result<bool> {
        let inserted = self
            .insert_commenters_if_absent(std::slice::from_ref(record))
            .await?;
        Ok(inserted.first().copied().unwrap_or(false))
    }

    /// Appends every new uid, then rewrites `user_info.json` once.
    async fn insert_commenters_if_absent(&self, records: &[CommenterRecord]) -> Result<Vec<bool>> {
        let mut state = self.state.lock().await;
        let before = state.records.len();
        let mut batch_uids = HashSet::new();
        let mut inserted = Vec::with_capacity(records.len());

        for record in records {
            let new = !state.uids.contains(&record.uid) && batch_uids.insert(record.uid.clone());
            if new {
                state.records.push(record.clone());
            }
            inserted.push(new);
        }
        if batch_uids.is_empty() {
            return Ok(inserted);
        }

        if let Err(e) = write_json_atomic(&self.records_path, &state.records).await {
            state.records.truncate(before);
            return Err(e.into());
        }
        state.uids.extend(batch_uids);
        Ok(inserted)
    }

    async fn remove_duplicate_commenters(&self) -> Result<u64> {
        let mut state = self.state.lock().await;

        // Re-read from disk so records appended by other writers are included.
        let on_disk: Vec<CommenterRecord> =
            read_json_opt(&self.records_path).await?.unwrap_or_default();
        let (kept, removed) = dedup_by_uid(on_disk);

        if removed > 0 {
            write_json_atomic(&self.records_path, &kept).await?;
        }
        state.uids = kept.iter().map(|r| r.uid.clone()).collect();
        state.records = kept;
        Ok(removed)
    }

    async fn upsert_content_items(&self, items: &[ContentItem]) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut changed = false;
        for item in items {
            if !state.catalog.contains_key(&item.id) {
                state.catalog.insert(
                    item.id.clone(),
                    CatalogEntry {
                        title: item.display_title().to_string(),
                        label: false,
                    },
                );
                changed = true;
            }
        }
        if changed {
            write_json_atomic(&self.catalog_path, &state.catalog).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "json-file"
    }
}
