use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use bilicrawl_common::{CommenterRecord, ContentItem};

use crate::error::{CrawlError, Result};
use crate::traits::HarvestStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyRecorded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerTally {
    pub inserted: u32,
    pub duplicates: u32,
}

/// Single source of truth for "has this commenter ever been recorded".
///
/// Inserts are serialized here; the store's insert-if-absent primitive backs
/// that up against writers outside this process.
pub struct DedupLedger {
    store: Arc<dyn HarvestStore>,
    write_lock: Mutex<()>,
}

impl DedupLedger {
    pub fn new(store: Arc<dyn HarvestStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub async fn exists(&self, uid: &str) -> Result<bool> {
        self.store.commenter_exists(uid).await.map_err(ledger_error)
    }

    /// Insert `record` unless its uid is already recorded. A duplicate is
    /// logged and reported, never an error.
    pub async fn insert(&self, record: &CommenterRecord) -> Result<InsertOutcome> {
        let _guard = self.write_lock.lock().await;

        if self.exists(&record.uid).await? {
            info!(uid = record.uid.as_str(), "Commenter already recorded, skipping");
            return Ok(InsertOutcome::AlreadyRecorded);
        }

        let inserted = self
            .store
            .insert_commenter_if_absent(record)
            .await
            .map_err(ledger_error)?;

        if inserted {
            info!(
                uid = record.uid.as_str(),
                level = record.level.as_str(),
                content_id = record.content_id.as_str(),
                "Commenter recorded"
            );
            Ok(InsertOutcome::Inserted)
        } else {
            info!(uid = record.uid.as_str(), "Commenter recorded concurrently, skipping");
            Ok(InsertOutcome::AlreadyRecorded)
        }
    }

    /// Insert a batch, first occurrence of a uid wins. The store sees one
    /// batched write for everything not already recorded.
    pub async fn record_all(&self, records: &[CommenterRecord]) -> Result<LedgerTally> {
        let _guard = self.write_lock.lock().await;

        let mut tally = LedgerTally::default();
        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for record in records {
            if !seen.insert(record.uid.as_str()) || self.exists(&record.uid).await? {
                info!(uid = record.uid.as_str(), "Commenter already recorded, skipping");
                tally.duplicates += 1;
            } else {
                fresh.push(record.clone());
            }
        }
        if fresh.is_empty() {
            return Ok(tally);
        }

        let inserted = self
            .store
            .insert_commenters_if_absent(&fresh)
            .await
            .map_err(ledger_error)?;

        for (record, inserted) in fresh.iter().zip(inserted) {
            if inserted {
                info!(
                    uid = record.uid.as_str(),
                    level = record.level.as_str(),
                    content_id = record.content_id.as_str(),
                    "Commenter recorded"
                );
                tally.inserted += 1;
            } else {
                info!(uid = record.uid.as_str(), "Commenter recorded concurrently, skipping");
                tally.duplicates += 1;
            }
        }
        Ok(tally)
    }

    /// Add discovered items to the content catalog.
    pub async fn catalog(&self, items: &[ContentItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        self.store
            .upsert_content_items(items)
            .await
            .map_err(ledger_error)
    }

    /// Terminal dedup pass over everything the store holds.
    pub async fn compact(&self) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let removed = self
            .store
            .remove_duplicate_commenters()
            .await
            .map_err(ledger_error)?;
        info!(removed, store = self.store.name(), "Terminal dedup pass complete");
        Ok(removed)
    }
}

fn ledger_error(err: anyhow::Error) -> CrawlError {
    CrawlError::Ledger(format!("{err:#}"))
}
