use crate::ledger::LedgerTally;

/// Stats from a crawl run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlStats {
    pub rounds_completed: u32,
    pub items_expanded: u32,
    pub items_harvested: u32,
    pub items_failed: u32,
    pub items_skipped: u32,
    pub frontier_additions: u32,
    pub commenters_inserted: u32,
    pub commenters_duplicate: u32,
    pub commenters_rejected: u32,
    pub extraction_errors: u32,
    pub duplicates_removed: u64,
    pub cancelled: bool,
}

impl CrawlStats {
    pub(crate) fn add_tally(&mut self, tally: LedgerTally) {
        self.commenters_inserted += tally.inserted;
        self.commenters_duplicate += tally.duplicates;
    }
}

impl std::fmt::Display for CrawlStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Crawl Run Complete ===")?;
        if self.cancelled {
            writeln!(f, "(cancelled before the round budget was spent)")?;
        }
        writeln!(f, "Rounds completed:   {}", self.rounds_completed)?;
        writeln!(f, "Items expanded:     {}", self.items_expanded)?;
        writeln!(f, "Items harvested:    {}", self.items_harvested)?;
        writeln!(f, "Items failed:       {}", self.items_failed)?;
        writeln!(f, "Items skipped:      {} (already used)", self.items_skipped)?;
        writeln!(f, "Frontier additions: {}", self.frontier_additions)?;
        writeln!(f, "\nCommenters:")?;
        writeln!(f, "  Inserted:          {}", self.commenters_inserted)?;
        writeln!(f, "  Already recorded:  {}", self.commenters_duplicate)?;
        writeln!(f, "  Rejected (tier):   {}", self.commenters_rejected)?;
        writeln!(f, "  Extraction errors: {}", self.extraction_errors)?;
        writeln!(f, "  Removed by dedup:  {}", self.duplicates_removed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_mentions_cancellation() {
        let stats = CrawlStats {
            cancelled: true,
            commenters_inserted: 3,
            ..Default::default()
        };
        let report = stats.to_string();
        assert!(report.contains("cancelled"));
        assert!(report.contains("Inserted:          3"));
    }
}
