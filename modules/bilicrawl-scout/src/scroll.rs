use std::time::Duration;

use tracing::debug;

use crate::traits::RenderSurface;

/// Controls how long the scroll driver keeps revealing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollPolicy {
    /// Consecutive unchanged samples that count as "fully loaded".
    pub max_stable_retries: u32,
    pub sample_delay: Duration,
    /// Hard cap on samples per page, for feeds that never stop growing.
    pub max_samples: u32,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self {
            max_stable_retries: 5,
            sample_delay: Duration::from_millis(2_000),
            max_samples: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollVerdict {
    Grew,
    Unchanged,
    Stable,
    BudgetExhausted,
}

impl ScrollVerdict {
    pub fn is_terminal(self) -> bool {
        matches!(self, ScrollVerdict::Stable | ScrollVerdict::BudgetExhausted)
    }
}

/// Tracks growth-metric samples until the page stops growing.
///
/// An equal sample bumps the stable counter; any change (up or down) resets
/// it and becomes the new baseline.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    policy: ScrollPolicy,
    stable_count: u32,
    last_metric: u64,
    samples: u32,
}

impl StabilityTracker {
    pub fn new(policy: ScrollPolicy, initial_metric: u64) -> Self {
        Self {
            policy,
            stable_count: 0,
            last_metric: initial_metric,
            samples: 0,
        }
    }

    pub fn observe(&mut self, metric: u64) -> ScrollVerdict {
        self.samples += 1;

        let verdict = if metric == self.last_metric {
            self.stable_count += 1;
            if self.stable_count >= self.policy.max_stable_retries {
                return ScrollVerdict::Stable;
            }
            ScrollVerdict::Unchanged
        } else {
            self.stable_count = 0;
            self.last_metric = metric;
            ScrollVerdict::Grew
        };

        if self.samples >= self.policy.max_samples {
            ScrollVerdict::BudgetExhausted
        } else {
            verdict
        }
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn last_metric(&self) -> u64 {
        self.last_metric
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollOutcome {
    pub samples: u32,
    pub final_metric: u64,
    /// False when the sample budget ran out before the page settled.
    pub stabilized: bool,
}

/// Scroll `surface` until its growth metric stops changing.
pub async fn exhaust(surface: &dyn RenderSurface, policy: ScrollPolicy) -> anyhow::Result<ScrollOutcome> {
    if let Some(outcome) = surface.scroll_in_page(policy).await? {
        debug!(samples = outcome.samples, stabilized = outcome.stabilized, "Scrolled in page");
        return Ok(outcome);
    }

    let initial = surface.growth_metric().await?;
    let mut tracker = StabilityTracker::new(policy, initial);

    loop {
        surface.reveal_more().await?;
        if !policy.sample_delay.is_zero() {
            tokio::time::sleep(policy.sample_delay).await;
        }
        let metric = surface.growth_metric().await?;
        let verdict = tracker.observe(metric);
        debug!(metric, ?verdict, stable = tracker.stable_count(), "Scroll sample");

        if verdict.is_terminal() {
            return Ok(ScrollOutcome {
                samples: tracker.samples(),
                final_metric: tracker.last_metric(),
                stabilized: verdict == ScrollVerdict::Stable,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSurface;

    fn quick(max_stable_retries: u32, max_samples: u32) -> ScrollPolicy {
        ScrollPolicy {
            max_stable_retries,
            sample_delay: Duration::ZERO,
            max_samples,
        }
    }

    #[test]
    fn growth_resets_the_stable_counter() {
        let mut tracker = StabilityTracker::new(quick(2, 100), 100);

        assert_eq!(tracker.observe(100), ScrollVerdict::Unchanged);
        assert_eq!(tracker.observe(200), ScrollVerdict::Grew);
        assert_eq!(tracker.stable_count(), 0);
        assert_eq!(tracker.observe(200), ScrollVerdict::Unchanged);
        assert_eq!(tracker.observe(200), ScrollVerdict::Stable);
        assert_eq!(tracker.last_metric(), 200);
    }

    #[test]
    fn shrinking_page_counts_as_change() {
        let mut tracker = StabilityTracker::new(quick(1, 100), 500);
        assert_eq!(tracker.observe(400), ScrollVerdict::Grew);
        assert_eq!(tracker.last_metric(), 400);
        assert_eq!(tracker.observe(400), ScrollVerdict::Stable);
    }

    #[test]
    fn sample_budget_caps_endless_feeds() {
        let mut tracker = StabilityTracker::new(quick(5, 3), 0);
        assert_eq!(tracker.observe(1), ScrollVerdict::Grew);
        assert_eq!(tracker.observe(2), ScrollVerdict::Grew);
        assert_eq!(tracker.observe(3), ScrollVerdict::BudgetExhausted);
    }

    #[tokio::test]
    async fn exhaust_stops_after_consecutive_equal_samples() {
        // 100 -> 200 -> 300 -> 300 x5
        let surface = ScriptedSurface::with_heights(vec![100, 200, 300, 300, 300, 300, 300, 300]);

        let outcome = exhaust(&surface, quick(5, 120)).await.unwrap();

        assert!(outcome.stabilized);
        assert_eq!(outcome.final_metric, 300);
        assert_eq!(outcome.samples, 7);
        assert_eq!(surface.reveal_count(), 7);
    }

    #[tokio::test]
    async fn exhaust_reports_unsettled_page() {
        let surface = ScriptedSurface::with_heights((0..50).collect());

        let outcome = exhaust(&surface, quick(5, 10)).await.unwrap();

        assert!(!outcome.stabilized);
        assert_eq!(outcome.samples, 10);
    }

    /// Runs its own loop; the step-by-step primitives must not be touched.
    struct InPageSurface;

    #[async_trait::async_trait]
    impl RenderSurface for InPageSurface {
        async fn navigate(&self, _url: &str, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reveal_more(&self) -> anyhow::Result<()> {
            anyhow::bail!("stepped scroll on an in-page surface")
        }
        async fn growth_metric(&self) -> anyhow::Result<u64> {
            anyhow::bail!("stepped sample on an in-page surface")
        }
        async fn scroll_in_page(&self, policy: ScrollPolicy) -> anyhow::Result<Option<ScrollOutcome>> {
            Ok(Some(ScrollOutcome {
                samples: policy.max_stable_retries,
                final_metric: 4_200,
                stabilized: true,
            }))
        }
        async fn wait_for_selector(&self, _selector: &str, _timeout: Duration) -> anyhow::Result<()> {
            Ok(())
        }
        async fn content(&self) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn comment_threads(&self) -> anyhow::Result<Vec<bilicrawl_common::RawCommentThread>> {
            Ok(Vec::new())
        }
        async fn close(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn in_page_scrolling_replaces_the_stepped_loop() {
        let outcome = exhaust(&InPageSurface, quick(3, 120)).await.unwrap();

        assert_eq!(
            outcome,
            ScrollOutcome {
                samples: 3,
                final_metric: 4_200,
                stabilized: true,
            }
        );
    }
}
