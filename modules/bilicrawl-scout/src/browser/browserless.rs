// Browserless-backed render surface.
//
// Browserless `/function` runs one Puppeteer module per request against a
// fresh page, so a surface here does not hold a live tab. Scroll exhaustion,
// the comment-selector wait and every extraction run inside one `exhaust`
// request, and the surface answers `content`/`wait_for_selector`/
// `comment_threads` from that snapshot. Without a snapshot, each call replays
// navigate + settle + recorded scrolls before probing.
// TODO: hold a CDP websocket session per context so the stepped fallback
// stops re-rendering the page from scratch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;

use bilicrawl_common::{pair_by_position, RawCommentThread, RawCommenter, SessionToken};
use browserless_client::BrowserlessClient;

use crate::scroll::{ScrollOutcome, ScrollPolicy};
use crate::traits::{Browser, RenderSurface};

const PROBE_MODULE: &str = r##"
export default async function ({ page, context }) {
  const { url, cookies, navTimeoutMs, settleMs, scrolls, scrollDelayMs, probe, selector, selectorTimeoutMs } = context;
  const sleep = (ms) => new Promise((r) => setTimeout(r, ms));
  const height = () => page.evaluate(() => document.documentElement.scrollHeight);
  const scrollDown = () => page.evaluate(() => window.scrollTo(0, document.documentElement.scrollHeight));

  const waitFor = async () => {
    if (!selector) {
      return { found: true, error: null };
    }
    try {
      await page.waitForSelector("pierce/" + selector, { timeout: selectorTimeoutMs });
      return { found: true, error: null };
    } catch (e) {
      return { found: false, error: String(e) };
    }
  };

  const readComments = () => page.evaluate(() => {
    const deepAll = (root, sel) => {
      const out = [];
      const walk = (node) => {
        node.querySelectorAll(sel).forEach((el) => out.push(el));
        node.querySelectorAll("*").forEach((el) => { if (el.shadowRoot) walk(el.shadowRoot); });
      };
      walk(root);
      return out;
    };
    const users = deepAll(document, "bili-comment-user-info").map((el) => {
      const root = el.shadowRoot || el;
      const link = root.querySelector("#user-name a");
      const badge = root.querySelector("#user-level img");
      return {
        href: link ? link.getAttribute("href") : null,
        name: link ? link.innerText : null,
        badgeSrc: badge ? badge.getAttribute("src") : null,
      };
    });
    const bodies = deepAll(document, "bili-rich-text").map((el) => {
      const contents = (el.shadowRoot || el).querySelector("#contents");
      return contents ? contents.innerText : "";
    });
    return { users, bodies };
  });

  if (cookies && cookies.length) {
    await page.setCookie(...cookies);
  }
  await page.goto(url, { timeout: navTimeoutMs, waitUntil: "domcontentloaded" });
  await sleep(settleMs);

  const reply = (data) => ({ data, type: "application/json" });

  if (probe === "exhaust") {
    const { maxStable, maxSamples, sampleDelayMs } = context;
    let last = await height();
    let stable = 0;
    let samples = 0;
    let stabilized = false;
    for (;;) {
      await scrollDown();
      await sleep(sampleDelayMs);
      const h = await height();
      samples++;
      if (h === last) {
        stable++;
        if (stable >= maxStable) {
          stabilized = true;
          break;
        }
      } else {
        stable = 0;
        last = h;
      }
      if (samples >= maxSamples) {
        break;
      }
    }
    const wait = await waitFor();
    const comments = await readComments();
    return reply({
      samples,
      finalHeight: last,
      stabilized,
      found: wait.found,
      error: wait.error,
      html: await page.content(),
      ...comments,
    });
  }

  for (let i = 0; i < scrolls; i++) {
    await scrollDown();
    await sleep(scrollDelayMs);
  }

  if (probe === "height") {
    return reply({ height: await height() });
  }
  if (probe === "content") {
    return reply({ html: await page.content() });
  }
  if (probe === "wait") {
    return reply(await waitFor());
  }
  if (probe === "comments") {
    await waitFor();
    return reply(await readComments());
  }
  throw new Error("unknown probe " + probe);
}
"##;

/// How pages are rendered before anything is read from them.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub settle: Duration,
    /// Delay after each replayed scroll on the stepped path.
    pub scroll_delay: Duration,
    /// Selector awaited after in-page scrolling, before extraction.
    pub await_selector: Option<String>,
    pub selector_timeout: Duration,
}

pub struct BrowserlessBrowser {
    client: Arc<BrowserlessClient>,
    options: RenderOptions,
}

impl BrowserlessBrowser {
    pub fn new(client: BrowserlessClient, options: RenderOptions) -> Self {
        Self {
            client: Arc::new(client),
            options,
        }
    }
}

#[async_trait]
impl Browser for BrowserlessBrowser {
    async fn open_context(&self, session: &SessionToken) -> Result<Box<dyn RenderSurface>> {
        Ok(Box::new(ReplaySurface {
            client: self.client.clone(),
            options: self.options.clone(),
            cookies: session.cookies(),
            state: Mutex::new(ReplayState::default()),
        }))
    }
}

/// Everything read from the page after in-page scrolling.
#[derive(Debug, Clone)]
struct Snapshot {
    selector: Option<String>,
    found: bool,
    error: Option<String>,
    html: String,
    threads: Vec<RawCommentThread>,
}

#[derive(Debug, Default, Clone)]
struct ReplayState {
    url: Option<String>,
    nav_timeout: Duration,
    scrolls: u32,
    snapshot: Option<Snapshot>,
}

struct ReplaySurface {
    client: Arc<BrowserlessClient>,
    options: RenderOptions,
    cookies: Vec<serde_json::Value>,
    state: Mutex<ReplayState>,
}

#[derive(Deserialize)]
struct HeightProbe {
    height: u64,
}

#[derive(Deserialize)]
struct ContentProbe {
    html: String,
}

#[derive(Deserialize)]
struct WaitProbe {
    found: bool,
    error: Option<String>,
}

#[derive(Deserialize)]
struct CommentsProbe {
    users: Vec<UserProbe>,
    bodies: Vec<String>,
}

impl CommentsProbe {
    fn into_threads(self) -> Vec<RawCommentThread> {
        let commenters = self
            .users
            .into_iter()
            .map(|u| RawCommenter {
                profile_href: u.href,
                name_text: u.name,
                badge_src: u.badge_src,
            })
            .collect();
        pair_by_position(commenters, self.bodies)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserProbe {
    href: Option<String>,
    name: Option<String>,
    badge_src: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExhaustProbe {
    samples: u32,
    final_height: u64,
    stabilized: bool,
    found: bool,
    error: Option<String>,
    html: String,
    #[serde(flatten)]
    comments: CommentsProbe,
}

impl ReplaySurface {
    async fn probe<T: DeserializeOwned>(
        &self,
        probe: &str,
        extra: serde_json::Value,
    ) -> Result<T> {
        let state = {
            let state = self.state.lock().await;
            (state.url.clone(), state.nav_timeout, state.scrolls)
        };
        let (Some(url), nav_timeout, scrolls) = state else {
            bail!("no page loaded");
        };

        let mut context = json!({
            "url": url,
            "cookies": self.cookies,
            "navTimeoutMs": nav_timeout.as_millis() as u64,
            "settleMs": self.options.settle.as_millis() as u64,
            "scrolls": scrolls,
            "scrollDelayMs": self.options.scroll_delay.as_millis() as u64,
            "probe": probe,
        });
        if let (Some(target), Some(extra)) = (context.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }

        debug!(url = url.as_str(), probe, scrolls, "Browserless probe");
        let value = self
            .client
            .function(PROBE_MODULE, &context)
            .await
            .with_context(|| format!("{probe} probe failed for {url}"))?;
        serde_json::from_value(value).with_context(|| format!("unexpected {probe} probe reply"))
    }

    async fn snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.snapshot.clone()
    }
}

fn selector_context(selector: &str, timeout: Duration) -> serde_json::Value {
    json!({ "selector": selector, "selectorTimeoutMs": timeout.as_millis() as u64 })
}

#[async_trait]
impl RenderSurface for ReplaySurface {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        let parsed = url::Url::parse(url).context("Invalid URL")?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            bail!("Only http/https URLs allowed, got: {}", parsed.scheme());
        }

        *self.state.lock().await = ReplayState {
            url: Some(url.to_string()),
            nav_timeout: timeout,
            ..Default::default()
        };

        // Loads the page once so navigation failures surface here.
        self.probe::<HeightProbe>("height", json!({})).await?;
        Ok(())
    }

    async fn reveal_more(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scrolls += 1;
        state.snapshot = None;
        Ok(())
    }

    async fn growth_metric(&self) -> Result<u64> {
        Ok(self.probe::<HeightProbe>("height", json!({})).await?.height)
    }

    async fn scroll_in_page(&self, policy: ScrollPolicy) -> Result<Option<ScrollOutcome>> {
        let mut extra = json!({
            "maxStable": policy.max_stable_retries,
            "maxSamples": policy.max_samples,
            "sampleDelayMs": policy.sample_delay.as_millis() as u64,
        });
        if let Some(ref selector) = self.options.await_selector {
            let wait = selector_context(selector, self.options.selector_timeout);
            if let (Some(target), Some(wait)) = (extra.as_object_mut(), wait.as_object()) {
                target.extend(wait.clone());
            }
        }

        let reply: ExhaustProbe = self.probe("exhaust", extra).await?;
        let outcome = ScrollOutcome {
            samples: reply.samples,
            final_metric: reply.final_height,
            stabilized: reply.stabilized,
        };

        let mut state = self.state.lock().await;
        state.scrolls = reply.samples;
        state.snapshot = Some(Snapshot {
            selector: self.options.await_selector.clone(),
            found: reply.found,
            error: reply.error,
            html: reply.html,
            threads: reply.comments.into_threads(),
        });
        Ok(Some(outcome))
    }

    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> Result<()> {
        let reply = match self.snapshot().await {
            Some(snapshot) if snapshot.selector.as_deref() == Some(selector) => WaitProbe {
                found: snapshot.found,
                error: snapshot.error,
            },
            _ => {
                self.probe("wait", selector_context(selector, timeout))
                    .await?
            }
        };
        if !reply.found {
            bail!(
                "{selector} not found: {}",
                reply.error.unwrap_or_else(|| "timed out".to_string())
            );
        }
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        if let Some(snapshot) = self.snapshot().await {
            return Ok(snapshot.html);
        }
        Ok(self.probe::<ContentProbe>("content", json!({})).await?.html)
    }

    async fn comment_threads(&self) -> Result<Vec<RawCommentThread>> {
        if let Some(snapshot) = self.snapshot().await {
            return Ok(snapshot.threads);
        }
        let extra = match self.options.await_selector {
            Some(ref selector) => selector_context(selector, self.options.selector_timeout),
            None => json!({}),
        };
        let reply: CommentsProbe = self.probe("comments", extra).await?;
        Ok(reply.into_threads())
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock().await = ReplayState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> ReplaySurface {
        // Nothing listens here; any request made by a test fails it.
        let client =
            BrowserlessClient::new("http://127.0.0.1:9", None, Duration::from_secs(1)).unwrap();
        ReplaySurface {
            client: Arc::new(client),
            options: RenderOptions {
                settle: Duration::ZERO,
                scroll_delay: Duration::ZERO,
                await_selector: Some("bili-comment-user-info".to_string()),
                selector_timeout: Duration::from_secs(1),
            },
            cookies: Vec::new(),
            state: Mutex::new(ReplayState::default()),
        }
    }

    fn exhausted_reply() -> ExhaustProbe {
        serde_json::from_value(json!({
            "samples": 6,
            "finalHeight": 9000,
            "stabilized": true,
            "found": true,
            "error": null,
            "html": "<html><body>rendered</body></html>",
            "users": [
                { "href": "//space.bilibili.com/1", "name": "a", "badgeSrc": "level_2.svg" },
                { "href": "//space.bilibili.com/2", "name": "b", "badgeSrc": null }
            ],
            "bodies": ["hello"]
        }))
        .unwrap()
    }

    async fn with_snapshot(surface: &ReplaySurface, reply: ExhaustProbe) {
        let mut state = surface.state.lock().await;
        state.url = Some("https://www.bilibili.com/video/BV1".to_string());
        state.scrolls = reply.samples;
        state.snapshot = Some(Snapshot {
            selector: surface.options.await_selector.clone(),
            found: reply.found,
            error: reply.error,
            html: reply.html,
            threads: reply.comments.into_threads(),
        });
    }

    #[test]
    fn probe_module_is_complete() {
        assert!(PROBE_MODULE.contains("#user-name a"));
        assert!(PROBE_MODULE.contains("#contents"));
        assert!(PROBE_MODULE.trim_end().ends_with('}'));
    }

    #[tokio::test]
    async fn non_http_urls_are_rejected_before_any_request() {
        let err = surface()
            .navigate("file:///etc/passwd", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http/https"));
    }

    #[tokio::test]
    async fn probing_without_a_page_fails() {
        assert!(surface().growth_metric().await.is_err());
    }

    #[tokio::test]
    async fn reveal_counts_are_replayed_and_reset_on_close() {
        let surface = surface();
        surface.reveal_more().await.unwrap();
        surface.reveal_more().await.unwrap();
        assert_eq!(surface.state.lock().await.scrolls, 2);

        surface.close().await.unwrap();
        assert_eq!(surface.state.lock().await.scrolls, 0);
    }

    #[tokio::test]
    async fn extraction_reads_the_exhausted_render() {
        let surface = surface();
        with_snapshot(&surface, exhausted_reply()).await;

        surface
            .wait_for_selector("bili-comment-user-info", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(surface.content().await.unwrap().contains("rendered"));

        let threads = surface.comment_threads().await.unwrap();
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].body_text.as_deref(), Some("hello"));
        assert_eq!(threads[1].body_text, None);
    }

    #[tokio::test]
    async fn missing_selector_in_the_exhausted_render_fails_the_wait() {
        let surface = surface();
        let mut reply = exhausted_reply();
        reply.found = false;
        reply.error = Some("TimeoutError".to_string());
        with_snapshot(&surface, reply).await;

        let err = surface
            .wait_for_selector("bili-comment-user-info", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("TimeoutError"));
    }

    #[tokio::test]
    async fn scrolling_again_drops_the_snapshot() {
        let surface = surface();
        with_snapshot(&surface, exhausted_reply()).await;

        surface.reveal_more().await.unwrap();

        let state = surface.state.lock().await;
        assert!(state.snapshot.is_none());
        assert_eq!(state.scrolls, 7);
    }
}
