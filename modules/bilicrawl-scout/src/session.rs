use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use bilicrawl_common::SessionToken;

use crate::error::CrawlError;
use crate::persist::{read_json_opt, write_json_atomic};
use crate::traits::SessionProvider;

/// Load the persisted session, or obtain and persist a fresh one.
///
/// An unparsable token file is treated like a missing one. If the provider
/// cannot produce a session the run cannot start.
pub async fn ensure_session(
    path: &Path,
    provider: &dyn SessionProvider,
) -> crate::error::Result<SessionToken> {
    match read_json_opt::<SessionToken>(path).await {
        Ok(Some(token)) => {
            info!(path = %path.display(), "Loaded persisted session");
            return Ok(token);
        }
        Ok(None) => info!(path = %path.display(), "No persisted session"),
        Err(CrawlError::CorruptState { .. }) => {
            warn!(path = %path.display(), "Persisted session is unreadable, obtaining a new one");
        }
        Err(e) => return Err(e),
    }

    let token = provider
        .obtain_session()
        .await
        .map_err(|e| CrawlError::AuthenticationUnavailable(format!("{e:#}")))?;

    write_json_atomic(path, &token).await?;
    info!(path = %path.display(), "Session persisted");
    Ok(token)
}

/// Waits for an operator to log in by hand and export the browser's storage
/// state to `drop_path`.
pub struct ManualLoginProvider {
    login_url: String,
    drop_path: PathBuf,
    wait: Duration,
    poll_interval: Duration,
}

impl ManualLoginProvider {
    pub fn new(drop_path: impl Into<PathBuf>, wait: Duration) -> Self {
        Self {
            login_url: "https://www.bilibili.com/".to_string(),
            drop_path: drop_path.into(),
            wait,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait]
impl SessionProvider for ManualLoginProvider {
    async fn obtain_session(&self) -> Result<SessionToken> {
        info!(
            url = self.login_url.as_str(),
            drop_path = %self.drop_path.display(),
            wait_secs = self.wait.as_secs(),
            "Log in manually, then export the browser storage state to the drop path"
        );

        let deadline = Instant::now() + self.wait;
        loop {
            match read_json_opt::<SessionToken>(&self.drop_path).await {
                Ok(Some(token)) => {
                    info!(path = %self.drop_path.display(), "Picked up exported session");
                    return Ok(token);
                }
                Ok(None) => {}
                // Probably still being written.
                Err(CrawlError::CorruptState { .. }) => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                bail!(
                    "no session exported to {} within {}s",
                    self.drop_path.display(),
                    self.wait.as_secs()
                );
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
