use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Crawl configuration loaded from environment variables (and `.env`).
///
/// Every field has a default so a bare `cargo run` crawls from the default
/// seed with file-backed state in the working directory.
#[derive(Debug, Clone)]
pub struct Config {
    // Traversal
    pub seed_ids: Vec<String>,
    pub round_budget: u32,
    pub max_concurrent_items: usize,
    pub accepted_levels: Vec<String>,

    // State files
    pub checkpoint_path: PathBuf,
    pub frontier_path: PathBuf,
    pub surfaced_path: PathBuf,
    pub candidates_path: PathBuf,

    // Session
    pub session_token_path: PathBuf,
    pub login_export_path: PathBuf,
    pub login_wait: Duration,

    // Output sinks
    pub database_url: Option<String>,
    pub user_info_path: PathBuf,
    pub content_catalog_path: PathBuf,

    // Browser
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub content_base_url: String,
    pub nav_timeout: Duration,
    pub settle_delay: Duration,
    pub selector_timeout: Duration,
    pub scroll_max_stable: u32,
    pub scroll_delay: Duration,
    pub scroll_max_samples: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            seed_ids: list_env("SEED_IDS", &["BV1bBoTYJEkU"]),
            round_budget: parsed_env("ROUND_BUDGET", 10)?,
            max_concurrent_items: parsed_env("MAX_CONCURRENT_ITEMS", 1)?,
            accepted_levels: list_env("ACCEPTED_LEVELS", &["level_2", "level_3"]),
            checkpoint_path: path_env("CHECKPOINT_PATH", "used_ids.json"),
            frontier_path: path_env("FRONTIER_PATH", "account_info.json"),
            surfaced_path: path_env("SURFACED_PATH", "surfaced_ids.json"),
            candidates_path: path_env("CANDIDATES_PATH", "video_ids.json"),
            session_token_path: path_env("SESSION_TOKEN_PATH", "bilibili_storage_state.json"),
            login_export_path: path_env("LOGIN_EXPORT_PATH", "login_export.json"),
            login_wait: Duration::from_secs(parsed_env("LOGIN_WAIT_SECS", 60)?),
            database_url: env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            user_info_path: path_env("USER_INFO_PATH", "user_info.json"),
            content_catalog_path: path_env("CONTENT_CATALOG_PATH", "video_info.json"),
            browserless_url: env::var("BROWSERLESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            browserless_token: env::var("BROWSERLESS_TOKEN").ok().filter(|v| !v.is_empty()),
            content_base_url: env::var("CONTENT_BASE_URL")
                .unwrap_or_else(|_| "https://www.bilibili.com/video/".to_string()),
            nav_timeout: Duration::from_millis(parsed_env("NAV_TIMEOUT_MS", 60_000)?),
            settle_delay: Duration::from_millis(parsed_env("SETTLE_MS", 5_000)?),
            selector_timeout: Duration::from_millis(parsed_env("SELECTOR_TIMEOUT_MS", 6_000)?),
            scroll_max_stable: parsed_env("SCROLL_MAX_STABLE", 5)?,
            scroll_delay: Duration::from_millis(parsed_env("SCROLL_DELAY_MS", 2_000)?),
            scroll_max_samples: parsed_env("SCROLL_MAX_SAMPLES", 120)?,
        };

        Ok(config)
    }

    /// Log the effective configuration with secrets masked.
    pub fn log_redacted(&self) {
        fn preview_opt(val: &Option<String>) -> String {
            match val {
                Some(v) if !v.is_empty() => format!("<set>({} chars)", v.len()),
                _ => "<not set>".to_string(),
            }
        }

        tracing::info!("Config loaded:");
        tracing::info!("  SEED_IDS: {}", self.seed_ids.join(","));
        tracing::info!("  ROUND_BUDGET: {}", self.round_budget);
        tracing::info!("  MAX_CONCURRENT_ITEMS: {}", self.max_concurrent_items);
        tracing::info!("  CHECKPOINT_PATH: {}", self.checkpoint_path.display());
        tracing::info!("  FRONTIER_PATH: {}", self.frontier_path.display());
        tracing::info!("  SESSION_TOKEN_PATH: {}", self.session_token_path.display());
        tracing::info!("  DATABASE_URL: {}", preview_opt(&self.database_url));
        tracing::info!("  BROWSERLESS_URL: {}", self.browserless_url);
        tracing::info!("  BROWSERLESS_TOKEN: {}", preview_opt(&self.browserless_token));
    }
}

fn path_env(key: &str, default: &str) -> PathBuf {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn list_env(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => parse_list(&raw),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn parsed_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a number, got {raw:?}")),
        _ => Ok(default),
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
