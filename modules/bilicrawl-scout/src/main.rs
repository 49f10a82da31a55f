use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bilicrawl_common::{config::parse_list, Config};
use bilicrawl_scout::browser::{BrowserlessBrowser, RenderOptions};
use bilicrawl_scout::checkpoint::CheckpointStore;
use bilicrawl_scout::frontier::FrontierFile;
use bilicrawl_scout::ledger::DedupLedger;
use bilicrawl_scout::orchestrator::COMMENT_SELECTOR;
use bilicrawl_scout::session::{ensure_session, ManualLoginProvider};
use bilicrawl_scout::store::{JsonFileHarvestStore, PgHarvestStore};
use bilicrawl_scout::traits::HarvestStore;
use bilicrawl_scout::{CrawlSettings, Crawler};
use browserless_client::BrowserlessClient;

#[derive(Parser)]
#[command(name = "bilicrawl", about = "Related-video crawler and commenter harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl from the seed ids (default)
    Run {
        /// Comma-separated seed ids, overrides SEED_IDS
        #[arg(long, env = "SEED_IDS")]
        seed: Option<String>,
        /// Expand rounds after the seed round, overrides ROUND_BUDGET
        #[arg(long, env = "ROUND_BUDGET")]
        rounds: Option<u32>,
        /// Items processed concurrently, overrides MAX_CONCURRENT_ITEMS
        #[arg(long, env = "MAX_CONCURRENT_ITEMS")]
        concurrency: Option<usize>,
    },
    /// Obtain and persist a session token, then exit
    Login,
    /// Run only the terminal dedup pass over the commenter store
    Dedup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("bilicrawl=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;

    match cli.command.unwrap_or(Command::Run {
        seed: None,
        rounds: None,
        concurrency: None,
    }) {
        Command::Run {
            seed,
            rounds,
            concurrency,
        } => {
            if let Some(seed) = seed {
                config.seed_ids = parse_list(&seed);
            }
            if let Some(rounds) = rounds {
                config.round_budget = rounds;
            }
            if let Some(concurrency) = concurrency {
                config.max_concurrent_items = concurrency;
            }
            config.log_redacted();
            run(&config).await
        }
        Command::Login => {
            let provider = ManualLoginProvider::new(&config.login_export_path, config.login_wait);
            ensure_session(&config.session_token_path, &provider).await?;
            info!(path = %config.session_token_path.display(), "Session ready");
            Ok(())
        }
        Command::Dedup => {
            let ledger = DedupLedger::new(open_store(&config).await?);
            let removed = ledger.compact().await?;
            println!("Removed {removed} duplicate commenter records");
            Ok(())
        }
    }
}

async fn run(config: &Config) -> Result<()> {
    info!("bilicrawl starting...");

    let provider = ManualLoginProvider::new(&config.login_export_path, config.login_wait);
    let session = ensure_session(&config.session_token_path, &provider).await?;

    let ledger = Arc::new(DedupLedger::new(open_store(config).await?));
    info!(store = ledger.store_name(), "Harvest store ready");

    let request_timeout = render_request_timeout(config);
    let client = BrowserlessClient::new(
        &config.browserless_url,
        config.browserless_token.as_deref(),
        request_timeout,
    )?;
    let browser = BrowserlessBrowser::new(
        client,
        RenderOptions {
            settle: config.settle_delay,
            scroll_delay: config.scroll_delay,
            await_selector: Some(COMMENT_SELECTOR.to_string()),
            selector_timeout: config.selector_timeout,
        },
    );

    let crawler = Crawler::builder()
        .browser(Arc::new(browser))
        .ledger(ledger)
        .checkpoint(CheckpointStore::new(&config.checkpoint_path))
        .frontier(
            FrontierFile::new(&config.frontier_path, &config.surfaced_path)
                .with_candidates_file(&config.candidates_path),
        )
        .session(session)
        .settings(CrawlSettings::from_config(config))
        .build();

    let cancel = crawler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight items");
            cancel.cancel();
        }
    });

    let stats = crawler.run(config.seed_ids.clone()).await?;
    println!("{stats}");
    Ok(())
}

/// One request covers navigation, settling, every scroll sample and the
/// selector wait. Saturates rather than overflowing on extreme settings.
fn render_request_timeout(config: &Config) -> Duration {
    config
        .nav_timeout
        .saturating_add(config.settle_delay)
        .saturating_add(config.scroll_delay.saturating_mul(config.scroll_max_samples))
        .saturating_add(config.selector_timeout)
}

async fn open_store(config: &Config) -> Result<Arc<dyn HarvestStore>> {
    match config.database_url {
        Some(ref url) => {
            let store = PgHarvestStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            info!(path = %config.user_info_path.display(), "DATABASE_URL not set, using JSON file store");
            let store =
                JsonFileHarvestStore::open(&config.user_info_path, &config.content_catalog_path)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_timeout_covers_every_render_step() {
        let mut config = Config::from_env().unwrap();
        config.nav_timeout = Duration::from_secs(60);
        config.settle_delay = Duration::from_secs(5);
        config.scroll_delay = Duration::from_secs(2);
        config.scroll_max_samples = 120;
        config.selector_timeout = Duration::from_secs(6);

        assert_eq!(render_request_timeout(&config), Duration::from_secs(311));
    }

    #[test]
    fn request_timeout_saturates_on_huge_settings() {
        let mut config = Config::from_env().unwrap();
        config.scroll_delay = Duration::MAX;
        config.scroll_max_samples = u32::MAX;

        assert_eq!(render_request_timeout(&config), Duration::MAX);
    }
}
