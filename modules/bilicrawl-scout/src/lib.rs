pub mod browser;
pub mod checkpoint;
pub mod error;
pub mod expander;
pub mod extractor;
pub mod frontier;
pub mod ledger;
pub mod orchestrator;
mod persist;
pub mod scroll;
pub mod session;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use error::{CrawlError, Result};
pub use orchestrator::{CrawlSettings, Crawler};
pub use stats::CrawlStats;
