// Production `HarvestStore` adapters.
//
// Postgres when a database URL is configured, JSON files otherwise.

mod file;
mod postgres;

pub use file::JsonFileHarvestStore;
pub use postgres::PgHarvestStore;
