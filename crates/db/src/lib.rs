pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_url, DbPool};
pub use fixtures::{seed, SeedSummary};
