pub mod database;
pub mod mirror;
pub mod schema;

pub use database::Database;
pub use mirror::{Mirror, MirrorStats, WriteJob};
