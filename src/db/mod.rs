pub mod connection;
pub mod helpers;
pub mod migrations;
pub mod models;
pub mod persistence;
pub mod repositories;

pub use connection::Database;
pub use models::{SessionRecord, SessionStatus};
pub use persistence::{Persistence, StoreFuture};
