use crate::state::db::test_helper::TemporaryDatabase;

mod db;
mod inflight;
mod lock;

pub type Database = db::Database;
pub type FileLock = lock::FileLock;
pub use inflight::{InFlight, InFlightGuard};

pub const DATABASE_FILE_NAME: &str = "certrelay.sqlite";

pub async fn open_test_db() -> TemporaryDatabase {
    db::test_helper::open_db().await
}
