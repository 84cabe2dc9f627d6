use serde::{Deserialize, Serialize};

mod crypto;
mod database;
mod file;
mod store;

/// On-disk format is versioned so a future layout change can migrate
/// instead of discarding state.
#[derive(Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq, Eq, Debug))]
pub enum Database {
    V1(DatabaseV1),
}

pub use crypto::{Cipher, XChaCha20Poly1305Cipher};
pub use database::{
    DatabaseV1, LedgerMapping, RunResult, ScheduleConfig, Settings, SyncInterval,
};
pub use store::StateStore;
