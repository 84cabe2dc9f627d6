pub mod args;
pub mod banks;
pub mod cli;
pub mod db;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod normalize;
pub mod scheduler;
pub mod session;
pub mod sync;
pub mod terminal;
pub mod vault;
