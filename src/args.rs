use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::banks::Bank;
use crate::db::SyncInterval;

/// Download movements from bank portals and push them into the budgeting
/// ledger.
#[derive(Parser, Debug)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create a new state file in the local directory
    Init,

    /// Map a bank to a ledger file and account
    SetMapping { bank: Bank },

    /// List the stored bank-to-ledger mappings
    ListMappings,

    /// Remove the stored mapping for one bank, or all of them
    ClearMapping {
        /// Bank to clear; leave out together with --all
        bank: Option<Bank>,
        /// Clear the mappings of every bank
        #[clap(long)]
        all: bool,
    },

    /// Push an export file that was downloaded by hand into the ledger
    Import { bank: Bank, file: PathBuf },

    /// Run a full portal-to-ledger pass for one bank right now
    RunNow { bank: Bank },

    /// Set or change the unattended sync timer for a bank
    Schedule {
        bank: Bank,
        interval: SyncInterval,
        /// Keep the schedule stored but stop running it
        #[clap(long)]
        disable: bool,
    },

    /// Show mappings, schedules and the outcome of recent runs
    Status,

    /// Stay in the foreground and run schedules as they come due
    Watch,
}

pub fn parse() -> Args {
    Args::parse()
}
