use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::banks::Bank;
use crate::ledger::CertTrust;

/// Everything that survives a process restart. Secrets never appear here;
/// they live only in the in-memory vault.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct DatabaseV1 {
    pub settings: Settings,
    pub ledger_mappings: HashMap<Bank, LedgerMapping>,
    pub schedules: HashMap<Bank, ScheduleConfig>,
}

impl DatabaseV1 {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            ledger_mappings: HashMap::new(),
            schedules: HashMap::new(),
        }
    }
}

impl Default for DatabaseV1 {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection endpoints for the two external collaborators.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct Settings {
    pub ledger_url: Option<String>,
    pub automation_url: Option<String>,
    pub cert_trust: CertTrust,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ledger_url: None,
            automation_url: None,
            cert_trust: CertTrust::SystemRoots,
        }
    }
}

/// Where one bank's transactions land in the ledger. Created on the first
/// sync that reaches a successful upsert, updated on re-selection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct LedgerMapping {
    pub ledger_file_id: String,
    pub account_id: String,
    /// Whether the ledger file needs an encryption password. The password
    /// itself is vault-only.
    pub uses_encryption: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub struct ScheduleConfig {
    pub interval: SyncInterval,
    pub enabled: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_result: Option<RunResult>,
}

impl ScheduleConfig {
    pub fn new(interval: SyncInterval, enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            interval,
            enabled,
            next_run_at: enabled.then(|| now + interval.duration()),
            last_run_at: None,
            last_result: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// The enumerated intervals a schedule may use.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncInterval {
    Hours1,
    Hours3,
    Hours6,
    Hours12,
    Hours24,
}

impl SyncInterval {
    pub const ALL: [SyncInterval; 5] = [
        SyncInterval::Hours1,
        SyncInterval::Hours3,
        SyncInterval::Hours6,
        SyncInterval::Hours12,
        SyncInterval::Hours24,
    ];

    pub fn duration(&self) -> Duration {
        Duration::hours(match self {
            SyncInterval::Hours1 => 1,
            SyncInterval::Hours3 => 3,
            SyncInterval::Hours6 => 6,
            SyncInterval::Hours12 => 12,
            SyncInterval::Hours24 => 24,
        })
    }
}

impl fmt::Display for SyncInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h", self.duration().num_hours())
    }
}

impl FromStr for SyncInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncInterval::ALL
            .into_iter()
            .find(|interval| interval.to_string() == s)
            .ok_or_else(|| format!("unknown interval {s:?}, expected one of: 1h, 3h, 6h, 12h, 24h"))
    }
}

/// Outcome of the most recent scheduled or manual run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    Success,
    PartialFailure(u32),
    MissingPrerequisites,
    Busy,
    Error(String),
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Success => f.write_str("success"),
            RunResult::PartialFailure(count) => write!(f, "partial failure ({count} rows)"),
            RunResult::MissingPrerequisites => f.write_str("skipped: missing prerequisites"),
            RunResult::Busy => f.write_str("skipped: busy"),
            RunResult::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}
