use anyhow::Result;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::sync::Mutex;

use super::crypto::XChaCha20Poly1305Cipher;
use super::database::{
    DatabaseV1, LedgerMapping, RunResult, ScheduleConfig, Settings, SyncInterval,
};
use super::file;
use crate::banks::Bank;

/// Handle to the persisted state, shared between the CLI facade and the
/// scheduler. All writes go through one mutex and hit disk before the
/// lock is released, which is the single-writer serialization the
/// mapping/schedule records need; last write wins.
pub struct StateStore {
    path: PathBuf,
    cipher: XChaCha20Poly1305Cipher,
    state: Mutex<DatabaseV1>,
}

impl StateStore {
    pub async fn open(path: impl Into<PathBuf>, cipher: XChaCha20Poly1305Cipher) -> Result<Self> {
        let path = path.into();
        let state = file::load(&path, &cipher).await?.unwrap_or_default();
        Ok(Self {
            path,
            cipher,
            state: Mutex::new(state),
        })
    }

    pub async fn settings(&self) -> Settings {
        self.state.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        let mut state = self.state.lock().await;
        state.settings = settings;
        self.persist(&state).await
    }

    pub async fn mapping(&self, bank: Bank) -> Option<LedgerMapping> {
        self.state.lock().await.ledger_mappings.get(&bank).cloned()
    }

    pub async fn upsert_mapping(&self, bank: Bank, mapping: LedgerMapping) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ledger_mappings.insert(bank, mapping);
        self.persist(&state).await
    }

    pub async fn list_mappings(&self) -> Vec<(Bank, LedgerMapping)> {
        let state = self.state.lock().await;
        let mut mappings: Vec<_> = state
            .ledger_mappings
            .iter()
            .map(|(bank, mapping)| (*bank, mapping.clone()))
            .collect();
        mappings.sort_by_key(|(bank, _)| *bank);
        mappings
    }

    pub async fn clear_mapping(&self, bank: Bank) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ledger_mappings.remove(&bank);
        self.persist(&state).await
    }

    pub async fn clear_all_mappings(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ledger_mappings.clear();
        self.persist(&state).await
    }

    pub async fn schedule(&self, bank: Bank) -> Option<ScheduleConfig> {
        self.state.lock().await.schedules.get(&bank).cloned()
    }

    pub async fn schedules(&self) -> Vec<(Bank, ScheduleConfig)> {
        let state = self.state.lock().await;
        let mut schedules: Vec<_> = state
            .schedules
            .iter()
            .map(|(bank, schedule)| (*bank, schedule.clone()))
            .collect();
        schedules.sort_by_key(|(bank, _)| *bank);
        schedules
    }

    pub async fn set_schedule(
        &self,
        bank: Bank,
        interval: SyncInterval,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<ScheduleConfig> {
        let mut state = self.state.lock().await;
        let schedule = state
            .schedules
            .entry(bank)
            .or_insert_with(|| ScheduleConfig::new(interval, enabled, now));
        schedule.interval = interval;
        schedule.enabled = enabled;
        schedule.next_run_at = enabled.then(|| now + interval.duration());
        let schedule = schedule.clone();
        self.persist(&state).await?;
        Ok(schedule)
    }

    /// Record the outcome of a run (scheduled or manual) and advance the
    /// timer. A manual run against a bank with no schedule gets a
    /// disabled placeholder entry so its history is still visible.
    pub async fn record_run(&self, bank: Bank, result: RunResult, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let schedule = state.schedules.entry(bank).or_insert_with(|| {
            ScheduleConfig::new(SyncInterval::Hours24, false, now)
        });
        schedule.last_run_at = Some(now);
        schedule.last_result = Some(result);
        if schedule.enabled {
            schedule.next_run_at = Some(now + schedule.interval.duration());
        }
        self.persist(&state).await
    }

    async fn persist(&self, state: &DatabaseV1) -> Result<()> {
        file::save(state.clone(), &self.path, &self.cipher).await
    }
}
