use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{
    AccountId, FileId, LedgerAccount, LedgerClient, LedgerFile, LedgerTransaction, UpsertStatus,
};
use crate::error::SyncError;

/// In-memory stand-in for the ledger bridge, honoring the
/// at-most-one-per-external-id contract.
pub struct FakeLedger {
    files: Vec<LedgerFile>,
    accounts: Vec<LedgerAccount>,
    fail_external_ids: HashSet<String>,
    stored: Mutex<HashMap<String, LedgerTransaction>>,
}

impl FakeLedger {
    pub fn new() -> Self {
        Self {
            files: vec![LedgerFile {
                id: FileId("file-1".to_string()),
                name: "Household".to_string(),
            }],
            accounts: vec![LedgerAccount {
                id: AccountId("account-1".to_string()),
                name: "Ibercaja común".to_string(),
                closed: false,
            }],
            fail_external_ids: HashSet::new(),
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Make upserts of the given external ids fail, to test row-scoped
    /// failure reporting.
    pub fn failing_ids(mut self, ids: impl IntoIterator<Item = String>) -> Self {
        self.fail_external_ids.extend(ids);
        self
    }

    pub fn stored_count(&self) -> usize {
        self.stored.lock().unwrap().len()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.stored.lock().unwrap().contains_key(external_id)
    }
}

#[async_trait]
impl LedgerClient for FakeLedger {
    async fn list_files(&self) -> Result<Vec<LedgerFile>, SyncError> {
        Ok(self.files.clone())
    }

    async fn list_accounts(&self, _file: &FileId) -> Result<Vec<LedgerAccount>, SyncError> {
        Ok(self.accounts.clone())
    }

    async fn upsert_transactions(
        &self,
        _file: &FileId,
        _account: &AccountId,
        batch: &[LedgerTransaction],
    ) -> Result<Vec<UpsertStatus>, SyncError> {
        let mut stored = self.stored.lock().unwrap();
        Ok(batch
            .iter()
            .map(|transaction| {
                if self.fail_external_ids.contains(&transaction.external_id) {
                    UpsertStatus::Failed("upsert rejected by ledger".to_string())
                } else if stored.contains_key(&transaction.external_id) {
                    UpsertStatus::Duplicate
                } else {
                    stored.insert(transaction.external_id.clone(), transaction.clone());
                    UpsertStatus::Inserted
                }
            })
            .collect())
    }
}
