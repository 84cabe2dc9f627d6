use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

mod rest;

#[cfg(test)]
pub(crate) mod fake;

pub use rest::RestLedgerClient;

use crate::error::SyncError;

/// Whether to accept the ledger server's certificate when it isn't signed
/// by a system root. Self-hosted ledgers commonly run on self-signed
/// certs; the operator decides, we never hardcode it.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertTrust {
    SystemRoots,
    TrustAny,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(pub String);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountId(pub String);

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LedgerFile {
    pub id: FileId,
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LedgerAccount {
    pub id: AccountId,
    pub name: String,
    pub closed: bool,
}

/// One transaction in the shape the ledger ingests, identity attached.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub external_id: String,
    pub date: NaiveDate,
    pub payee: String,
    pub notes: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

/// Per-row verdict from the ledger. The ledger's own
/// at-most-one-per-external-id guarantee is what turns repeated imports
/// into `Duplicate` instead of double bookings; we consume that contract,
/// we don't reimplement it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertStatus {
    Inserted,
    Duplicate,
    Failed(String),
}

/// The budgeting ledger, consumed as a remote service.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn list_files(&self) -> Result<Vec<LedgerFile>, SyncError>;

    async fn list_accounts(&self, file: &FileId) -> Result<Vec<LedgerAccount>, SyncError>;

    /// Upsert a batch keyed by external id. Must return one status per
    /// input row, in input order.
    async fn upsert_transactions(
        &self,
        file: &FileId,
        account: &AccountId,
        batch: &[LedgerTransaction],
    ) -> Result<Vec<UpsertStatus>, SyncError>;
}
