//! Ties a downloaded export to the ledger: normalize, attach identities,
//! upsert, and report per-row outcomes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::banks::Bank;
use crate::db::{LedgerMapping, StateStore};
use crate::error::SyncError;
use crate::identity;
use crate::ledger::{AccountId, FileId, LedgerClient, LedgerTransaction, UpsertStatus};
use crate::normalize::{normalize, CanonicalTransaction, RawExport};
use crate::session::{BankSession, DriverFactory, SessionControl};
use crate::vault::{CredentialVault, Scope, Secret};

/// The ledger's payee field is short; longer concepts get cut.
const PAYEE_MAX_CHARS: usize = 50;

/// Outcome of one sync pass, row-level failures included. A pass with
/// only duplicates is a success, not a no-op error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub inserted: u32,
    pub duplicates: u32,
    pub failed: Vec<RowFailure>,
}

impl SyncSummary {
    pub fn failure_count(&self) -> u32 {
        self.failed.len() as u32
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One row that did not make it into the ledger, either because it never
/// normalized or because the ledger rejected the upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Present when the row normalized far enough to get an identity.
    pub external_id: Option<String>,
    pub reason: String,
}

/// At most one pass per bank at a time. A second request for a busy bank
/// is rejected outright rather than queued; the caller retries on its
/// own schedule.
pub struct BusyGate {
    active: Arc<Mutex<HashSet<Bank>>>,
}

impl BusyGate {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn acquire(&self, bank: Bank) -> Result<BusyGuard, SyncError> {
        let mut active = self.active.lock().unwrap();
        if !active.insert(bank) {
            log::info!("{bank}: sync already in progress, rejecting");
            return Err(SyncError::Busy);
        }
        Ok(BusyGuard {
            bank,
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_busy(&self, bank: Bank) -> bool {
        self.active.lock().unwrap().contains(&bank)
    }
}

impl Default for BusyGate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct BusyGuard {
    bank: Bank,
    active: Arc<Mutex<HashSet<Bank>>>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.bank);
    }
}

/// Runs sync passes: portal session, normalization, identity, ledger
/// upsert. One instance is shared by the scheduler and the CLI commands.
pub struct SyncOrchestrator {
    store: Arc<StateStore>,
    vault: Arc<CredentialVault>,
    ledger: Arc<dyn LedgerClient>,
    gate: BusyGate,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<StateStore>,
        vault: Arc<CredentialVault>,
        ledger: Arc<dyn LedgerClient>,
    ) -> Self {
        Self {
            store,
            vault,
            ledger,
            gate: BusyGate::new(),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn ledger(&self) -> &Arc<dyn LedgerClient> {
        &self.ledger
    }

    pub fn is_busy(&self, bank: Bank) -> bool {
        self.gate.is_busy(bank)
    }

    /// What a pass for this bank needs before a browser is launched.
    pub async fn prerequisites(&self, bank: Bank) -> Result<(LedgerMapping, Secret), SyncError> {
        let mapping = self.store.mapping(bank).await.ok_or_else(|| {
            SyncError::MissingPrerequisites(format!("no ledger mapping stored for {bank}"))
        })?;
        let credential = self.vault.retrieve(Scope::Bank(bank)).ok_or_else(|| {
            SyncError::MissingPrerequisites(format!(
                "no credential in the vault for scope {}",
                bank.credential_id(),
            ))
        })?;
        Ok((mapping, credential))
    }

    /// Full pass: launch a browser, walk the portal, push the export to
    /// the ledger. `hand_control` receives the session control handle
    /// before the portal work starts, so the caller can cancel and relay
    /// second-factor prompts.
    pub async fn run_pass(
        &self,
        bank: Bank,
        drivers: &dyn DriverFactory,
        hand_control: impl FnOnce(SessionControl),
    ) -> Result<SyncSummary, SyncError> {
        let _guard = self.gate.acquire(bank)?;
        let (mapping, credential) = self.prerequisites(bank).await?;

        let driver = drivers.launch(bank).await?;
        let (mut session, control) = BankSession::new(bank, driver);
        hand_control(control);
        let export = session.run(&credential).await?;

        self.upsert_rows(&export, &mapping).await
    }

    /// Push an already-downloaded export to the ledger. Used for imports
    /// from a file on disk.
    pub async fn submit_export(&self, export: &RawExport) -> Result<SyncSummary, SyncError> {
        let _guard = self.gate.acquire(export.bank)?;
        let mapping = self.store.mapping(export.bank).await.ok_or_else(|| {
            SyncError::MissingPrerequisites(format!(
                "no ledger mapping stored for {}",
                export.bank,
            ))
        })?;
        self.upsert_rows(export, &mapping).await
    }

    /// Like [`Self::submit_export`], but with a mapping the caller just
    /// selected instead of a stored one. The mapping is persisted once
    /// the pass reaches a successful upsert, so a bank gets its stored
    /// mapping on the first sync that actually lands rows.
    pub async fn submit_export_with(
        &self,
        export: &RawExport,
        mapping: &LedgerMapping,
    ) -> Result<SyncSummary, SyncError> {
        let _guard = self.gate.acquire(export.bank)?;
        self.upsert_rows(export, mapping).await
    }

    async fn upsert_rows(
        &self,
        export: &RawExport,
        mapping: &LedgerMapping,
    ) -> Result<SyncSummary, SyncError> {
        log::info!("{}: syncing export to the ledger...", export.bank);
        let rows = normalize(export)?;

        let mut failed = Vec::new();
        let mut batch = Vec::new();
        for row in rows {
            match row {
                Ok(transaction) => batch.push(to_ledger_transaction(&transaction)),
                Err(err) => failed.push(RowFailure {
                    external_id: None,
                    reason: err.to_string(),
                }),
            }
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        if !batch.is_empty() {
            let file = FileId(mapping.ledger_file_id.clone());
            let account = AccountId(mapping.account_id.clone());
            let statuses = self
                .ledger
                .upsert_transactions(&file, &account, &batch)
                .await?;
            for (transaction, status) in batch.iter().zip(statuses) {
                match status {
                    UpsertStatus::Inserted => inserted += 1,
                    UpsertStatus::Duplicate => duplicates += 1,
                    UpsertStatus::Failed(reason) => failed.push(RowFailure {
                        external_id: Some(transaction.external_id.clone()),
                        reason,
                    }),
                }
            }
        }

        if inserted + duplicates > 0 {
            // The first pass that lands rows confirms the mapping; keep
            // it in the store so later passes and restarts find it.
            if let Err(err) = self
                .store
                .upsert_mapping(export.bank, mapping.clone())
                .await
            {
                log::warn!("{}: could not persist ledger mapping: {err:#}", export.bank);
            }
        }

        log::info!(
            "{}: syncing export to the ledger...done ({inserted} inserted, {duplicates} duplicates, {} failed)",
            export.bank,
            failed.len(),
        );
        Ok(SyncSummary {
            inserted,
            duplicates,
            failed,
        })
    }
}

fn to_ledger_transaction(transaction: &CanonicalTransaction) -> LedgerTransaction {
    LedgerTransaction {
        external_id: identity::external_id(transaction).0,
        date: transaction.value_date,
        payee: transaction.concept.chars().take(PAYEE_MAX_CHARS).collect(),
        notes: transaction.description.clone(),
        amount: transaction.amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::XChaCha20Poly1305Cipher;
    use crate::ledger::fake::FakeLedger;
    use crate::session::fake::FakeDriverFactory;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const IBERCAJA_EXPORT: &str = "\
Movimientos de la cuenta,,,,,,,
,,,,,,,
Nº Orden,Fecha Oper,Fecha Valor,Concepto,Descripción,Referencia,Importe,Saldo
1,02-01-2026,02-01-2026,Compra,PANADERIA SAN JUAN,REF001,\"-4,90\",\"1.200,10\"
2,03-01-2026,03-01-2026,Transferencia,ALQUILER ENERO,REF002,\"-650,00\",\"550,10\"
3,04-01-2026,04-01-2026,Nomina,EMPRESA SL,REF003,\"2.100,00\",\"2.650,10\"
";

    async fn orchestrator_with(ledger: Arc<FakeLedger>) -> (SyncOrchestrator, tempfile::TempDir) {
        let tempdir = tempfile::tempdir().unwrap();
        let store = StateStore::open(
            tempdir.path().join("state"),
            XChaCha20Poly1305Cipher::with_key([0u8; 32].into()),
        )
        .await
        .unwrap();
        let orchestrator = SyncOrchestrator::new(
            Arc::new(store),
            Arc::new(CredentialVault::new()),
            ledger,
        );
        (orchestrator, tempdir)
    }

    fn ibercaja_mapping() -> LedgerMapping {
        LedgerMapping {
            ledger_file_id: "file-1".to_string(),
            account_id: "account-1".to_string(),
            uses_encryption: false,
        }
    }

    fn ibercaja_export() -> RawExport {
        RawExport::from_csv(Bank::Ibercaja, IBERCAJA_EXPORT.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn export_rows_land_in_the_ledger() {
        let ledger = Arc::new(FakeLedger::new());
        let (orchestrator, _tempdir) = orchestrator_with(Arc::clone(&ledger)).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();

        let summary = orchestrator.submit_export(&ibercaja_export()).await.unwrap();
        assert_eq!(3, summary.inserted);
        assert_eq!(0, summary.duplicates);
        assert!(summary.is_clean());
        assert_eq!(3, ledger.stored_count());
    }

    #[tokio::test]
    async fn reimporting_the_same_export_is_idempotent() {
        let ledger = Arc::new(FakeLedger::new());
        let (orchestrator, _tempdir) = orchestrator_with(Arc::clone(&ledger)).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();

        orchestrator.submit_export(&ibercaja_export()).await.unwrap();
        let second = orchestrator.submit_export(&ibercaja_export()).await.unwrap();

        assert_eq!(0, second.inserted);
        assert_eq!(3, second.duplicates);
        assert_eq!(3, ledger.stored_count());
    }

    #[tokio::test]
    async fn missing_mapping_is_a_prerequisite_failure() {
        let (orchestrator, _tempdir) = orchestrator_with(Arc::new(FakeLedger::new())).await;
        let err = orchestrator
            .submit_export(&ibercaja_export())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingPrerequisites(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_rows_fail_alone() {
        let broken = IBERCAJA_EXPORT.replace("\"2.100,00\"", "N/A");
        let export = RawExport::from_csv(Bank::Ibercaja, broken.as_bytes()).unwrap();
        let ledger = Arc::new(FakeLedger::new());
        let (orchestrator, _tempdir) = orchestrator_with(Arc::clone(&ledger)).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();

        let summary = orchestrator.submit_export(&export).await.unwrap();
        assert_eq!(2, summary.inserted);
        assert_eq!(1, summary.failure_count());
        assert_eq!(None, summary.failed[0].external_id);
        assert!(summary.failed[0].reason.contains("N/A"));
    }

    #[tokio::test]
    async fn ledger_rejections_are_reported_per_row() {
        let export = ibercaja_export();
        let rows = normalize(&export).unwrap();
        let rejected = identity::external_id(rows[1].as_ref().unwrap()).0;
        let ledger = Arc::new(FakeLedger::new().failing_ids([rejected.clone()]));
        let (orchestrator, _tempdir) = orchestrator_with(Arc::clone(&ledger)).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();

        let summary = orchestrator.submit_export(&export).await.unwrap();
        assert_eq!(2, summary.inserted);
        assert_eq!(1, summary.failure_count());
        assert!(!ledger.contains(&rejected));
        assert_eq!(Some(rejected), summary.failed[0].external_id);
    }

    #[tokio::test]
    async fn first_successful_sync_persists_the_mapping() {
        let (orchestrator, _tempdir) = orchestrator_with(Arc::new(FakeLedger::new())).await;
        assert_eq!(None, orchestrator.store().mapping(Bank::Ibercaja).await);

        let summary = orchestrator
            .submit_export_with(&ibercaja_export(), &ibercaja_mapping())
            .await
            .unwrap();

        assert_eq!(3, summary.inserted);
        assert_eq!(
            Some(ibercaja_mapping()),
            orchestrator.store().mapping(Bank::Ibercaja).await,
        );
    }

    #[tokio::test]
    async fn sync_without_a_successful_upsert_does_not_persist_the_mapping() {
        let export = ibercaja_export();
        let all_ids: Vec<String> = normalize(&export)
            .unwrap()
            .iter()
            .map(|row| identity::external_id(row.as_ref().unwrap()).0)
            .collect();
        let ledger = Arc::new(FakeLedger::new().failing_ids(all_ids));
        let (orchestrator, _tempdir) = orchestrator_with(ledger).await;

        let summary = orchestrator
            .submit_export_with(&export, &ibercaja_mapping())
            .await
            .unwrap();

        assert_eq!(0, summary.inserted + summary.duplicates);
        assert_eq!(None, orchestrator.store().mapping(Bank::Ibercaja).await);
    }

    #[tokio::test]
    async fn busy_bank_rejects_a_second_pass_and_recovers() {
        let gate = BusyGate::new();
        let guard = gate.acquire(Bank::Ibercaja).unwrap();
        assert_eq!(
            SyncError::Busy,
            gate.acquire(Bank::Ibercaja).unwrap_err(),
        );
        // A different bank is unaffected.
        let _other = gate.acquire(Bank::IngNomina).unwrap();

        drop(guard);
        assert!(gate.acquire(Bank::Ibercaja).is_ok());
    }

    #[tokio::test]
    async fn full_pass_scrapes_and_syncs() {
        let ledger = Arc::new(FakeLedger::new());
        let (orchestrator, _tempdir) = orchestrator_with(Arc::clone(&ledger)).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();
        orchestrator
            .vault()
            .store(Scope::Bank(Bank::Ibercaja), Secret::new("user123\nkey456"));

        let drivers = FakeDriverFactory::new(IBERCAJA_EXPORT);
        let summary = orchestrator
            .run_pass(Bank::Ibercaja, &drivers, drop)
            .await
            .unwrap();

        assert_eq!(1, drivers.launch_count());
        assert_eq!(3, summary.inserted);
        assert_eq!(3, ledger.stored_count());
    }

    #[tokio::test]
    async fn missing_credential_blocks_the_pass_before_any_browser_work() {
        let (orchestrator, _tempdir) = orchestrator_with(Arc::new(FakeLedger::new())).await;
        orchestrator
            .store()
            .upsert_mapping(Bank::Ibercaja, ibercaja_mapping())
            .await
            .unwrap();

        let drivers = FakeDriverFactory::new(IBERCAJA_EXPORT);
        let err = orchestrator
            .run_pass(Bank::Ibercaja, &drivers, drop)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::MissingPrerequisites(_)), "got {err:?}");
        assert_eq!(0, drivers.launch_count());
    }

    #[test]
    fn payee_is_cut_to_the_ledger_limit() {
        let transaction = CanonicalTransaction {
            source_bank: Bank::Ibercaja,
            operation_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            value_date: NaiveDate::from_ymd_opt(2026, 1, 2).unwrap(),
            concept: "X".repeat(80),
            description: "desc".to_string(),
            reference: None,
            amount: Decimal::from_str("-1.00").unwrap(),
            running_balance: Decimal::from_str("10.00").unwrap(),
        };
        let ledger_transaction = to_ledger_transaction(&transaction);
        assert_eq!(PAYEE_MAX_CHARS, ledger_transaction.payee.chars().count());
    }
}
