use httpclient::{Client, InMemoryResponseExt};
use serde::{Deserialize, Serialize};

use super::{
    AccountId, CertTrust, FileId, LedgerAccount, LedgerClient, LedgerFile, LedgerTransaction,
    UpsertStatus,
};
use crate::error::SyncError;
use crate::vault::Secret;
use async_trait::async_trait;

/// Client for the ledger bridge, the small REST facade that fronts the
/// budgeting server. The bridge holds the actual ledger session; we send
/// it the server password and the cert-trust decision per request and it
/// performs the TLS connection itself.
pub struct RestLedgerClient {
    http: Client,
    server_password: Secret,
    encryption_password: Option<Secret>,
    cert_trust: CertTrust,
}

impl RestLedgerClient {
    pub fn new(
        base_url: &str,
        cert_trust: CertTrust,
        server_password: Secret,
        encryption_password: Option<Secret>,
    ) -> Self {
        Self {
            http: Client::new().base_url(base_url),
            server_password,
            encryption_password,
            cert_trust,
        }
    }

    fn auth(&self, file: Option<&FileId>) -> Auth {
        Auth {
            server_password: self.server_password.reveal().to_string(),
            encryption_password: self
                .encryption_password
                .as_ref()
                .map(|secret| secret.reveal().to_string()),
            verify_certificates: self.cert_trust == CertTrust::SystemRoots,
            file_id: file.map(|file| file.0.clone()),
        }
    }

    async fn post<Request: Serialize, Response: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Request,
    ) -> Result<Response, SyncError> {
        let body = serde_json::to_value(request)
            .map_err(|err| SyncError::Ledger(format!("request encoding failed: {err}")))?;
        let response = self
            .http
            .post(path)
            .json(body)
            .await
            .map_err(|err| SyncError::Ledger(err.to_string()))?;
        response
            .json()
            .map_err(|err| SyncError::Ledger(format!("response decoding failed: {err}")))
    }
}

// Request/response shapes of the bridge API. Field names are the wire
// contract; renaming one here is a breaking change for deployments.

#[derive(Serialize)]
struct Auth {
    server_password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    encryption_password: Option<String>,
    verify_certificates: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_id: Option<String>,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    #[serde(flatten)]
    auth: Auth,
    account_id: &'a str,
    transactions: &'a [LedgerTransaction],
}

#[derive(Deserialize)]
struct FilesResponse {
    files: Vec<LedgerFile>,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<LedgerAccount>,
}

#[derive(Deserialize)]
struct UpsertResponse {
    results: Vec<UpsertResult>,
}

#[derive(Deserialize)]
struct UpsertResult {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

impl UpsertResult {
    fn into_status(self) -> UpsertStatus {
        match self.status.as_str() {
            "inserted" => UpsertStatus::Inserted,
            "duplicate" => UpsertStatus::Duplicate,
            _ => UpsertStatus::Failed(
                self.reason
                    .unwrap_or_else(|| format!("bridge reported status {:?}", self.status)),
            ),
        }
    }
}

#[async_trait]
impl LedgerClient for RestLedgerClient {
    async fn list_files(&self) -> Result<Vec<LedgerFile>, SyncError> {
        log::info!("Listing ledger files...");
        let response: FilesResponse = self.post("/api/files", &self.auth(None)).await?;
        log::info!("Listing ledger files...done ({} files)", response.files.len());
        Ok(response.files)
    }

    async fn list_accounts(&self, file: &FileId) -> Result<Vec<LedgerAccount>, SyncError> {
        log::info!("Listing ledger accounts...");
        let response: AccountsResponse = self.post("/api/accounts", &self.auth(Some(file))).await?;
        log::info!(
            "Listing ledger accounts...done ({} accounts)",
            response.accounts.len()
        );
        Ok(response.accounts)
    }

    async fn upsert_transactions(
        &self,
        file: &FileId,
        account: &AccountId,
        batch: &[LedgerTransaction],
    ) -> Result<Vec<UpsertStatus>, SyncError> {
        log::info!("Upserting {} transactions...", batch.len());
        let request = UpsertRequest {
            auth: self.auth(Some(file)),
            account_id: &account.0,
            transactions: batch,
        };
        let response: UpsertResponse = self.post("/api/transactions/upsert", &request).await?;
        if response.results.len() != batch.len() {
            return Err(SyncError::Ledger(format!(
                "bridge returned {} results for {} transactions",
                response.results.len(),
                batch.len()
            )));
        }
        log::info!("Upserting {} transactions...done", batch.len());
        Ok(response
            .results
            .into_iter()
            .map(UpsertResult::into_status)
            .collect())
    }
}
