use anyhow::{anyhow, bail, Context as _, Result};
use chrono::Utc;
use console::{style, StyledObject};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::sync::Arc;

use crate::args::{Args, Command};
use crate::banks::Bank;
use crate::db::{
    LedgerMapping, RunResult, ScheduleConfig, Settings, StateStore, SyncInterval,
    XChaCha20Poly1305Cipher,
};
use crate::error::SyncError;
use crate::ledger::{CertTrust, FileId, LedgerClient, RestLedgerClient};
use crate::normalize::RawExport;
use crate::scheduler::Scheduler;
use crate::session::{RemoteDriverFactory, SessionControl};
use crate::sync::{SyncOrchestrator, SyncSummary};
use crate::terminal::{self, BulletPointPrinter};
use crate::vault::{CredentialVault, Scope, Secret};

// TODO Configurable state file location
const DB_PATH: &str = "actual_bank_sync.db";

// TODO Configurable encryption key
fn db_key() -> chacha20poly1305::Key {
    let mut rng = StdRng::seed_from_u64(1);
    let mut key_bytes = [0; 32];
    rng.fill_bytes(&mut key_bytes);
    key_bytes.into()
}

pub async fn main(args: Args) -> Result<()> {
    let cli = match args.command {
        Command::Init => Cli::new_init_db().await?,
        _ => Cli::new_load_db().await?,
    };
    match args.command {
        Command::Init => cli.main_init().await?,
        Command::SetMapping { bank } => cli.main_set_mapping(bank).await?,
        Command::ListMappings => cli.main_list_mappings().await?,
        Command::ClearMapping { bank, all } => cli.main_clear_mapping(bank, all).await?,
        Command::Import { bank, file } => cli.main_import(bank, &file).await?,
        Command::RunNow { bank } => cli.main_run_now(bank).await?,
        Command::Schedule {
            bank,
            interval,
            disable,
        } => cli.main_schedule(bank, interval, disable).await?,
        Command::Status => cli.main_status().await?,
        Command::Watch => cli.main_watch().await?,
    }
    Ok(())
}

pub struct Cli {
    store: Arc<StateStore>,
    vault: Arc<CredentialVault>,
}

impl Cli {
    pub async fn new_init_db() -> Result<Self> {
        if tokio::fs::try_exists(DB_PATH).await? {
            bail!("State file already exists");
        }
        Ok(Self::_new(
            StateStore::open(DB_PATH, XChaCha20Poly1305Cipher::with_key(db_key())).await?,
        ))
    }

    pub async fn new_load_db() -> Result<Self> {
        if !tokio::fs::try_exists(DB_PATH).await? {
            bail!("State file not found, run init first");
        }
        let store = StateStore::open(DB_PATH, XChaCha20Poly1305Cipher::with_key(db_key()))
            .await
            .context("Failed to load the state file")?;
        Ok(Self::_new(store))
    }

    fn _new(store: StateStore) -> Self {
        Self {
            store: Arc::new(store),
            vault: Arc::new(CredentialVault::new()),
        }
    }

    pub async fn main_init(&self) -> Result<()> {
        let ledger_url = terminal::prompt("Ledger bridge URL")?;
        let automation_url = terminal::prompt("Browser automation sidecar URL")?;
        let verify = terminal::confirm(
            "Verify the ledger server's TLS certificate against system roots?",
            true,
        )?;
        self.store
            .update_settings(Settings {
                ledger_url: Some(ledger_url),
                automation_url: Some(automation_url),
                cert_trust: if verify {
                    CertTrust::SystemRoots
                } else {
                    CertTrust::TrustAny
                },
            })
            .await?;

        // Test the bridge connection right away so a typo in the URL
        // doesn't surface days later in a scheduled run.
        let ledger = self.ledger_client(false).await?;
        let files = ledger
            .list_files()
            .await
            .context("Ledger bridge connection failed")?;
        println!(
            "Connected, the ledger has {} budget file(s)",
            style(files.len()).bold(),
        );
        Ok(())
    }

    pub async fn main_set_mapping(&self, bank: Bank) -> Result<()> {
        let ledger = self.ledger_client(false).await?;
        let mapping = self.prompt_mapping(ledger.as_ref()).await?;
        self.store.upsert_mapping(bank, mapping).await?;
        println!("Mapping for {} stored", style_bank(bank));
        Ok(())
    }

    async fn prompt_mapping(&self, ledger: &dyn LedgerClient) -> Result<LedgerMapping> {
        println!("{}", style_header("Budget files:"));
        let files = ledger.list_files().await?;
        let printer = BulletPointPrinter::new();
        for file in &files {
            printer.print_item(format!("{} {}", style(&file.id.0).cyan(), file.name));
        }
        let file_id = terminal::prompt("Budget file id")?;
        if !files.iter().any(|file| file.id.0 == file_id) {
            bail!("Unknown budget file {file_id:?}");
        }
        let uses_encryption =
            terminal::confirm("Does this budget file use end-to-end encryption?", false)?;

        println!("{}", style_header("Accounts:"));
        let accounts = ledger.list_accounts(&FileId(file_id.clone())).await?;
        for account in accounts.iter().filter(|account| !account.closed) {
            printer.print_item(format!("{} {}", style(&account.id.0).cyan(), account.name));
        }
        let account_id = terminal::prompt("Account id")?;
        if !accounts.iter().any(|account| account.id.0 == account_id) {
            bail!("Unknown account {account_id:?}");
        }

        Ok(LedgerMapping {
            ledger_file_id: file_id,
            account_id,
            uses_encryption,
        })
    }

    pub async fn main_list_mappings(&self) -> Result<()> {
        println!("{}", style_header("Mappings:"));
        let mappings = self.store.list_mappings().await;
        if mappings.is_empty() {
            println!("(none)");
        } else {
            let printer = BulletPointPrinter::new();
            for (bank, mapping) in mappings {
                print_mapping(&printer, bank, &mapping);
            }
        }
        Ok(())
    }

    pub async fn main_clear_mapping(&self, bank: Option<Bank>, all: bool) -> Result<()> {
        match (bank, all) {
            (Some(bank), false) => {
                self.store.clear_mapping(bank).await?;
                println!("Mapping for {} cleared", style_bank(bank));
            }
            (None, true) => {
                self.store.clear_all_mappings().await?;
                println!("All mappings cleared");
            }
            _ => bail!("Pass either a bank or --all"),
        }
        Ok(())
    }

    pub async fn main_import(&self, bank: Bank, file: &std::path::Path) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let export = RawExport::from_csv(bank, bytes.as_slice())
            .with_context(|| format!("Failed to parse {}", file.display()))?;

        let summary = match self.store.mapping(bank).await {
            Some(_) => {
                let orchestrator = self.orchestrator_for(bank).await?;
                orchestrator.submit_export(&export).await
            }
            None => {
                // First sync for this bank: pick the mapping now; it is
                // stored once the import lands at least one row.
                println!("No mapping stored for {} yet", style_bank(bank));
                let listing = self.ledger_client(false).await?;
                let mapping = self.prompt_mapping(listing.as_ref()).await?;
                let ledger = self.ledger_client(mapping.uses_encryption).await?;
                let orchestrator = SyncOrchestrator::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.vault),
                    ledger,
                );
                orchestrator.submit_export_with(&export, &mapping).await
            }
        }
        .map_err(|err| anyhow!(err))?;
        print_summary(&summary);
        Ok(())
    }

    pub async fn main_run_now(&self, bank: Bank) -> Result<()> {
        self.ensure_bank_credential(bank)?;
        let orchestrator = self.orchestrator_for(bank).await?;
        let drivers = self.driver_factory().await?;

        println!("Running a pass for {}...", style_bank(bank));
        let result = orchestrator
            .run_pass(bank, &drivers, |control| {
                tokio::spawn(relay_prompts(control));
            })
            .await;
        let run_result = match &result {
            Ok(summary) if summary.is_clean() => RunResult::Success,
            Ok(summary) => RunResult::PartialFailure(summary.failure_count()),
            Err(SyncError::Busy) => RunResult::Busy,
            Err(SyncError::MissingPrerequisites(_)) => RunResult::MissingPrerequisites,
            Err(err) => RunResult::Error(err.to_string()),
        };
        self.store.record_run(bank, run_result, Utc::now()).await?;

        match result {
            Ok(summary) => {
                print_summary(&summary);
                Ok(())
            }
            Err(err) => Err(anyhow!(err)),
        }
    }

    pub async fn main_schedule(
        &self,
        bank: Bank,
        interval: SyncInterval,
        disable: bool,
    ) -> Result<()> {
        let schedule = self
            .store
            .set_schedule(bank, interval, !disable, Utc::now())
            .await?;
        if schedule.enabled {
            println!(
                "{} will sync every {}, next run at {}",
                style_bank(bank),
                style(interval).bold(),
                schedule
                    .next_run_at
                    .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            );
        } else {
            println!("Schedule for {} disabled", style_bank(bank));
        }
        Ok(())
    }

    pub async fn main_status(&self) -> Result<()> {
        println!("{}", style_header("Status:"));
        let printer = BulletPointPrinter::new();
        for bank in Bank::ALL {
            printer.print_item(style_bank(bank));
            let printer = printer.indent();
            match self.store.mapping(bank).await {
                Some(mapping) => print_mapping(&printer, bank, &mapping),
                None => printer.print_item(style("no mapping").italic()),
            }
            match self.store.schedule(bank).await {
                Some(schedule) => print_schedule(&printer, &schedule),
                None => printer.print_item(style("no schedule").italic()),
            }
        }
        Ok(())
    }

    pub async fn main_watch(&self) -> Result<()> {
        // Collect everything interactive up front; after this the loop
        // must be able to run unattended (second-factor prompts aside).
        let schedules = self.store.schedules().await;
        let banks: Vec<Bank> = schedules
            .iter()
            .filter(|(_, schedule)| schedule.enabled)
            .map(|(bank, _)| *bank)
            .collect();
        if banks.is_empty() {
            bail!("No enabled schedules, nothing to watch");
        }
        for bank in &banks {
            self.ensure_bank_credential(*bank)?;
        }
        let needs_encryption = self.any_mapping_encrypted(&banks).await;
        let ledger = self.ledger_client(needs_encryption).await?;
        let drivers = self.driver_factory().await?;

        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.vault),
            ledger,
        ));
        let scheduler = Scheduler::new(orchestrator, Arc::new(drivers)).with_control_handler(
            |control| {
                tokio::spawn(relay_prompts(control));
            },
        );
        println!(
            "Watching schedules for {}; press Ctrl-C to stop",
            banks
                .iter()
                .map(|bank| bank.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        );
        scheduler.watch().await;
        Ok(())
    }

    async fn orchestrator_for(&self, bank: Bank) -> Result<SyncOrchestrator> {
        let needs_encryption = self
            .store
            .mapping(bank)
            .await
            .map(|mapping| mapping.uses_encryption)
            .unwrap_or(false);
        let ledger = self.ledger_client(needs_encryption).await?;
        Ok(SyncOrchestrator::new(
            Arc::clone(&self.store),
            Arc::clone(&self.vault),
            ledger,
        ))
    }

    async fn ledger_client(&self, needs_encryption: bool) -> Result<Arc<dyn LedgerClient>> {
        let settings = self.store.settings().await;
        let url = settings
            .ledger_url
            .ok_or_else(|| anyhow!("No ledger URL configured, run init first"))?;
        let (server_password, encryption_password) = self.ledger_secrets(needs_encryption)?;
        Ok(Arc::new(RestLedgerClient::new(
            &url,
            settings.cert_trust,
            server_password,
            encryption_password,
        )))
    }

    async fn driver_factory(&self) -> Result<RemoteDriverFactory> {
        let settings = self.store.settings().await;
        let url = settings
            .automation_url
            .ok_or_else(|| anyhow!("No automation sidecar URL configured, run init first"))?;
        Ok(RemoteDriverFactory::new(&url))
    }

    /// Ledger secrets live in the vault as newline-separated lines:
    /// server password, then optionally the file encryption password.
    fn ledger_secrets(&self, needs_encryption: bool) -> Result<(Secret, Option<Secret>)> {
        let stored = self.vault.retrieve(Scope::Ledger);
        let (server, mut encryption) = match stored {
            Some(secret) => {
                let mut lines = secret.reveal().lines();
                let server = lines.next().unwrap_or("").to_string();
                (server, lines.next().map(str::to_string))
            }
            None => (terminal::prompt_password("Ledger server password")?, None),
        };
        if needs_encryption && encryption.is_none() {
            encryption = Some(terminal::prompt_password(
                "Ledger file encryption password",
            )?);
        }
        let blob = match &encryption {
            Some(encryption) => format!("{server}\n{encryption}"),
            None => server.clone(),
        };
        self.vault.store(Scope::Ledger, Secret::new(blob));
        Ok((Secret::new(server), encryption.map(Secret::new)))
    }

    /// Bank credentials live in the vault as newline-separated fields in
    /// the order the portal flow expects them.
    fn ensure_bank_credential(&self, bank: Bank) -> Result<()> {
        if self.vault.contains(Scope::Bank(bank)) {
            return Ok(());
        }
        let blob = match bank {
            Bank::Ibercaja => {
                let code = terminal::prompt("Ibercaja identification code")?;
                let key = terminal::prompt_password("Ibercaja access key")?;
                format!("{code}\n{key}")
            }
            Bank::IngNomina | Bank::IngNaranja => {
                let document = terminal::prompt("ING document number (NIF/NIE)")?;
                let day = terminal::prompt("Birth day (DD)")?;
                let month = terminal::prompt("Birth month (MM)")?;
                let year = terminal::prompt("Birth year (AAAA)")?;
                format!("{document}\n{day}\n{month}\n{year}")
            }
        };
        self.vault.store(Scope::Bank(bank), Secret::new(blob));
        Ok(())
    }

    async fn any_mapping_encrypted(&self, banks: &[Bank]) -> bool {
        for bank in banks {
            if let Some(mapping) = self.store.mapping(*bank).await {
                if mapping.uses_encryption {
                    return true;
                }
            }
        }
        false
    }
}

/// Forward session prompts (pinpad positions, app confirmations) to the
/// operator and send their answers back.
async fn relay_prompts(mut control: SessionControl) {
    while let Some(prompt) = control.next_prompt().await {
        let answer = tokio::task::spawn_blocking(move || terminal::prompt(&prompt)).await;
        match answer {
            Ok(Ok(code)) => {
                if !control.provide_second_factor(code).await {
                    break;
                }
            }
            _ => break,
        }
    }
}

fn print_mapping(printer: &BulletPointPrinter, bank: Bank, mapping: &LedgerMapping) {
    printer.print_item(format!(
        "{} -> file {} account {}{}",
        style_bank(bank),
        style(&mapping.ledger_file_id).cyan(),
        style(&mapping.account_id).cyan(),
        if mapping.uses_encryption {
            " (encrypted)"
        } else {
            ""
        },
    ));
}

fn print_schedule(printer: &BulletPointPrinter, schedule: &ScheduleConfig) {
    let state = if schedule.enabled {
        style(format!("every {}", schedule.interval)).green()
    } else {
        style("disabled".to_string()).dim()
    };
    printer.print_item(format!(
        "schedule: {state}, next {}",
        schedule
            .next_run_at
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "-".to_string()),
    ));
    if let (Some(at), Some(result)) = (&schedule.last_run_at, &schedule.last_result) {
        printer.print_item(format!(
            "last run {}: {}",
            at.format("%Y-%m-%d %H:%M UTC"),
            style_run_result(result),
        ));
    }
}

fn print_summary(summary: &SyncSummary) {
    println!(
        "{} inserted, {} duplicates, {} failed",
        style(summary.inserted).green().bold(),
        style(summary.duplicates).yellow(),
        style(summary.failure_count()).red(),
    );
    if !summary.failed.is_empty() {
        let printer = BulletPointPrinter::new();
        for failure in &summary.failed {
            printer.print_item(style(format!(
                "{}: {}",
                failure.external_id.as_deref().unwrap_or("(no id)"),
                failure.reason,
            ))
            .red());
        }
    }
}

fn style_header(header: &str) -> StyledObject<&str> {
    style(header).bold().underlined()
}

fn style_bank(bank: Bank) -> StyledObject<String> {
    style(bank.to_string()).cyan().bold()
}

fn style_run_result(result: &RunResult) -> StyledObject<String> {
    let styled = style(result.to_string());
    match result {
        RunResult::Success => styled.green(),
        RunResult::PartialFailure(_) => styled.yellow(),
        RunResult::MissingPrerequisites | RunResult::Busy => styled.dim(),
        RunResult::Error(_) => styled.red(),
    }
}
