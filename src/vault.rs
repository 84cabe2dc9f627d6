use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use crate::banks::Bank;

/// What a stored secret unlocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Bank(Bank),
    Ledger,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Bank(bank) => f.write_str(bank.credential_id()),
            Scope::Ledger => f.write_str("ledger"),
        }
    }
}

/// Opaque secret blob. Deliberately has no serde impls and redacts itself
/// when formatted, so it cannot end up in the persisted state or a log
/// line by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn reveal(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

struct StoredSecret {
    secret: Secret,
    created_at: DateTime<Utc>,
}

/// Process-scoped credential store. Starts empty on every process start
/// and is never written to disk; a restart or `clear_all` leaves it
/// indistinguishable from a fresh one.
///
/// Keyed by the scope's credential id rather than the `Scope` value, so
/// the two ING flavors resolve to the one stored ING login.
pub struct CredentialVault {
    secrets: Mutex<HashMap<String, StoredSecret>>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self {
            secrets: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, scope: Scope, secret: Secret) {
        log::info!("Storing credential for scope {scope}");
        self.secrets.lock().unwrap().insert(
            scope.to_string(),
            StoredSecret {
                secret,
                created_at: Utc::now(),
            },
        );
    }

    pub fn retrieve(&self, scope: Scope) -> Option<Secret> {
        self.secrets
            .lock()
            .unwrap()
            .get(&scope.to_string())
            .map(|stored| stored.secret.clone())
    }

    pub fn contains(&self, scope: Scope) -> bool {
        self.secrets.lock().unwrap().contains_key(&scope.to_string())
    }

    pub fn created_at(&self, scope: Scope) -> Option<DateTime<Utc>> {
        self.secrets
            .lock()
            .unwrap()
            .get(&scope.to_string())
            .map(|stored| stored.created_at)
    }

    pub fn clear(&self, scope: Scope) {
        log::info!("Clearing credential for scope {scope}");
        self.secrets.lock().unwrap().remove(&scope.to_string());
    }

    pub fn clear_all(&self) {
        log::info!("Clearing all credentials");
        self.secrets.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.lock().unwrap().is_empty()
    }
}

impl Default for CredentialVault {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_like_a_fresh_process() {
        let vault = CredentialVault::new();
        assert!(vault.is_empty());
        for scope in [Scope::Bank(Bank::Ibercaja), Scope::Ledger] {
            assert_eq!(None, vault.retrieve(scope));
        }
    }

    #[test]
    fn store_retrieve_clear() {
        let vault = CredentialVault::new();
        vault.store(Scope::Bank(Bank::Ibercaja), Secret::new("hunter2"));
        assert_eq!(
            "hunter2",
            vault.retrieve(Scope::Bank(Bank::Ibercaja)).unwrap().reveal()
        );
        assert!(vault.created_at(Scope::Bank(Bank::Ibercaja)).is_some());

        vault.clear(Scope::Bank(Bank::Ibercaja));
        assert_eq!(None, vault.retrieve(Scope::Bank(Bank::Ibercaja)));
    }

    #[test]
    fn ing_flavors_share_one_stored_login() {
        let vault = CredentialVault::new();
        vault.store(Scope::Bank(Bank::IngNomina), Secret::new("dni+pin"));
        assert_eq!(
            "dni+pin",
            vault
                .retrieve(Scope::Bank(Bank::IngNaranja))
                .unwrap()
                .reveal()
        );
    }

    #[test]
    fn clear_all_empties_every_scope() {
        let vault = CredentialVault::new();
        vault.store(Scope::Bank(Bank::Ibercaja), Secret::new("a"));
        vault.store(Scope::Bank(Bank::IngNomina), Secret::new("b"));
        vault.store(Scope::Ledger, Secret::new("c"));

        vault.clear_all();
        assert!(vault.is_empty());
        for scope in [
            Scope::Bank(Bank::Ibercaja),
            Scope::Bank(Bank::IngNomina),
            Scope::Ledger,
        ] {
            assert_eq!(None, vault.retrieve(scope));
        }
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let secret = Secret::new("super-secret-pin");
        assert_eq!("Secret(<redacted>)", format!("{secret:?}"));
    }
}
