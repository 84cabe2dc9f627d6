use sha2::{Digest, Sha256};

use crate::normalize::CanonicalTransaction;

/// External id handed to the ledger for idempotent upsert. 32 hex chars,
/// the truncated SHA-256 of the transaction's identifying fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(pub String);

const ID_HEX_LEN: usize = 32;

/// Derive the stable identity of a transaction.
///
/// Hashed fields: source bank, value date, case/whitespace-normalized
/// concept, amount and running balance as integer minor units. Amounts go
/// in as rescaled mantissas rather than display strings so "4.9" and
/// "4.90" hash identically. The running balance is included deliberately:
/// two equal purchases at the same merchant on the same day are otherwise
/// identical, but the balance after each almost always differs.
pub fn external_id(tx: &CanonicalTransaction) -> TransactionId {
    let mut hasher = Sha256::new();
    hasher.update(tx.source_bank.id());
    hasher.update(b"|");
    hasher.update(tx.value_date.format("%Y-%m-%d").to_string());
    hasher.update(b"|");
    hasher.update(normalize_concept(&tx.concept));
    hasher.update(b"|");
    hasher.update(minor_units(tx.amount).to_le_bytes());
    hasher.update(b"|");
    hasher.update(minor_units(tx.running_balance).to_le_bytes());

    let digest = hasher.finalize();
    let mut id = String::with_capacity(ID_HEX_LEN);
    for byte in digest.iter().take(ID_HEX_LEN / 2) {
        id.push_str(&format!("{byte:02x}"));
    }
    TransactionId(id)
}

fn normalize_concept(concept: &str) -> String {
    concept
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn minor_units(amount: rust_decimal::Decimal) -> i64 {
    let mut amount = amount;
    amount.rescale(2);
    amount.mantissa() as i64
}
