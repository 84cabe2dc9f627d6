use anyhow::Result;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Read;

mod amount;
mod date;

use crate::banks::{Bank, CanonicalColumn, SchemaProfile};
use crate::error::{MalformedKind, MalformedRow, SyncError};

/// A bank export as delivered: an ordered grid of string cells with the
/// header row somewhere in the first few rows.
#[derive(Debug, Clone)]
pub struct RawExport {
    pub bank: Bank,
    pub rows: Vec<Vec<String>>,
}

impl RawExport {
    pub fn from_csv(bank: Bank, reader: impl Read) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut rows: Vec<Vec<String>> = Vec::new();
        for record in csv_reader.records() {
            let record = record?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        // Some portals prepend a byte order mark to the first cell.
        if let Some(cell) = rows.first_mut().and_then(|row| row.first_mut()) {
            if let Some(stripped) = cell.strip_prefix('\u{feff}') {
                *cell = stripped.to_string();
            }
        }
        Ok(Self { bank, rows })
    }
}

/// One financial movement in the bank-agnostic shape. Amount sign is
/// uniform after normalization: debits negative, credits positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalTransaction {
    pub source_bank: Bank,
    pub operation_date: NaiveDate,
    pub value_date: NaiveDate,
    pub concept: String,
    pub description: String,
    pub reference: Option<String>,
    pub amount: Decimal,
    pub running_balance: Decimal,
}

pub type RowResult = Result<CanonicalTransaction, MalformedRow>;

/// Map a raw export onto canonical transactions.
///
/// Fails as a whole only when no header row can be found; individual bad
/// rows come back as row-scoped errors so the rest of the batch proceeds.
pub fn normalize(export: &RawExport) -> Result<Vec<RowResult>, SyncError> {
    let schema = export.bank.schema();
    let (header_index, columns) =
        detect_header(&export.rows, schema).ok_or_else(|| SyncError::SchemaMismatch {
            bank: export.bank.to_string(),
        })?;
    log::debug!(
        "{}: header detected at row {header_index}, {} columns mapped",
        export.bank,
        columns.len()
    );

    let mut results = Vec::new();
    for (offset, row) in export.rows[header_index + 1..].iter().enumerate() {
        if row.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        // Row indices are relative to the header so they match what the
        // operator sees in the exported sheet.
        let row_index = offset + 1;
        results.push(parse_row(export.bank, schema, &columns, row, row_index));
    }
    Ok(results)
}

/// Scan the first rows for the one matching enough column aliases.
/// Returns the header row index and the canonical column → cell index map.
fn detect_header(
    rows: &[Vec<String>],
    schema: &SchemaProfile,
) -> Option<(usize, HashMap<CanonicalColumn, usize>)> {
    for (row_index, row) in rows.iter().take(schema.header_scan_rows).enumerate() {
        let mut columns = HashMap::new();
        for (cell_index, cell) in row.iter().enumerate() {
            let folded = fold(cell);
            for spec in schema.columns {
                if spec.aliases.iter().any(|alias| fold(alias) == folded) {
                    columns.entry(spec.column).or_insert(cell_index);
                }
            }
        }
        let all_required_present = schema
            .columns
            .iter()
            .filter(|spec| spec.required)
            .all(|spec| columns.contains_key(&spec.column));
        if columns.len() >= schema.min_alias_matches && all_required_present {
            return Some((row_index, columns));
        }
    }
    None
}

fn parse_row(
    bank: Bank,
    schema: &SchemaProfile,
    columns: &HashMap<CanonicalColumn, usize>,
    row: &[String],
    row_index: usize,
) -> RowResult {
    let cell = |column: CanonicalColumn| -> Option<&str> {
        columns
            .get(&column)
            .and_then(|&index| row.get(index))
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
    };
    let malformed = |kind: MalformedKind| MalformedRow { row_index, kind };

    let parse_date_cell = |column: CanonicalColumn| -> Result<NaiveDate, MalformedRow> {
        let raw = cell(column).ok_or_else(|| malformed(MalformedKind::MissingCell(column.name())))?;
        date::parse_date(raw, schema.date_formats)
            .ok_or_else(|| malformed(MalformedKind::Date(raw.to_string())))
    };
    let parse_amount_cell = |column: CanonicalColumn| -> Result<Decimal, MalformedRow> {
        let raw = cell(column).ok_or_else(|| malformed(MalformedKind::MissingCell(column.name())))?;
        amount::parse_amount(raw, schema.numeric_locale)
            .ok_or_else(|| malformed(MalformedKind::Amount(raw.to_string())))
    };

    let value_date = parse_date_cell(CanonicalColumn::ValueDate)?;
    let operation_date = parse_date_cell(CanonicalColumn::OperationDate)?;
    let concept = cell(CanonicalColumn::Concept)
        .ok_or_else(|| malformed(MalformedKind::MissingCell(CanonicalColumn::Concept.name())))?
        .to_string();
    let description = cell(CanonicalColumn::Description)
        .map(str::to_string)
        .unwrap_or_default();
    let reference = cell(CanonicalColumn::Reference).map(str::to_string);
    let amount = parse_amount_cell(CanonicalColumn::Amount)?;
    let running_balance = parse_amount_cell(CanonicalColumn::Balance)?;

    Ok(CanonicalTransaction {
        source_bank: bank,
        operation_date,
        value_date,
        concept,
        description,
        reference,
        amount,
        running_balance,
    })
}

fn fold(cell: &str) -> String {
    cell.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(bank: Bank, csv: &str) -> RawExport {
        RawExport::from_csv(bank, csv.as_bytes()).unwrap()
    }

    const IBERCAJA_CSV: &str = "\
Nº Orden,Fecha Oper,Fecha Valor,Concepto,Descripción,Referencia,Importe,Saldo
1,15-01-2026,15-01-2026,TARJETA VISA,LM GETAFE MADRID,REF001,\"-4,90\",\"120,00\"
2,16-01-2026,16-01-2026,TRANSFERENCIA,Nómina enero,,\"1.850,00\",\"1.970,00\"
";

    #[test]
    fn normalizes_ibercaja_movements() {
        let rows = normalize(&export(Bank::Ibercaja, IBERCAJA_CSV)).unwrap();
        assert_eq!(2, rows.len());

        let first = rows[0].as_ref().unwrap();
        assert_eq!("TARJETA VISA", first.concept);
        assert_eq!("LM GETAFE MADRID", first.description);
        assert_eq!(Some("REF001".to_string()), first.reference);
        assert_eq!(Decimal::new(-490, 2), first.amount);
        assert_eq!(Decimal::new(12000, 2), first.running_balance);
        assert_eq!(NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(), first.value_date);

        let second = rows[1].as_ref().unwrap();
        assert_eq!(None, second.reference);
        assert_eq!(Decimal::new(185000, 2), second.amount);
    }

    #[test]
    fn header_at_row_four_is_still_found() {
        let csv = format!(
            "Movimientos de la cuenta\nTitular,Alguien\n\"Periodo\",\"01-01-2026 a 31-01-2026\"\n{IBERCAJA_CSV}"
        );
        let rows = normalize(&export(Bank::Ibercaja, &csv)).unwrap();
        assert_eq!(2, rows.len());
        assert!(rows.iter().all(|row| row.is_ok()));
    }

    #[test]
    fn missing_header_is_a_schema_mismatch() {
        let csv = "a,b,c\n1,2,3\n";
        let err = normalize(&export(Bank::Ibercaja, csv)).unwrap_err();
        assert_eq!(
            SyncError::SchemaMismatch {
                bank: "ibercaja".to_string()
            },
            err
        );
    }

    #[test]
    fn one_bad_amount_fails_only_that_row() {
        let mut csv = String::from(
            "Nº Orden,Fecha Oper,Fecha Valor,Concepto,Descripción,Referencia,Importe,Saldo\n",
        );
        for i in 1..=10 {
            let amount = if i == 7 { "N/A".to_string() } else { format!("\"-{i},00\"") };
            csv.push_str(&format!(
                "{i},{i:02}-01-2026,{i:02}-01-2026,CONCEPTO,desc,,{amount},\"100,00\"\n"
            ));
        }
        let rows = normalize(&export(Bank::Ibercaja, &csv)).unwrap();
        assert_eq!(10, rows.len());
        assert_eq!(9, rows.iter().filter(|row| row.is_ok()).count());

        let failure = rows[6].as_ref().unwrap_err();
        assert_eq!(7, failure.row_index);
        assert_eq!(MalformedKind::Amount("N/A".to_string()), failure.kind);
    }

    #[test]
    fn ing_schema_maps_category_to_concept() {
        let csv = "\
algo,raro,arriba,de,la,tabla
F. VALOR,CATEGORÍA,DESCRIPCIÓN,COMENTARIO,IMPORTE (€),SALDO (€)
15/01/2026,Compras,AMAZON ES,pedido 123,\"-25,99\",\"640,10\"
";
        let rows = normalize(&export(Bank::IngNaranja, csv)).unwrap();
        let tx = rows[0].as_ref().unwrap();
        assert_eq!("Compras", tx.concept);
        assert_eq!("AMAZON ES", tx.description);
        assert_eq!(Some("pedido 123".to_string()), tx.reference);
        assert_eq!(tx.operation_date, tx.value_date);
    }

    #[test]
    fn unrecognized_date_fails_the_row() {
        let csv = "\
Nº Orden,Fecha Oper,Fecha Valor,Concepto,Descripción,Referencia,Importe,Saldo
1,2026/01/15,2026/01/15,X,desc,,\"-1,00\",\"5,00\"
";
        let rows = normalize(&export(Bank::Ibercaja, csv)).unwrap();
        let failure = rows[0].as_ref().unwrap_err();
        assert_eq!(MalformedKind::Date("2026/01/15".to_string()), failure.kind);
    }
}
