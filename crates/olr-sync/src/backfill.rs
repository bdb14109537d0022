//! Review-label backfill across a year of order ledgers.

use olr_core::{cell, LedgerMode, MonthKey, Table, TableNaming};
use olr_storage::TableStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::keys::key_for_row;
use crate::lookups::ReviewLabels;
use crate::schema::{LedgerField, LedgerSchema};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillOutcome {
    pub table: String,
    pub header_extended: bool,
    pub updated_cells: usize,
    pub written: bool,
}

/// Extend a header written before the review column existed. Returns
/// whether the header changed.
pub fn ensure_review_header(table: &mut Table, schema: &LedgerSchema) -> bool {
    let Some(column) = schema.position(LedgerField::ReviewLabel) else {
        return false;
    };
    if table.header.len() > column {
        return false;
    }
    let declared = schema.header();
    table.header.resize(column + 1, String::new());
    table.header[column] = declared[column].clone();
    true
}

/// Set each keyed row's review cell to its current label. Returns the
/// number of cells that changed; blank labels never pad short rows.
pub fn apply_review_labels(table: &mut Table, schema: &LedgerSchema, reviews: &ReviewLabels) -> usize {
    let Some(column) = schema.position(LedgerField::ReviewLabel) else {
        return 0;
    };

    let mut updated = 0;
    for row in &mut table.rows {
        let Some(key) = key_for_row(schema, row) else {
            continue;
        };
        let label = reviews.label_for(key.as_str());
        if cell(row, column) == label {
            continue;
        }
        if row.len() <= column {
            row.resize(column + 1, String::new());
        }
        row[column] = label;
        updated += 1;
    }
    updated
}

/// Walk the twelve order ledgers of `year`, rewriting only tables whose
/// review cells changed. Unreadable tables are logged and skipped.
pub async fn backfill_review_labels(
    store: &dyn TableStore,
    naming: &TableNaming,
    schema: &LedgerSchema,
    reviews: &ReviewLabels,
    year: i32,
) -> anyhow::Result<Vec<BackfillOutcome>> {
    anyhow::ensure!(
        schema.mode() == LedgerMode::Orders,
        "review labels live in order ledgers"
    );
    let mut outcomes = Vec::new();
    for month in MonthKey::months_of_year(year) {
        let table_name = naming.ledger_table(LedgerMode::Orders, &month);
        let rows = match store.read_all_rows(&table_name).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(table = %table_name, error = %err, "skipping unreadable ledger");
                continue;
            }
        };
        if rows.is_empty() {
            continue;
        }
        let mut table = Table::from_rows(rows);
        let header_extended = ensure_review_header(&mut table, schema);
        let updated_cells = apply_review_labels(&mut table, schema, reviews);
        let written = header_extended || updated_cells > 0;
        if written {
            store
                .write_all_rows(&table_name, &table.header, &table.rows)
                .await?;
        }
        info!(table = %table_name, header_extended, updated_cells, written, "review labels backfilled");
        outcomes.push(BackfillOutcome {
            table: table_name,
            header_extended,
            updated_cells,
            written,
        });
    }
    Ok(outcomes)
}
