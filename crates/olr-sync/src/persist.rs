//! Per-table reconciliation: read, migrate header, plan, apply, sort and
//! write back only when something changed.

use olr_core::{cell, LedgerMode, OrderDetail, Row, Table};
use olr_storage::{content_sha256, StorageError, TableStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::lookups::{CostBook, ReviewLabels};
use crate::normalize::RowNormalizer;
use crate::plan::{ExclusionSet, PlanStats, UpsertPlanner};
use crate::schema::{migrate_header, HeaderMigration, LedgerSchema};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reading table {table}: {source}")]
    Read {
        table: String,
        #[source]
        source: StorageError,
    },
    #[error("writing table {table}: {source}")]
    Persist {
        table: String,
        #[source]
        source: StorageError,
    },
}

/// Stable descending sort by one column; short rows sort as blank.
pub fn sort_rows_desc(rows: &mut [Row], column: usize) {
    rows.sort_by(|a, b| cell(b, column).cmp(cell(a, column)));
}

/// Summary of one reconciled table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOutcome {
    pub table: String,
    pub mode: LedgerMode,
    pub header: HeaderMigration,
    #[serde(flatten)]
    pub stats: PlanStats,
    pub written: bool,
    pub row_count: usize,
    pub content_sha256: String,
}

/// Shared lookups for every table reconciled in one pass.
#[derive(Debug, Clone, Copy)]
pub struct PassContext<'a> {
    pub costs: &'a CostBook,
    pub reviews: &'a ReviewLabels,
    pub exclusions: &'a ExclusionSet,
    pub collected_at: &'a str,
}

pub struct LedgerReconciler<'a> {
    store: &'a dyn TableStore,
    context: PassContext<'a>,
}

impl<'a> LedgerReconciler<'a> {
    pub fn new(store: &'a dyn TableStore, context: PassContext<'a>) -> Self {
        Self { store, context }
    }

    /// Reconcile `records` into `table_name`. A failed read aborts this
    /// table with nothing written.
    pub async fn reconcile(
        &self,
        table_name: &str,
        schema: &LedgerSchema,
        records: &[OrderDetail],
    ) -> Result<TableOutcome, ReconcileError> {
        let rows = self
            .store
            .read_all_rows(table_name)
            .await
            .map_err(|source| ReconcileError::Read {
                table: table_name.to_string(),
                source,
            })?;
        let mut table = Table::from_rows(rows);

        let header = migrate_header(&mut table, &schema.header());
        if let HeaderMigration::Rewritten { previous } = &header {
            warn!(
                table = table_name,
                previous_columns = previous.len(),
                declared_columns = schema.len(),
                "header drifted from declared schema; rewritten in place"
            );
        }

        let normalizer = RowNormalizer::new(
            schema,
            self.context.costs,
            self.context.reviews,
            self.context.collected_at,
        );
        let plan = UpsertPlanner::new(normalizer, self.context.exclusions).plan(&table, records);
        for skipped in &plan.skipped {
            warn!(table = table_name, index = skipped.index, reason = %skipped.reason, "record skipped");
        }
        let stats = plan.apply(&mut table);

        let written = header.is_change() || stats.mutated();
        if written {
            if let Some(column) = schema.sort_position() {
                sort_rows_desc(&mut table.rows, column);
            }
            self.store
                .write_all_rows(table_name, &table.header, &table.rows)
                .await
                .map_err(|source| ReconcileError::Persist {
                    table: table_name.to_string(),
                    source,
                })?;
        }

        info!(
            table = table_name,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            unchanged = stats.unchanged,
            skipped = stats.skipped,
            written,
            "table reconciled"
        );

        Ok(TableOutcome {
            table: table_name.to_string(),
            mode: schema.mode(),
            header,
            stats,
            written,
            row_count: table.rows.len(),
            content_sha256: content_sha256(&table.header, &table.rows),
        })
    }
}
