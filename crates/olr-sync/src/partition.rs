//! Routes a record batch into monthly ledger tables.

use std::collections::BTreeMap;

use olr_core::{LedgerMode, MonthKey, OrderDetail, TableNaming};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::persist::{LedgerReconciler, TableOutcome};
use crate::schema::LedgerSchema;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthlyPartitions {
    pub partitions: BTreeMap<MonthKey, Vec<OrderDetail>>,
    /// Records with no usable payment timestamp; never written anywhere.
    pub undated: usize,
}

/// Group by the `YYYY-MM` prefix of each record's payment timestamp.
pub fn partition_by_month(records: Vec<OrderDetail>) -> MonthlyPartitions {
    let mut out = MonthlyPartitions::default();
    for record in records {
        match record.payment_date().and_then(MonthKey::from_timestamp) {
            Some(month) => out.partitions.entry(month).or_default().push(record),
            None => out.undated += 1,
        }
    }
    if out.undated > 0 {
        warn!(undated = out.undated, "records without a payment date were not routed");
    }
    out
}

/// Result of reconciling one routed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableReport {
    Reconciled(TableOutcome),
    Failed {
        table: String,
        mode: LedgerMode,
        error: String,
    },
}

impl TableReport {
    pub fn table(&self) -> &str {
        match self {
            Self::Reconciled(outcome) => &outcome.table,
            Self::Failed { table, .. } => table,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Reconcile every partition into each schema's monthly table. Tables are
/// independent: a failure is recorded and the remaining tables proceed.
pub async fn route_partitions(
    reconciler: &LedgerReconciler<'_>,
    naming: &TableNaming,
    schemas: &[&LedgerSchema],
    partitions: &MonthlyPartitions,
) -> Vec<TableReport> {
    let mut reports = Vec::new();
    for (month, records) in &partitions.partitions {
        for schema in schemas {
            let table = naming.ledger_table(schema.mode(), month);
            match reconciler.reconcile(&table, schema, records).await {
                Ok(outcome) => reports.push(TableReport::Reconciled(outcome)),
                Err(err) => {
                    error!(table = %table, error = %err, "table reconciliation failed");
                    reports.push(TableReport::Failed {
                        table,
                        mode: schema.mode(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }
    reports
}
