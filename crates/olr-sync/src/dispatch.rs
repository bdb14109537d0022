//! Dispatch queue: line items paid and not yet shipped.

use chrono::{DateTime, Utc};
use olr_adapters::{ChangeScan, OrderFeed};
use olr_core::{cell, OrderDetail, Row, Table};
use olr_storage::TableStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::keys::clean_key_part;
use crate::schema::{migrate_header, HeaderMigration};

pub const DISPATCH_HEADER: [&str; 6] = ["상품주문번호", "택배사", "송장번호", "처리결과", "상품명", "수취인"];

pub fn dispatch_header() -> Row {
    DISPATCH_HEADER.iter().map(|s| s.to_string()).collect()
}

/// Paid and either not yet acknowledged or acknowledged without shipment.
pub fn is_awaiting_dispatch(record: &OrderDetail) -> bool {
    let Some(product) = record.product_order.as_ref() else {
        return false;
    };
    let status = product.product_order_status.as_deref().unwrap_or_default();
    let placed = product.place_order_status.as_deref().unwrap_or_default();
    status.trim().eq_ignore_ascii_case("PAYED")
        && matches!(placed.trim().to_uppercase().as_str(), "NOT_YET" | "OK")
}

fn queue_row(record: &OrderDetail) -> Row {
    let product = record.product_order.as_ref();
    vec![
        format!("'{}", record.product_order_id().unwrap_or_default()),
        String::new(),
        String::new(),
        String::new(),
        product
            .and_then(|p| p.product_name.clone())
            .unwrap_or_default(),
        product
            .and_then(|p| p.shipping_address.as_ref())
            .and_then(|a| a.name.clone())
            .unwrap_or_default(),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub table: String,
    pub added: usize,
    pub removed: usize,
    pub pending: usize,
    pub written: bool,
}

/// Line-item ids currently queued, in table order.
pub fn queued_ids(table: &Table) -> Vec<String> {
    table
        .rows
        .iter()
        .map(|row| clean_key_part(cell(row, 0)))
        .filter(|id| !id.is_empty())
        .collect()
}

/// Rebuild the queue. `verified` carries current details for ids already
/// queued; `fresh` carries recently changed line items. Existing rows keep
/// the cells an operator filled in; rows without an id are dropped.
pub fn plan_dispatch_queue(
    table: &Table,
    verified: &[OrderDetail],
    fresh: &[OrderDetail],
) -> (Vec<Row>, usize, usize) {
    let mut queue: Vec<(String, Row)> = Vec::new();
    for row in &table.rows {
        let id = clean_key_part(cell(row, 0));
        if !id.is_empty() && !queue.iter().any(|(queued, _)| *queued == id) {
            queue.push((id, row.clone()));
        }
    }
    let dropped = table.rows.len() - queue.len();

    let mut removed = 0;
    for record in verified.iter().chain(fresh) {
        let Some(id) = record.product_order_id().map(clean_key_part) else {
            continue;
        };
        if is_awaiting_dispatch(record) {
            continue;
        }
        let before = queue.len();
        queue.retain(|(queued, _)| *queued != id);
        removed += before - queue.len();
    }

    let mut added = 0;
    for record in fresh {
        let Some(id) = record.product_order_id().map(clean_key_part) else {
            continue;
        };
        if is_awaiting_dispatch(record) && !queue.iter().any(|(queued, _)| *queued == id) {
            queue.push((id, queue_row(record)));
            added += 1;
        }
    }

    let rows = queue.into_iter().map(|(_, row)| row).collect();
    (rows, added, removed + dropped)
}

/// Verify queued items, pull recent changes, and rewrite the queue table
/// when its contents changed.
pub async fn sync_dispatch_queue(
    store: &dyn TableStore,
    feed: &dyn OrderFeed,
    table_name: &str,
    now: DateTime<Utc>,
    lookback_hours: u32,
    limit_count: u32,
) -> anyhow::Result<DispatchOutcome> {
    let mut table = Table::from_rows(store.read_all_rows(table_name).await?);
    let header = migrate_header(&mut table, &dispatch_header());
    if let HeaderMigration::Rewritten { previous } = &header {
        warn!(table = table_name, previous = ?previous, "dispatch header rewritten");
    }

    let ids = queued_ids(&table);
    let verified = if ids.is_empty() {
        Vec::new()
    } else {
        feed.order_details(&ids).await?.orders
    };
    let fresh = feed
        .changed_orders(&ChangeScan::recent(now, lookback_hours, limit_count))
        .await?
        .orders;

    let (rows, added, removed) = plan_dispatch_queue(&table, &verified, &fresh);
    let written = header.is_change() || added > 0 || removed > 0;
    if written {
        store.write_all_rows(table_name, &table.header, &rows).await?;
    }
    info!(table = table_name, added, removed, pending = rows.len(), written, "dispatch queue synced");

    Ok(DispatchOutcome {
        table: table_name.to_string(),
        added,
        removed,
        pending: rows.len(),
        written,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use olr_core::{ProductOrder, ShippingAddress};

    fn line(id: &str, status: &str, placed: &str) -> OrderDetail {
        OrderDetail {
            product_order: Some(ProductOrder {
                product_order_id: Some(id.into()),
                product_order_status: Some(status.into()),
                place_order_status: Some(placed.into()),
                product_name: Some(format!("상품{id}")),
                shipping_address: Some(ShippingAddress {
                    name: Some("수취인".into()),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn awaiting_requires_paid_and_unshipped() {
        assert!(is_awaiting_dispatch(&line("1", "PAYED", "NOT_YET")));
        assert!(is_awaiting_dispatch(&line("1", "PAYED", "OK")));
        assert!(!is_awaiting_dispatch(&line("1", "PAYED", "CANCEL")));
        assert!(!is_awaiting_dispatch(&line("1", "DISPATCHED", "OK")));
        assert!(!is_awaiting_dispatch(&OrderDetail::default()));
    }

    #[test]
    fn queue_keeps_operator_cells_and_drops_shipped_items() {
        let table = Table::from_rows(vec![
            dispatch_header(),
            row(&["'P1", "CJ대한통운", "1234", "", "상품P1", "수취인"]),
            row(&["'P2", "", "", "", "상품P2", "수취인"]),
            row(&["", "memo"]),
        ]);
        let verified = vec![line("P1", "PAYED", "OK"), line("P2", "DISPATCHED", "OK")];
        let fresh = vec![line("P3", "PAYED", "NOT_YET"), line("P1", "PAYED", "OK")];

        let (rows, added, removed) = plan_dispatch_queue(&table, &verified, &fresh);
        assert_eq!(added, 1);
        assert_eq!(removed, 2);
        assert_eq!(
            rows,
            vec![
                row(&["'P1", "CJ대한통운", "1234", "", "상품P1", "수취인"]),
                row(&["'P3", "", "", "", "상품P3", "수취인"]),
            ]
        );
    }
}
