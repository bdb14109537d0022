//! Identity keys for records and persisted rows.
//!
//! Both sides go through [`compose_key`], so a record and the row written
//! from it always produce the same key.

use std::fmt;

use olr_core::{cell, LedgerMode, OrderDetail};
use serde::{Deserialize, Serialize};

use crate::schema::LedgerSchema;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey(String);

impl LedgerKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip whitespace, quote characters and the leading text marker that
/// spreadsheet cells carry.
pub fn clean_key_part(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\'' | '"'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn compose_key<S: AsRef<str>>(mode: LedgerMode, parts: &[S]) -> Option<LedgerKey> {
    let parts: Vec<String> = parts.iter().map(|p| clean_key_part(p.as_ref())).collect();
    match mode {
        LedgerMode::Orders => {
            let id = parts.first().filter(|id| !id.is_empty())?;
            Some(LedgerKey(id.clone()))
        }
        LedgerMode::Settlements => {
            let [order_id, product_id, option] = parts.as_slice() else {
                return None;
            };
            if order_id.is_empty() || product_id.is_empty() {
                return None;
            }
            Some(LedgerKey(format!("{order_id}_{product_id}_{option}")))
        }
    }
}

/// Key of an incoming record; `None` when the identifying fields are blank.
pub fn key_for_record(mode: LedgerMode, record: &OrderDetail) -> Option<LedgerKey> {
    let product = record.product_order.as_ref()?;
    match mode {
        LedgerMode::Orders => compose_key(mode, &[record.product_order_id()?]),
        LedgerMode::Settlements => compose_key(
            mode,
            &[
                record.order_id().unwrap_or_default().to_string(),
                product.safe_product_id(),
                product.option_code.clone().unwrap_or_default(),
            ],
        ),
    }
}

/// Key of a persisted row; `None` for rows too short to hold the key or
/// whose key cells are blank.
pub fn key_for_row(schema: &LedgerSchema, row: &[String]) -> Option<LedgerKey> {
    let positions = schema.key_positions();
    let last = positions.iter().copied().max()?;
    if row.len() <= last {
        return None;
    }
    let parts: Vec<&str> = positions.iter().map(|&i| cell(row, i)).collect();
    compose_key(schema.mode(), &parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use olr_core::{OrderInfo, ProductOrder};

    fn settlement_record(option: Option<&str>) -> OrderDetail {
        OrderDetail {
            order: Some(OrderInfo {
                order_id: Some("2024011500001".into()),
                ..Default::default()
            }),
            product_order: Some(ProductOrder {
                product_order_id: Some("PO-1".into()),
                product_id: Some("8812".into()),
                option_code: option.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn cleaning_strips_markers_and_quotes() {
        assert_eq!(clean_key_part(" '12345 "), "12345");
        assert_eq!(clean_key_part("\"ab\"c"), "abc");
    }

    #[test]
    fn settlement_keys_match_between_record_and_row() {
        let schema = LedgerSchema::settlements();
        let record = settlement_record(Some("77"));
        let key = key_for_record(LedgerMode::Settlements, &record).unwrap();
        assert_eq!(key.as_str(), "2024011500001_8812_77");

        let row: Vec<String> = ["2024011500001", "8812", "'77", "상품"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(key_for_row(&schema, &row), Some(key));
    }

    #[test]
    fn settlement_key_allows_blank_option_but_not_blank_order() {
        let record = settlement_record(None);
        let key = key_for_record(LedgerMode::Settlements, &record).unwrap();
        assert_eq!(key.as_str(), "2024011500001_8812_");

        let mut orphan = settlement_record(Some("1"));
        orphan.order = None;
        assert!(key_for_record(LedgerMode::Settlements, &orphan).is_none());
    }

    #[test]
    fn short_or_blank_rows_have_no_key() {
        let schema = LedgerSchema::orders();
        assert_eq!(key_for_row(&schema, &["only".to_string()]), None);
        assert_eq!(
            key_for_row(&schema, &["o".to_string(), " ".to_string()]),
            None
        );
        assert_eq!(
            key_for_row(&schema, &["o".to_string(), "PO-1".to_string()])
                .map(|k| k.to_string()),
            Some("PO-1".to_string())
        );
    }
}
