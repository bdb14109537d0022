//! Core domain model for the order ledger reconciler.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "olr-core";

/// One persisted row: string cells positionally aligned to a header.
pub type Row = Vec<String>;

/// Order-detail record as returned by the commerce feed.
///
/// Every nested object is optional; validation happens once at the
/// normalization boundary rather than during deserialization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderDetail {
    pub order: Option<OrderInfo>,
    pub product_order: Option<ProductOrder>,
    pub delivery: Option<Delivery>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path_add: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrderInfo {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub order_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub payment_date: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub payment_means: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub orderer_name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub orderer_tel1: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub orderer_tel2: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub orderer_tel: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path_add: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProductOrder {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_order_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_class_id: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_order_status: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub claim_type: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub claim_status: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub place_order_status: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub product_option: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub option_code: Option<String>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub quantity: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub unit_price: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub product_discount_amount: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub total_payment_amount: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub delivery_fee_amount: Option<i64>,
    #[serde(deserialize_with = "lenient::opt_amount")]
    pub expected_settlement_amount: Option<i64>,
    pub shipping_address: Option<ShippingAddress>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub shipping_memo: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub shipping_due_date: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub decision_date: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub inflow_path_add: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShippingAddress {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub tel1: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub base_address: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub detailed_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Delivery {
    #[serde(deserialize_with = "lenient::opt_string")]
    pub delivery_company: Option<String>,
    #[serde(deserialize_with = "lenient::opt_string")]
    pub tracking_number: Option<String>,
}

fn non_blank(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl OrderDetail {
    /// Vendor line-item identifier, trimmed; `None` when absent or blank.
    pub fn product_order_id(&self) -> Option<&str> {
        self.product_order
            .as_ref()
            .and_then(|p| non_blank(p.product_order_id.as_ref()))
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order.as_ref().and_then(|o| non_blank(o.order_id.as_ref()))
    }

    pub fn payment_date(&self) -> Option<&str> {
        self.order
            .as_ref()
            .and_then(|o| non_blank(o.payment_date.as_ref()))
    }

    pub fn product_status(&self) -> Option<&str> {
        self.product_order
            .as_ref()
            .and_then(|p| non_blank(p.product_order_status.as_ref()))
    }
}

impl ProductOrder {
    /// Product identifier with the productId → productClassId →
    /// productOrderId fallback chain.
    pub fn safe_product_id(&self) -> String {
        [
            &self.product_id,
            &self.product_class_id,
            &self.product_order_id,
        ]
        .into_iter()
        .find_map(|v| non_blank(v.as_ref()))
        .unwrap_or_default()
        .to_string()
    }

    /// Option text, `-` when the line item has no option.
    pub fn option_or_dash(&self) -> String {
        non_blank(self.product_option.as_ref())
            .unwrap_or("-")
            .to_string()
    }
}

/// Feed values arrive as numbers, numeric strings, or null depending on the
/// endpoint; these deserializers never fail on shape.
pub mod lenient {
    use super::*;

    pub fn opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::String(s)) => Some(s),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            Some(JsonValue::Bool(b)) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn opt_amount<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Option::<JsonValue>::deserialize(deserializer)?;
        Ok(match value {
            Some(JsonValue::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
            Some(JsonValue::String(s)) => parse_amount(&s),
            _ => None,
        })
    }

    /// Parse a grouped or plain numeric string, truncating any fraction.
    pub fn parse_amount(text: &str) -> Option<i64> {
        let cleaned = text.trim().replace(',', "");
        if cleaned.is_empty() {
            return None;
        }
        cleaned
            .parse::<i64>()
            .ok()
            .or_else(|| {
                cleaned
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
    }
}

/// In-memory snapshot of a persisted table: header row plus data rows.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Table {
    pub header: Row,
    pub rows: Vec<Row>,
}

impl Table {
    pub fn new(header: Row) -> Self {
        Self {
            header,
            rows: Vec::new(),
        }
    }

    /// Split raw storage rows into header (row 0) and data rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let mut iter = rows.into_iter();
        let header = iter.next().unwrap_or_default();
        Self {
            header,
            rows: iter.collect(),
        }
    }

    pub fn into_rows(self) -> Vec<Row> {
        let mut out = Vec::with_capacity(self.rows.len() + 1);
        out.push(self.header);
        out.extend(self.rows);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.header.is_empty() && self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Cell accessor that treats short rows as blank-padded.
pub fn cell(row: &[String], index: usize) -> &str {
    row.get(index).map(String::as_str).unwrap_or("")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerMode {
    Orders,
    Settlements,
}

impl fmt::Display for LedgerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orders => f.write_str("orders"),
            Self::Settlements => f.write_str("settlements"),
        }
    }
}

/// Calendar-month partition key, always `YYYY-MM`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonthKey(String);

impl MonthKey {
    /// Derive the month from the first seven characters of a timestamp.
    pub fn from_timestamp(timestamp: &str) -> Option<Self> {
        let head: String = timestamp.trim().chars().take(7).collect();
        Self::parse(&head)
    }

    pub fn parse(text: &str) -> Option<Self> {
        if text.len() != 7 || text.as_bytes()[4] != b'-' {
            return None;
        }
        NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d").ok()?;
        Some(Self(text.to_string()))
    }

    pub fn from_year_month(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|d| Self(d.format("%Y-%m").to_string()))
    }

    pub fn months_of_year(year: i32) -> Vec<Self> {
        (1..=12)
            .filter_map(|m| Self::from_year_month(year, m))
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table naming scheme: `{prefix}_{YYYY-MM}` for order ledgers and
/// `{prefix}{marker}_{YYYY-MM}` for settlement ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableNaming {
    pub prefix: String,
    pub settlement_marker: String,
}

impl TableNaming {
    pub fn new(prefix: impl Into<String>, settlement_marker: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            settlement_marker: settlement_marker.into(),
        }
    }

    pub fn ledger_table(&self, mode: LedgerMode, month: &MonthKey) -> String {
        match mode {
            LedgerMode::Orders => format!("{}_{}", self.prefix, month),
            LedgerMode::Settlements => {
                format!("{}{}_{}", self.prefix, self.settlement_marker, month)
            }
        }
    }

    /// Inverse of [`TableNaming::ledger_table`]; `None` for foreign names.
    pub fn parse_ledger_table(&self, name: &str) -> Option<(LedgerMode, MonthKey)> {
        let rest = name.strip_prefix(&self.prefix)?;
        let settlement_head = format!("{}_", self.settlement_marker);
        let (mode, month) = if let Some(month) = rest.strip_prefix(&settlement_head) {
            (LedgerMode::Settlements, month)
        } else {
            (LedgerMode::Orders, rest.strip_prefix('_')?)
        };
        MonthKey::parse(month).map(|m| (mode, m))
    }

    pub fn suffixed(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_takes_first_seven_characters() {
        let key = MonthKey::from_timestamp("2024-01-15T10:11:12.000+09:00").unwrap();
        assert_eq!(key.as_str(), "2024-01");
        assert!(MonthKey::from_timestamp("").is_none());
        assert!(MonthKey::from_timestamp("20240115").is_none());
        assert!(MonthKey::from_timestamp("2024-13-01").is_none());
    }

    #[test]
    fn table_names_parse_back_without_collision() {
        let naming = TableNaming::new("팩세이프", "정산");
        let month = MonthKey::parse("2024-02").unwrap();

        let orders = naming.ledger_table(LedgerMode::Orders, &month);
        let settlements = naming.ledger_table(LedgerMode::Settlements, &month);
        assert_eq!(orders, "팩세이프_2024-02");
        assert_eq!(settlements, "팩세이프정산_2024-02");

        assert_eq!(
            naming.parse_ledger_table(&orders),
            Some((LedgerMode::Orders, month.clone()))
        );
        assert_eq!(
            naming.parse_ledger_table(&settlements),
            Some((LedgerMode::Settlements, month))
        );
        assert_eq!(naming.parse_ledger_table("팩세이프_상품원가"), None);
        assert_eq!(naming.parse_ledger_table("other_2024-02"), None);
    }

    #[test]
    fn order_detail_deserializes_mixed_numeric_shapes() {
        let json = r#"{
            "order": {"orderId": 2024011512345, "paymentDate": "2024-01-15T10:00:00.0+09:00"},
            "productOrder": {
                "productOrderId": "PO-1",
                "quantity": "2",
                "unitPrice": 12900.0,
                "totalPaymentAmount": "25,800",
                "expectedSettlementAmount": null,
                "shippingAddress": null
            },
            "delivery": null
        }"#;
        let detail: OrderDetail = serde_json::from_str(json).unwrap();
        assert_eq!(detail.order_id(), Some("2024011512345"));
        let p = detail.product_order.as_ref().unwrap();
        assert_eq!(p.quantity, Some(2));
        assert_eq!(p.unit_price, Some(12900));
        assert_eq!(p.total_payment_amount, Some(25800));
        assert_eq!(p.expected_settlement_amount, None);
        assert!(p.shipping_address.is_none());
        assert!(detail.delivery.is_none());
    }

    #[test]
    fn safe_product_id_falls_back_through_identifiers() {
        let p = ProductOrder {
            product_order_id: Some("PO-9".into()),
            product_class_id: Some(" ".into()),
            ..Default::default()
        };
        assert_eq!(p.safe_product_id(), "PO-9");
        assert_eq!(p.option_or_dash(), "-");
    }

    #[test]
    fn table_splits_header_from_rows() {
        let table = Table::from_rows(vec![
            vec!["A".into(), "B".into()],
            vec!["1".into()],
        ]);
        assert_eq!(table.header, vec!["A", "B"]);
        assert_eq!(cell(&table.rows[0], 1), "");
        assert_eq!(table.into_rows().len(), 2);
        assert!(Table::from_rows(Vec::new()).is_empty());
    }
}
