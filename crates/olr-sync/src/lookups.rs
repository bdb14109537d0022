//! Auxiliary lookup tables consulted during normalization.

use std::collections::{BTreeSet, HashMap, HashSet};

use olr_core::{cell, OrderDetail, Row, Table};
use serde::{Deserialize, Serialize};

use crate::keys::clean_key_part;

pub const COST_HEADER: [&str; 4] = ["상품번호(필수)", "상품명", "옵션명(중요)", "원가(단가)"];

/// Unit purchase cost by (product id, option text).
#[derive(Debug, Clone, Default)]
pub struct CostBook {
    costs: HashMap<(String, String), i64>,
    priced: HashSet<(String, String)>,
    registered: HashSet<(String, String)>,
}

fn strip_spaces(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

impl CostBook {
    pub fn header() -> Row {
        COST_HEADER.iter().map(|s| s.to_string()).collect()
    }

    /// Load from cost-table data rows. Rows with fewer than four cells or a
    /// blank product id are ignored; rows without a numeric cost are still
    /// remembered as registered.
    pub fn from_table(table: &Table) -> Self {
        let mut book = Self::default();
        for row in &table.rows {
            if row.len() < 4 {
                continue;
            }
            let product_id = cell(row, 0).trim();
            if product_id.is_empty() {
                continue;
            }
            let option = cell(row, 2).trim();
            book.registered
                .insert((product_id.to_string(), option.to_string()));

            let digits = cell(row, 3).replace(',', "");
            let digits = digits.trim();
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(cost) = digits.parse::<i64>() {
                    book.insert(product_id, option, cost);
                }
            }
        }
        book
    }

    /// Store under the exact option and its whitespace-free form. The exact
    /// entry always wins; the stripped entry only fills a gap.
    pub fn insert(&mut self, product_id: &str, option: &str, cost: i64) {
        self.priced
            .insert((product_id.to_string(), option.to_string()));
        self.costs
            .insert((product_id.to_string(), option.to_string()), cost);
        self.costs
            .entry((product_id.to_string(), strip_spaces(option)))
            .or_insert(cost);
    }

    /// Exact option, then whitespace-free option, then the product-level
    /// `-` entry. Absent everywhere means zero.
    pub fn unit_cost(&self, product_id: &str, option: &str) -> i64 {
        let product_id = product_id.to_string();
        [option.to_string(), strip_spaces(option), "-".to_string()]
            .into_iter()
            .find_map(|opt| self.costs.get(&(product_id.clone(), opt)).copied())
            .unwrap_or(0)
    }

    /// Number of priced (product, option) pairs, not lookup entries.
    pub fn len(&self) -> usize {
        self.priced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.priced.is_empty()
    }

    /// Rows for (product, option) pairs seen in `records` that the cost
    /// table does not list yet. Returned pairs count as registered.
    pub fn unregistered_rows(&mut self, records: &[OrderDetail]) -> Vec<Row> {
        let mut out = Vec::new();
        for record in records {
            let Some(product) = record.product_order.as_ref() else {
                continue;
            };
            let product_id = product.safe_product_id();
            if product_id.is_empty() {
                continue;
            }
            let option = product.option_or_dash();
            if self.registered.insert((product_id.clone(), option.clone())) {
                out.push(vec![
                    product_id,
                    product.product_name.clone().unwrap_or_default(),
                    option,
                    String::new(),
                ]);
            }
        }
        out
    }
}

/// Column positions inside the review export table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewColumns {
    pub key: usize,
    pub kind: usize,
    pub photo: usize,
}

impl Default for ReviewColumns {
    fn default() -> Self {
        Self {
            key: 22,
            kind: 2,
            photo: 4,
        }
    }
}

impl ReviewColumns {
    fn widest(&self) -> usize {
        self.key.max(self.kind).max(self.photo)
    }
}

/// `한달|일반` + `포토|텍스트`.
pub fn review_label(kind: &str, photo: &str) -> String {
    let period = if kind.contains("한달") { "한달" } else { "일반" };
    let photo = photo.trim();
    let media = if !photo.is_empty() && photo != "-" && photo != "없음" {
        "포토"
    } else {
        "텍스트"
    };
    format!("{period}{media}")
}

/// Review labels keyed by line-item id.
#[derive(Debug, Clone, Default)]
pub struct ReviewLabels {
    labels: HashMap<String, BTreeSet<String>>,
}

impl ReviewLabels {
    /// Build from review-table data rows; returns the labels and the number
    /// of rows too short to carry every configured column.
    pub fn from_table(table: &Table, columns: ReviewColumns) -> (Self, usize) {
        let mut labels = Self::default();
        let mut skipped = 0;
        for row in &table.rows {
            if row.len() <= columns.widest() {
                skipped += 1;
                continue;
            }
            let key = clean_key_part(cell(row, columns.key));
            if key.is_empty() {
                continue;
            }
            labels.insert(
                key,
                review_label(cell(row, columns.kind), cell(row, columns.photo)),
            );
        }
        (labels, skipped)
    }

    pub fn insert(&mut self, key: impl Into<String>, label: impl Into<String>) {
        self.labels.entry(key.into()).or_default().insert(label.into());
    }

    /// Sorted distinct labels joined by ` + `; blank when none.
    pub fn label_for(&self, key: &str) -> String {
        self.labels
            .get(key)
            .map(|set| set.iter().cloned().collect::<Vec<_>>().join(" + "))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use olr_core::ProductOrder;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cost_lookup_falls_back_through_option_forms() {
        let table = Table::from_rows(vec![
            CostBook::header(),
            row(&["100", "머그", "화이트 L", "4,500"]),
            row(&["200", "컵", "-", "1200"]),
            row(&["300", "미정", "A", ""]),
            row(&["", "blank", "A", "10"]),
            row(&["400", "short"]),
        ]);
        let book = CostBook::from_table(&table);
        assert_eq!(book.unit_cost("100", "화이트 L"), 4500);
        assert_eq!(book.unit_cost("100", "화이트  L"), 4500);
        assert_eq!(book.unit_cost("100", "화이트L"), 4500);
        assert_eq!(book.unit_cost("200", "아무거나"), 1200);
        assert_eq!(book.unit_cost("300", "A"), 0);
        assert_eq!(book.unit_cost("999", "-"), 0);
        assert_eq!(book.len(), 2);
    }

    #[test]
    fn unregistered_pairs_are_reported_once() {
        let table = Table::from_rows(vec![CostBook::header(), row(&["100", "머그", "-", "1"])]);
        let mut book = CostBook::from_table(&table);
        let record = |pid: &str, option: Option<&str>| OrderDetail {
            product_order: Some(ProductOrder {
                product_order_id: Some(format!("PO-{pid}")),
                product_id: Some(pid.into()),
                product_name: Some("이름".into()),
                product_option: option.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        };
        let records = vec![
            record("100", None),
            record("100", Some("블랙")),
            record("100", Some("블랙")),
            record("200", None),
        ];
        let rows = book.unregistered_rows(&records);
        assert_eq!(
            rows,
            vec![row(&["100", "이름", "블랙", ""]), row(&["200", "이름", "-", ""])]
        );
        assert!(book.unregistered_rows(&records).is_empty());
    }

    #[test]
    fn review_labels_combine_sorted_and_distinct() {
        let columns = ReviewColumns {
            key: 3,
            kind: 0,
            photo: 1,
        };
        let table = Table::from_rows(vec![
            row(&["유형", "사진", "x", "상품주문번호"]),
            row(&["한달사용", "img.jpg", "", "'PO-1"]),
            row(&["일반", "-", "", "PO-1"]),
            row(&["일반", "", "", "PO-1"]),
            row(&["일반", "없음", ""]),
        ]);
        let (labels, skipped) = ReviewLabels::from_table(&table, columns);
        assert_eq!(skipped, 1);
        assert_eq!(labels.label_for("PO-1"), "일반텍스트 + 한달포토");
        assert_eq!(labels.label_for("PO-2"), "");
    }
}
