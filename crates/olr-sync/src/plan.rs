//! Classifies a record batch against a persisted table into inserts,
//! updates and deletions, then applies the plan in memory.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use olr_core::{cell, LedgerMode, OrderDetail, Row, Table};
use serde::{Deserialize, Serialize};

use crate::keys::{key_for_record, key_for_row, LedgerKey};
use crate::normalize::{RecordError, RowNormalizer};
use crate::schema::LedgerSchema;

/// Status/claim substrings that remove a settlement row instead of
/// upserting it. Matched against the upper-cased raw `status claimType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionSet {
    tokens: Vec<String>,
}

impl Default for ExclusionSet {
    fn default() -> Self {
        Self::new(["취소", "반품", "거부", "CANCEL", "RETURN", "REJECT"])
    }
}

impl ExclusionSet {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().trim().to_uppercase())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn matches(&self, record: &OrderDetail) -> bool {
        let product = record.product_order.as_ref();
        let status = product
            .and_then(|p| p.product_order_status.as_deref())
            .unwrap_or_default();
        let claim = product
            .and_then(|p| p.claim_type.as_deref())
            .unwrap_or_default();
        let line = format!("{status} {claim}").to_uppercase();
        self.tokens.iter().any(|token| line.contains(token.as_str()))
    }
}

/// Position of a row a plan refers to: a persisted row or one of the
/// plan's own pending inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RowSlot {
    Existing(usize),
    Inserted(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub index: usize,
    pub reason: RecordError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertPlan {
    pub inserts: Vec<(LedgerKey, Row)>,
    pub updates: BTreeMap<usize, Row>,
    pub deletions: BTreeSet<RowSlot>,
    pub duplicates: BTreeSet<usize>,
    pub unchanged: usize,
    pub legacy_rows: usize,
    pub skipped: Vec<SkippedRecord>,
}

/// Counts after a plan was applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub duplicates_removed: usize,
    pub unchanged: usize,
    pub legacy_rows: usize,
    pub skipped: usize,
}

impl PlanStats {
    pub fn mutated(&self) -> bool {
        self.inserted + self.updated + self.deleted + self.duplicates_removed > 0
    }
}

impl UpsertPlan {
    pub fn is_noop(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletions.is_empty()
            && self.duplicates.is_empty()
    }

    /// Updates first, then surviving inserts appended, then deletions in
    /// descending position order. A deletion beats an update or insert of
    /// the same key.
    pub fn apply(self, table: &mut Table) -> PlanStats {
        let mut stats = PlanStats {
            unchanged: self.unchanged,
            legacy_rows: self.legacy_rows,
            skipped: self.skipped.len(),
            ..PlanStats::default()
        };

        for (position, row) in self.updates {
            if self.deletions.contains(&RowSlot::Existing(position)) {
                continue;
            }
            if let Some(slot) = table.rows.get_mut(position) {
                *slot = row;
                stats.updated += 1;
            }
        }

        for (n, (_, row)) in self.inserts.into_iter().enumerate() {
            if !self.deletions.contains(&RowSlot::Inserted(n)) {
                table.rows.push(row);
                stats.inserted += 1;
            }
        }

        let mut removals: BTreeSet<usize> = self
            .deletions
            .iter()
            .filter_map(|slot| match slot {
                RowSlot::Existing(position) => Some(*position),
                RowSlot::Inserted(_) => None,
            })
            .collect();
        let deleted = removals.len();
        removals.extend(self.duplicates.iter().copied());
        for position in removals.iter().rev() {
            if *position < table.rows.len() {
                table.rows.remove(*position);
            }
        }
        stats.deleted = deleted;
        stats.duplicates_removed = removals.len() - deleted;
        stats
    }
}

fn same_ignoring_volatile(schema: &LedgerSchema, persisted: &[String], incoming: &[String]) -> bool {
    let width = persisted.len().max(incoming.len());
    (0..width)
        .filter(|&i| !schema.is_volatile_position(i))
        .all(|i| cell(persisted, i) == cell(incoming, i))
}

pub struct UpsertPlanner<'a> {
    normalizer: RowNormalizer<'a>,
    exclusions: &'a ExclusionSet,
}

impl<'a> UpsertPlanner<'a> {
    pub fn new(normalizer: RowNormalizer<'a>, exclusions: &'a ExclusionSet) -> Self {
        Self {
            normalizer,
            exclusions,
        }
    }

    /// Persisted rows are indexed by key; on duplicate keys the last row is
    /// kept and earlier copies are scheduled for removal.
    fn index(&self, table: &Table, plan: &mut UpsertPlan) -> HashMap<LedgerKey, RowSlot> {
        let schema = self.normalizer.schema();
        let mut index = HashMap::new();
        for (position, row) in table.rows.iter().enumerate() {
            match key_for_row(schema, row) {
                Some(key) => {
                    if let Some(RowSlot::Existing(earlier)) =
                        index.insert(key, RowSlot::Existing(position))
                    {
                        plan.duplicates.insert(earlier);
                    }
                }
                None => plan.legacy_rows += 1,
            }
        }
        index
    }

    pub fn plan(&self, table: &Table, records: &[OrderDetail]) -> UpsertPlan {
        let schema = self.normalizer.schema();
        let mode = schema.mode();
        let mut plan = UpsertPlan::default();
        let mut index = self.index(table, &mut plan);

        for (i, record) in records.iter().enumerate() {
            let skip = |reason| SkippedRecord { index: i, reason };
            if record.product_order_id().is_none() {
                plan.skipped.push(skip(RecordError::MissingLineItemId));
                continue;
            }
            let Some(key) = key_for_record(mode, record) else {
                plan.skipped.push(skip(RecordError::MissingKey { mode }));
                continue;
            };

            if mode == LedgerMode::Settlements && self.exclusions.matches(record) {
                if let Some(slot) = index.get(&key) {
                    plan.deletions.insert(*slot);
                }
                continue;
            }

            let row = match self.normalizer.normalize(record) {
                Ok(row) => row,
                Err(reason) => {
                    plan.skipped.push(skip(reason));
                    continue;
                }
            };

            match index.get(&key).copied() {
                Some(RowSlot::Existing(position)) => {
                    let persisted = &table.rows[position];
                    if same_ignoring_volatile(schema, persisted, &row) {
                        plan.updates.remove(&position);
                        plan.unchanged += 1;
                    } else {
                        plan.updates.insert(position, row);
                    }
                }
                Some(RowSlot::Inserted(n)) => {
                    plan.inserts[n].1 = row;
                }
                None => {
                    index.insert(key.clone(), RowSlot::Inserted(plan.inserts.len()));
                    plan.inserts.push((key, row));
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookups::{CostBook, ReviewLabels};
    use crate::schema::LedgerField;
    use olr_core::{OrderInfo, ProductOrder};

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn simple_schema() -> LedgerSchema {
        LedgerSchema::new(
            LedgerMode::Orders,
            vec![
                ("Key", LedgerField::ProductOrderId),
                ("Status", LedgerField::OrderStatus),
                ("Seen", LedgerField::CollectedAt),
            ],
            None,
        )
        .unwrap()
    }

    fn order(id: &str, status: &str) -> OrderDetail {
        OrderDetail {
            order: Some(OrderInfo {
                order_id: Some("O-1".into()),
                ..Default::default()
            }),
            product_order: Some(ProductOrder {
                product_order_id: Some(id.into()),
                product_id: Some("100".into()),
                option_code: Some("9".into()),
                product_order_status: Some(status.into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn with_claim(mut record: OrderDetail, claim: &str) -> OrderDetail {
        if let Some(p) = record.product_order.as_mut() {
            p.claim_type = Some(claim.into());
        }
        record
    }

    #[test]
    fn classifies_inserts_updates_and_unchanged() {
        let schema = simple_schema();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t2"),
            &exclusions,
        );
        let mut table = Table::from_rows(vec![
            schema.header(),
            row(&["A", "결제완료", "t1"]),
            row(&["B", "결제완료", "t1"]),
            row(&["", "메모"]),
        ]);

        let plan = planner.plan(
            &table,
            &[order("A", "PAYED"), order("B", "DELIVERED"), order("C", "PAYED")],
        );
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.legacy_rows, 1);
        assert_eq!(plan.updates.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(plan.inserts.len(), 1);

        let stats = plan.apply(&mut table);
        assert_eq!((stats.inserted, stats.updated, stats.deleted), (1, 1, 0));
        assert_eq!(
            table.rows,
            vec![
                row(&["A", "결제완료", "t1"]),
                row(&["B", "배송완료", "t2"]),
                row(&["", "메모"]),
                row(&["C", "결제완료", "t2"]),
            ]
        );
    }

    #[test]
    fn duplicate_records_in_one_batch_resolve_to_the_last() {
        let schema = simple_schema();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut table = Table::new(schema.header());
        let plan = planner.plan(&table, &[order("A", "PAYED"), order("A", "CANCELED")]);
        plan.apply(&mut table);
        assert_eq!(table.rows, vec![row(&["A", "취소완료", "t"])]);
    }

    #[test]
    fn excluded_settlement_deletes_existing_and_pending_rows() {
        let schema = LedgerSchema::settlements();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut existing = row(&["O-1", "100", "'9"]);
        existing.resize(16, String::new());
        let mut other = row(&["O-2", "100", "'9"]);
        other.resize(16, String::new());
        let mut table = Table::from_rows(vec![schema.header(), existing, other.clone()]);

        let mut pending = order("P-2", "PAYED");
        pending.order.as_mut().unwrap().order_id = Some("O-3".into());
        let pending_cancel = with_claim(pending.clone(), "CANCEL");

        let plan = planner.plan(
            &table,
            &[
                with_claim(order("P-1", "PAYED"), "CANCEL"),
                pending,
                pending_cancel,
                with_claim(order("P-9", "PAYED"), "RETURN"),
            ],
        );
        assert_eq!(plan.deletions.len(), 2);

        let stats = plan.apply(&mut table);
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.deleted, 1);
        assert_eq!(table.rows, vec![other]);
    }

    #[test]
    fn deletion_wins_over_update_of_same_key() {
        let schema = LedgerSchema::settlements();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut existing = row(&["O-1", "100", "'9"]);
        existing.resize(16, String::new());
        let mut table = Table::from_rows(vec![schema.header(), existing]);

        let plan = planner.plan(
            &table,
            &[
                order("P-1", "DELIVERED"),
                with_claim(order("P-1", "DELIVERED"), "RETURN"),
            ],
        );
        let stats = plan.apply(&mut table);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.deleted, 1);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn later_upsert_cannot_revive_a_row_deleted_earlier_in_the_batch() {
        let schema = LedgerSchema::settlements();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut existing = row(&["O-1", "100", "'9"]);
        existing.resize(16, String::new());
        let mut table = Table::from_rows(vec![schema.header(), existing]);

        let plan = planner.plan(
            &table,
            &[
                with_claim(order("P-1", "PAYED"), "CANCEL"),
                order("P-1", "PAYED"),
            ],
        );
        assert!(plan.inserts.is_empty());
        let stats = plan.apply(&mut table);
        assert_eq!(stats.updated, 0);
        assert_eq!(stats.inserted, 0);
        assert_eq!(stats.deleted, 1);
        assert!(table.rows.is_empty());
    }

    #[test]
    fn duplicate_persisted_keys_collapse_to_last_copy() {
        let schema = simple_schema();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut table = Table::from_rows(vec![
            schema.header(),
            row(&["A", "old", "t0"]),
            row(&["A", "결제완료", "t0"]),
        ]);
        let plan = planner.plan(&table, &[order("A", "PAYED")]);
        assert!(!plan.is_noop());
        let stats = plan.apply(&mut table);
        assert_eq!(stats.duplicates_removed, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stats.unchanged, 1);
        assert_eq!(table.rows, vec![row(&["A", "결제완료", "t0"])]);
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let schema = LedgerSchema::settlements();
        let (costs, reviews, exclusions) =
            (CostBook::default(), ReviewLabels::default(), ExclusionSet::default());
        let planner = UpsertPlanner::new(
            RowNormalizer::new(&schema, &costs, &reviews, "t"),
            &exclusions,
        );
        let mut no_order = order("P-1", "PAYED");
        no_order.order = None;
        let plan = planner.plan(&Table::new(schema.header()), &[OrderDetail::default(), no_order]);
        assert_eq!(
            plan.skipped,
            vec![
                SkippedRecord {
                    index: 0,
                    reason: RecordError::MissingLineItemId
                },
                SkippedRecord {
                    index: 1,
                    reason: RecordError::MissingKey {
                        mode: LedgerMode::Settlements
                    }
                },
            ]
        );
        assert!(plan.is_noop());
    }

    #[test]
    fn exclusion_tokens_match_raw_codes_case_insensitively() {
        let set = ExclusionSet::new(["cancel"]);
        assert!(set.matches(&with_claim(order("A", "PAYED"), "Cancel")));
        assert!(!set.matches(&order("A", "PAYED")));
        assert!(ExclusionSet::default().matches(&order("A", "RETURNED")));
    }
}
