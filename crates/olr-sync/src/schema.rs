//! Declared column schemas and header migration.

use olr_core::{LedgerMode, Row, Table};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic content of one ledger column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerField {
    OrderId,
    ProductOrderId,
    ProductId,
    OptionCode,
    OrderStatus,
    ClaimType,
    ClaimStatus,
    PaymentDate,
    DecisionDate,
    PaymentMeans,
    ProductName,
    ProductOption,
    Quantity,
    UnitPrice,
    ProductDiscount,
    TotalPayment,
    DeliveryFee,
    UnitRealPrice,
    Fee,
    TotalCost,
    Margin,
    MarginRate,
    OrdererName,
    OrdererTel,
    ReceiverName,
    ReceiverTel,
    Address,
    ShippingMemo,
    Courier,
    TrackingNumber,
    ShippingDueDate,
    TrackingUrl,
    CollectedAt,
    ReviewLabel,
    InflowPath,
}

impl LedgerField {
    /// Volatile cells change on every pass and are ignored when deciding
    /// whether an existing row changed.
    pub fn is_volatile(self) -> bool {
        matches!(self, Self::CollectedAt)
    }
}

/// Fields that make up the identity key, in key order.
pub fn key_fields(mode: LedgerMode) -> &'static [LedgerField] {
    match mode {
        LedgerMode::Orders => &[LedgerField::ProductOrderId],
        LedgerMode::Settlements => &[
            LedgerField::OrderId,
            LedgerField::ProductId,
            LedgerField::OptionCode,
        ],
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{mode} schema has no {field:?} column")]
    MissingKeyColumn { mode: LedgerMode, field: LedgerField },
    #[error("{mode} schema sort field {field:?} is not a declared column")]
    MissingSortColumn { mode: LedgerMode, field: LedgerField },
    #[error("{mode} schema declares {field:?} twice")]
    DuplicateField { mode: LedgerMode, field: LedgerField },
}

/// Ordered column declaration for one ledger mode. Key and sort positions
/// are resolved once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSchema {
    mode: LedgerMode,
    columns: Vec<(String, LedgerField)>,
    key_positions: Vec<usize>,
    sort_position: Option<usize>,
}

impl LedgerSchema {
    pub fn new<S: Into<String>>(
        mode: LedgerMode,
        columns: Vec<(S, LedgerField)>,
        sort_field: Option<LedgerField>,
    ) -> Result<Self, SchemaError> {
        let columns: Vec<(String, LedgerField)> = columns
            .into_iter()
            .map(|(header, field)| (header.into(), field))
            .collect();

        for (i, (_, field)) in columns.iter().enumerate() {
            if columns[..i].iter().any(|(_, seen)| seen == field) {
                return Err(SchemaError::DuplicateField {
                    mode,
                    field: *field,
                });
            }
        }

        let position = |wanted: LedgerField| columns.iter().position(|(_, f)| *f == wanted);
        let key_positions = key_fields(mode)
            .iter()
            .map(|field| {
                position(*field).ok_or(SchemaError::MissingKeyColumn {
                    mode,
                    field: *field,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sort_position = match sort_field {
            Some(field) => {
                Some(position(field).ok_or(SchemaError::MissingSortColumn { mode, field })?)
            }
            None => None,
        };

        Ok(Self {
            mode,
            columns,
            key_positions,
            sort_position,
        })
    }

    /// The 27-column order ledger, sorted by payment date.
    pub fn orders() -> Self {
        use LedgerField::*;
        Self::built_in(
            LedgerMode::Orders,
            &[
                ("주문번호", OrderId),
                ("상품주문번호", ProductOrderId),
                ("상품번호", ProductId),
                ("옵션ID", OptionCode),
                ("주문상태", OrderStatus),
                ("클레임유형", ClaimType),
                ("클레임상태", ClaimStatus),
                ("결제일시", PaymentDate),
                ("상품명", ProductName),
                ("옵션정보", ProductOption),
                ("수량", Quantity),
                ("정가", UnitPrice),
                ("상품할인금액", ProductDiscount),
                ("총결제금액", TotalPayment),
                ("배송비", DeliveryFee),
                ("주문자명", OrdererName),
                ("주문자연락처", OrdererTel),
                ("수취인명", ReceiverName),
                ("수취인연락처", ReceiverTel),
                ("주소", Address),
                ("배송메세지", ShippingMemo),
                ("택배사", Courier),
                ("송장번호", TrackingNumber),
                ("발송기한", ShippingDueDate),
                ("배송조회", TrackingUrl),
                ("수집일시", CollectedAt),
                ("리뷰유형", ReviewLabel),
            ],
        )
    }

    /// The 16-column settlement ledger, sorted by payment date.
    pub fn settlements() -> Self {
        use LedgerField::*;
        Self::built_in(
            LedgerMode::Settlements,
            &[
                ("주문번호", OrderId),
                ("상품번호", ProductId),
                ("옵션ID", OptionCode),
                ("상품명", ProductName),
                ("옵션정보", ProductOption),
                ("결제일시", PaymentDate),
                ("구매확정일", DecisionDate),
                ("결제수단", PaymentMeans),
                ("수량", Quantity),
                ("실거래단가", UnitRealPrice),
                ("총결제금액", TotalPayment),
                ("수수료", Fee),
                ("매입원가(총)", TotalCost),
                ("마진", Margin),
                ("마진율(%)", MarginRate),
                ("유입경로", InflowPath),
            ],
        )
    }

    pub fn for_mode(mode: LedgerMode) -> Self {
        match mode {
            LedgerMode::Orders => Self::orders(),
            LedgerMode::Settlements => Self::settlements(),
        }
    }

    // Built-in declarations always carry their key and sort columns.
    fn built_in(mode: LedgerMode, columns: &[(&str, LedgerField)]) -> Self {
        let columns: Vec<(String, LedgerField)> = columns
            .iter()
            .map(|(header, field)| (header.to_string(), *field))
            .collect();
        let position = |wanted: LedgerField| columns.iter().position(|(_, f)| *f == wanted);
        let key_positions = key_fields(mode).iter().filter_map(|f| position(*f)).collect();
        let sort_position = position(LedgerField::PaymentDate);
        Self {
            mode,
            columns,
            key_positions,
            sort_position,
        }
    }

    pub fn mode(&self) -> LedgerMode {
        self.mode
    }

    pub fn header(&self) -> Row {
        self.columns.iter().map(|(h, _)| h.clone()).collect()
    }

    pub fn fields(&self) -> impl Iterator<Item = LedgerField> + '_ {
        self.columns.iter().map(|(_, f)| *f)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, field: LedgerField) -> Option<usize> {
        self.columns.iter().position(|(_, f)| *f == field)
    }

    pub fn key_positions(&self) -> &[usize] {
        &self.key_positions
    }

    pub fn sort_position(&self) -> Option<usize> {
        self.sort_position
    }

    pub fn is_volatile_position(&self, index: usize) -> bool {
        self.columns
            .get(index)
            .is_some_and(|(_, field)| field.is_volatile())
    }
}

/// What happened to a table's header row during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HeaderMigration {
    Unchanged,
    Created,
    Rewritten { previous: Row },
}

impl HeaderMigration {
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Make row 0 equal the declared header. Data rows are left untouched; a
/// rewritten header does not realign previously written cells.
pub fn migrate_header(table: &mut Table, declared: &[String]) -> HeaderMigration {
    if table.is_empty() {
        table.header = declared.to_vec();
        return HeaderMigration::Created;
    }
    if table.header == declared {
        return HeaderMigration::Unchanged;
    }
    let previous = std::mem::replace(&mut table.header, declared.to_vec());
    HeaderMigration::Rewritten { previous }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn built_in_schemas_resolve_key_and_sort_columns() {
        let orders = LedgerSchema::orders();
        assert_eq!(orders.len(), 27);
        assert_eq!(orders.key_positions(), &[1]);
        assert_eq!(orders.sort_position(), Some(7));
        assert_eq!(orders.position(LedgerField::ReviewLabel), Some(26));
        assert!(orders.is_volatile_position(25));

        let settlements = LedgerSchema::settlements();
        assert_eq!(settlements.len(), 16);
        assert_eq!(settlements.key_positions(), &[0, 1, 2]);
        assert_eq!(settlements.sort_position(), Some(5));
    }

    #[test]
    fn custom_schema_requires_key_columns() {
        let err = LedgerSchema::new(
            LedgerMode::Settlements,
            vec![("Order", LedgerField::OrderId)],
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingKeyColumn {
                mode: LedgerMode::Settlements,
                field: LedgerField::ProductId
            }
        );

        let schema = LedgerSchema::new(
            LedgerMode::Orders,
            vec![
                ("Key", LedgerField::ProductOrderId),
                ("Status", LedgerField::OrderStatus),
            ],
            None,
        )
        .unwrap();
        assert_eq!(schema.header(), row(&["Key", "Status"]));
        assert_eq!(schema.sort_position(), None);
    }

    #[test]
    fn custom_schema_rejects_unknown_sort_and_duplicates() {
        assert!(matches!(
            LedgerSchema::new(
                LedgerMode::Orders,
                vec![("Key", LedgerField::ProductOrderId)],
                Some(LedgerField::PaymentDate),
            ),
            Err(SchemaError::MissingSortColumn { .. })
        ));
        assert!(matches!(
            LedgerSchema::new(
                LedgerMode::Orders,
                vec![
                    ("Key", LedgerField::ProductOrderId),
                    ("Again", LedgerField::ProductOrderId)
                ],
                None,
            ),
            Err(SchemaError::DuplicateField { .. })
        ));
    }

    #[test]
    fn header_migration_outcomes() {
        let declared = row(&["A", "B", "C"]);

        let mut empty = Table::default();
        assert_eq!(migrate_header(&mut empty, &declared), HeaderMigration::Created);
        assert_eq!(empty.header, declared);

        let mut same = Table::new(declared.clone());
        assert_eq!(migrate_header(&mut same, &declared), HeaderMigration::Unchanged);

        let mut drifted = Table::from_rows(vec![row(&["A", "B"]), row(&["1", "2"])]);
        let outcome = migrate_header(&mut drifted, &declared);
        assert_eq!(
            outcome,
            HeaderMigration::Rewritten {
                previous: row(&["A", "B"])
            }
        );
        assert_eq!(drifted.header, declared);
        assert_eq!(drifted.rows, vec![row(&["1", "2"])]);
    }
}
