//! Record → row conversion against a declared schema.

use olr_core::{LedgerMode, OrderDetail, ProductOrder, Row};
use serde::Serialize;
use thiserror::Error;

use crate::keys::clean_key_part;
use crate::lookups::{CostBook, ReviewLabels};
use crate::schema::{LedgerField, LedgerSchema};
use crate::translate::{
    format_amount, format_rate, format_timestamp, reclassify_claim, tracking_url,
    translate_courier, translate_inflow_path, translate_status, LABEL_UNDECIDED,
};

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordError {
    #[error("record has no line-item identifier")]
    MissingLineItemId,
    #[error("record has no derivable {mode} key")]
    MissingKey { mode: LedgerMode },
}

/// Converts feed records into schema-aligned rows. Lookups are borrowed for
/// the duration of one pass.
#[derive(Debug, Clone, Copy)]
pub struct RowNormalizer<'a> {
    schema: &'a LedgerSchema,
    costs: &'a CostBook,
    reviews: &'a ReviewLabels,
    collected_at: &'a str,
}

impl<'a> RowNormalizer<'a> {
    pub fn new(
        schema: &'a LedgerSchema,
        costs: &'a CostBook,
        reviews: &'a ReviewLabels,
        collected_at: &'a str,
    ) -> Self {
        Self {
            schema,
            costs,
            reviews,
            collected_at,
        }
    }

    pub fn schema(&self) -> &'a LedgerSchema {
        self.schema
    }

    /// One cell per declared column. Missing fields become blank or `0`
    /// cells, never errors; only a record without a line item is rejected.
    pub fn normalize(&self, record: &OrderDetail) -> Result<Row, RecordError> {
        let product = record
            .product_order
            .as_ref()
            .filter(|_| record.product_order_id().is_some())
            .ok_or(RecordError::MissingLineItemId)?;
        let figures = Figures::compute(product, self.costs);
        Ok(self
            .schema
            .fields()
            .map(|field| self.cell(field, record, product, &figures))
            .collect())
    }

    fn cell(
        &self,
        field: LedgerField,
        record: &OrderDetail,
        product: &ProductOrder,
        figures: &Figures,
    ) -> String {
        let text = |value: &Option<String>| value.clone().unwrap_or_default();
        let order = record.order.as_ref();
        let address = product.shipping_address.as_ref();
        let delivery = record.delivery.as_ref();

        match field {
            LedgerField::OrderId => record.order_id().unwrap_or_default().to_string(),
            LedgerField::ProductOrderId => record.product_order_id().unwrap_or_default().to_string(),
            LedgerField::ProductId => product.safe_product_id(),
            LedgerField::OptionCode => {
                format!("'{}", product.option_code.as_deref().unwrap_or_default())
            }
            LedgerField::OrderStatus => status_label(product),
            LedgerField::ClaimType => reclassify_claim(
                &status_label(product),
                translate_status(product.claim_type.as_deref()),
            ),
            LedgerField::ClaimStatus => translate_status(product.claim_status.as_deref()),
            LedgerField::PaymentDate => {
                format_timestamp(record.payment_date()).unwrap_or_default()
            }
            LedgerField::DecisionDate => format_timestamp(product.decision_date.as_deref())
                .unwrap_or_else(|| LABEL_UNDECIDED.to_string()),
            LedgerField::PaymentMeans => order.map(|o| text(&o.payment_means)).unwrap_or_default(),
            LedgerField::ProductName => text(&product.product_name),
            LedgerField::ProductOption => product.option_or_dash(),
            LedgerField::Quantity => figures.quantity.to_string(),
            LedgerField::UnitPrice => format_amount(product.unit_price),
            LedgerField::ProductDiscount => format_amount(product.product_discount_amount),
            LedgerField::TotalPayment => format_amount(Some(figures.payment)),
            LedgerField::DeliveryFee => format_amount(product.delivery_fee_amount),
            LedgerField::UnitRealPrice => format_amount(Some(figures.unit_real_price)),
            LedgerField::Fee => format_amount(Some(figures.fee)),
            LedgerField::TotalCost => format_amount(Some(figures.total_cost)),
            LedgerField::Margin => format_amount(Some(figures.margin)),
            LedgerField::MarginRate => format_rate(figures.margin, figures.payment),
            LedgerField::OrdererName => order.map(|o| text(&o.orderer_name)).unwrap_or_default(),
            LedgerField::OrdererTel => order
                .and_then(|o| {
                    [&o.orderer_tel1, &o.orderer_tel2, &o.orderer_tel]
                        .into_iter()
                        .flatten()
                        .find(|t| !t.trim().is_empty())
                        .cloned()
                })
                .unwrap_or_default(),
            LedgerField::ReceiverName => address.map(|a| text(&a.name)).unwrap_or_default(),
            LedgerField::ReceiverTel => address.map(|a| text(&a.tel1)).unwrap_or_default(),
            LedgerField::Address => address
                .map(|a| {
                    format!("{} {}", text(&a.base_address), text(&a.detailed_address))
                        .trim()
                        .to_string()
                })
                .unwrap_or_default(),
            LedgerField::ShippingMemo => text(&product.shipping_memo),
            LedgerField::Courier => {
                translate_courier(delivery.and_then(|d| d.delivery_company.as_deref()))
            }
            LedgerField::TrackingNumber => {
                delivery.map(|d| text(&d.tracking_number)).unwrap_or_default()
            }
            LedgerField::ShippingDueDate => product
                .shipping_due_date
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(10)
                .collect(),
            LedgerField::TrackingUrl => {
                let courier =
                    translate_courier(delivery.and_then(|d| d.delivery_company.as_deref()));
                let number = delivery
                    .and_then(|d| d.tracking_number.as_deref())
                    .unwrap_or_default();
                tracking_url(&courier, number)
            }
            LedgerField::CollectedAt => self.collected_at.to_string(),
            LedgerField::ReviewLabel => record
                .product_order_id()
                .map(|id| self.reviews.label_for(&clean_key_part(id)))
                .unwrap_or_default(),
            LedgerField::InflowPath => inflow_path(record),
        }
    }
}

fn status_label(product: &ProductOrder) -> String {
    translate_status(product.product_order_status.as_deref())
}

/// First inflow source that names a path: line item, then order, then the
/// record itself.
fn inflow_path(record: &OrderDetail) -> String {
    let candidates = [
        record
            .product_order
            .as_ref()
            .map(|p| (&p.inflow_path, &p.inflow_path_add)),
        record
            .order
            .as_ref()
            .map(|o| (&o.inflow_path, &o.inflow_path_add)),
        Some((&record.inflow_path, &record.inflow_path_add)),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|(path, _)| path.as_deref().is_some_and(|p| !p.trim().is_empty()))
        .map(|(path, add)| translate_inflow_path(path.as_deref(), add.as_deref()))
        .unwrap_or_default()
}

/// Settlement arithmetic for one line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Figures {
    quantity: i64,
    payment: i64,
    unit_real_price: i64,
    fee: i64,
    total_cost: i64,
    margin: i64,
}

impl Figures {
    fn compute(product: &ProductOrder, costs: &CostBook) -> Self {
        let quantity = product.quantity.unwrap_or(1);
        let payment = product.total_payment_amount.unwrap_or(0);
        let settlement = product.expected_settlement_amount.unwrap_or(0);
        let unit_cost = costs.unit_cost(&product.safe_product_id(), &product.option_or_dash());
        let total_cost = unit_cost.saturating_mul(quantity);
        Self {
            quantity,
            payment,
            unit_real_price: if quantity > 0 { payment / quantity } else { 0 },
            fee: payment.saturating_sub(settlement).saturating_abs(),
            total_cost,
            margin: settlement.saturating_sub(total_cost),
        }
    }
}
