use crate::{
    entities::{
        order::{ActiveModel as OrderActiveModel, DeliveryType, Model as OrderModel, OrderStatus},
        order_line_item::{ActiveModel as LineItemActiveModel, Model as LineItemModel},
    },
    errors::ServiceError,
    repositories::{OrderFilter, OrderRepository, ProductRepository},
};
use chrono::Utc;
use metrics::counter;
use rand::Rng;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use sea_orm::{DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

/// Attempts at allocating a unique order number before giving up with a conflict.
const MAX_ORDER_NUMBER_ATTEMPTS: usize = 5;
/// Attempts at a compare-and-set status write before reporting contention.
const MAX_STATUS_CAS_ATTEMPTS: usize = 3;
/// Largest quantity accepted on a single order line.
pub const MAX_LINE_QUANTITY: i32 = 10_000;

/// Which status changes `update_status` accepts.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum TransitionPolicy {
    /// Only the next step in the sequence, or cancellation.
    Strict,
    /// Any status, as long as the order is not terminal.
    Permissive,
}

/// Outcome of evaluating a requested transition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Order already has the requested status.
    Unchanged,
    Apply,
}

/// Decides whether `from -> to` is allowed under `policy`.
pub fn check_transition(
    policy: TransitionPolicy,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<Transition, ServiceError> {
    if from == to {
        return Ok(Transition::Unchanged);
    }
    if from.is_terminal() {
        return Err(ServiceError::InvalidStatus(format!(
            "Order is already {}; no further transitions are allowed",
            from
        )));
    }
    if to == OrderStatus::Cancelled {
        return Ok(Transition::Apply);
    }
    match policy {
        TransitionPolicy::Permissive => Ok(Transition::Apply),
        TransitionPolicy::Strict if from.successor() == Some(to) => Ok(Transition::Apply),
        TransitionPolicy::Strict => Err(ServiceError::InvalidStatus(format!(
            "Cannot move order from {} to {}",
            from, to
        ))),
    }
}

/// Discount and tax parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct PricingRules {
    pub tax_rate: Decimal,
    pub bulk_discount_rate: Decimal,
    /// Discount applies when the total quantity is strictly greater than this.
    pub bulk_discount_min_quantity: i32,
}

impl Default for PricingRules {
    fn default() -> Self {
        Self {
            tax_rate: dec!(0.19),
            bulk_discount_rate: dec!(0.05),
            bulk_discount_min_quantity: 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PriceBreakdown {
    /// Rounded `unit_price × quantity`, one per input line
    pub line_subtotals: Vec<Decimal>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

fn money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

fn amount_too_large() -> ServiceError {
    ServiceError::ValidationError("Order amount is too large".to_string())
}

/// Prices a set of `(unit_price, quantity)` lines. Amounts that do not fit
/// a `Decimal` are reported as a validation error.
pub fn price_lines(
    lines: &[(Decimal, i32)],
    rules: &PricingRules,
) -> Result<PriceBreakdown, ServiceError> {
    let mut line_subtotals = Vec::with_capacity(lines.len());
    let mut gross = Decimal::ZERO;
    for (price, qty) in lines {
        let line = price
            .checked_mul(Decimal::from(*qty))
            .ok_or_else(amount_too_large)?;
        gross = gross.checked_add(line).ok_or_else(amount_too_large)?;
        line_subtotals.push(money(line));
    }
    let subtotal = money(gross);
    let total_quantity: i64 = lines.iter().map(|(_, qty)| i64::from(*qty)).sum();

    let discount = if total_quantity > i64::from(rules.bulk_discount_min_quantity) {
        money(
            subtotal
                .checked_mul(rules.bulk_discount_rate)
                .ok_or_else(amount_too_large)?,
        )
    } else {
        Decimal::ZERO
    };
    let net = subtotal.checked_sub(discount).ok_or_else(amount_too_large)?;
    let tax = money(net.checked_mul(rules.tax_rate).ok_or_else(amount_too_large)?);
    let total = net.checked_add(tax).ok_or_else(amount_too_large)?;

    Ok(PriceBreakdown {
        line_subtotals,
        subtotal,
        discount,
        tax,
        total,
    })
}

/// Produces candidate order numbers.
pub type OrderNumberGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// `ORD-` followed by the last six digits of the millisecond clock and three random digits.
pub fn generate_order_number() -> String {
    let millis = Utc::now().timestamp_millis().rem_euclid(1_000_000);
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("ORD-{:06}{:03}", millis, suffix)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct LineItemRequest {
    pub product_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateOrderRequest {
    /// Defaults to the authenticated user
    #[serde(default)]
    pub customer_id: Option<i32>,
    #[serde(default)]
    pub seller_id: Option<i32>,
    pub branch_id: i32,
    pub line_items: Vec<LineItemRequest>,
    #[serde(default = "default_delivery_type")]
    pub delivery_type: DeliveryType,
    #[serde(default)]
    #[validate(length(max = 500, message = "must be at most 500 characters"))]
    pub delivery_address: Option<String>,
    #[serde(default)]
    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub notes: Option<String>,
}

fn default_delivery_type() -> DeliveryType {
    DeliveryType::Pickup
}

impl CreateOrderRequest {
    /// Field-level problems with the request, empty when valid.
    pub fn field_errors(&self) -> Vec<String> {
        let mut errors = match self.validate() {
            Ok(()) => Vec::new(),
            Err(e) => match ServiceError::from(e) {
                ServiceError::InvalidFields(fields) => fields,
                _ => Vec::new(),
            },
        };

        if self.line_items.is_empty() {
            errors.push("line_items: at least one line item is required".to_string());
        }
        for (idx, item) in self.line_items.iter().enumerate() {
            if item.quantity <= 0 {
                errors.push(format!("line_items[{}].quantity: must be greater than 0", idx));
            } else if item.quantity > MAX_LINE_QUANTITY {
                errors.push(format!(
                    "line_items[{}].quantity: must be at most {}",
                    idx, MAX_LINE_QUANTITY
                ));
            }
        }
        let address_missing = self
            .delivery_address
            .as_deref()
            .map(|a| a.trim().is_empty())
            .unwrap_or(true);
        if self.delivery_type == DeliveryType::HomeDelivery && address_missing {
            errors.push("delivery_address: required for home delivery".to_string());
        }
        errors
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
    #[serde(default)]
    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub notes: Option<String>,
}

/// An order together with its line items.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: OrderModel,
    pub line_items: Vec<LineItemModel>,
}

/// Order creation, lookup and the status state machine.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    orders: OrderRepository,
    products: ProductRepository,
    pricing: PricingRules,
    policy: TransitionPolicy,
    currency: String,
    order_numbers: OrderNumberGenerator,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            orders: OrderRepository::new(db.clone()),
            products: ProductRepository::new(db.clone()),
            db,
            pricing: PricingRules::default(),
            policy: TransitionPolicy::Strict,
            currency: "CLP".to_string(),
            order_numbers: Arc::new(generate_order_number),
        }
    }

    pub fn with_pricing(mut self, pricing: PricingRules) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_order_number_generator(mut self, generator: OrderNumberGenerator) -> Self {
        self.order_numbers = generator;
        self
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Creates a pending order, pricing every line from the catalog.
    #[instrument(skip(self, request), fields(customer_id = customer_id, branch_id = request.branch_id))]
    pub async fn create_order(
        &self,
        customer_id: i32,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let mut errors = request.field_errors();
        if !errors.is_empty() {
            return Err(ServiceError::InvalidFields(errors));
        }

        let product_ids: Vec<i32> = request.line_items.iter().map(|l| l.product_id).collect();
        let catalog: HashMap<i32, Decimal> = self
            .products
            .find_active_by_ids(&product_ids)
            .await?
            .into_iter()
            .map(|p| (p.id, p.price))
            .collect();

        let mut priced = Vec::with_capacity(request.line_items.len());
        for (idx, item) in request.line_items.iter().enumerate() {
            match catalog.get(&item.product_id) {
                Some(price) => priced.push((*price, item.quantity)),
                None => errors.push(format!(
                    "line_items[{}].product_id: product {} does not exist or is inactive",
                    idx, item.product_id
                )),
            }
        }
        if !errors.is_empty() {
            return Err(ServiceError::InvalidFields(errors));
        }

        let prices = price_lines(&priced, &self.pricing)?;

        for attempt in 1..=MAX_ORDER_NUMBER_ATTEMPTS {
            let order_number = (self.order_numbers)();
            let header = OrderActiveModel {
                order_number: Set(order_number.clone()),
                customer_id: Set(customer_id),
                seller_id: Set(request.seller_id),
                branch_id: Set(request.branch_id),
                status: Set(OrderStatus::Pending),
                delivery_type: Set(request.delivery_type),
                delivery_address: Set(request
                    .delivery_address
                    .clone()
                    .filter(|a| !a.trim().is_empty())),
                subtotal: Set(prices.subtotal),
                discount: Set(prices.discount),
                tax: Set(prices.tax),
                total: Set(prices.total),
                currency: Set(self.currency.clone()),
                notes: Set(request.notes.clone()),
                version: Set(1),
                ..Default::default()
            };
            let now = Utc::now();
            let items = request
                .line_items
                .iter()
                .zip(priced.iter())
                .zip(prices.line_subtotals.iter())
                .map(|((line, (unit_price, qty)), line_subtotal)| LineItemActiveModel {
                    product_id: Set(line.product_id),
                    quantity: Set(*qty),
                    unit_price: Set(*unit_price),
                    line_subtotal: Set(*line_subtotal),
                    created_at: Set(now),
                    ..Default::default()
                })
                .collect();

            match self.orders.insert_with_items(header, items).await {
                Ok((order, line_items)) => {
                    counter!("ferremas_orders_created_total", 1);
                    info!(
                        order_id = order.id,
                        order_number = %order.order_number,
                        total = %order.total,
                        "Order created"
                    );
                    return Ok(OrderResponse { order, line_items });
                }
                Err(ServiceError::Conflict(detail)) => {
                    warn!(
                        attempt,
                        order_number = %order_number,
                        detail = %detail,
                        "Order number collision, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(ServiceError::Conflict(
            "Could not allocate a unique order number, please retry".to_string(),
        ))
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: i32) -> Result<OrderResponse, ServiceError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.with_line_items(order).await
    }

    #[instrument(skip(self))]
    pub async fn get_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let order = self
            .orders
            .find_by_number(order_number)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_number)))?;
        self.with_line_items(order).await
    }

    /// Order header without line items.
    pub async fn find_order(&self, order_id: i32) -> Result<Option<OrderModel>, ServiceError> {
        self.orders.find_by_id(order_id).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<OrderModel>, u64), ServiceError> {
        self.orders.list(filter, offset, limit).await
    }

    /// Moves an order to `new_status` under the configured policy.
    #[instrument(skip(self, notes), fields(order_id = order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: i32,
        new_status: &str,
        notes: Option<String>,
    ) -> Result<OrderResponse, ServiceError> {
        let target = OrderStatus::from_str(new_status.trim()).map_err(|_| {
            ServiceError::InvalidStatus(format!("Unknown order status '{}'", new_status))
        })?;
        let order = self.transition(order_id, target, notes, None).await?;
        self.with_line_items(order).await
    }

    /// Advances a pending order to approved once its payment clears.
    /// Orders that have already moved past pending are left alone.
    #[instrument(skip(self))]
    pub async fn approve_after_payment(&self, order_id: i32) -> Result<OrderModel, ServiceError> {
        self.transition(
            order_id,
            OrderStatus::Approved,
            None,
            Some(OrderStatus::Pending),
        )
        .await
    }

    async fn transition(
        &self,
        order_id: i32,
        target: OrderStatus,
        notes: Option<String>,
        required_from: Option<OrderStatus>,
    ) -> Result<OrderModel, ServiceError> {
        let notes = notes.filter(|n| !n.trim().is_empty());

        for attempt in 1..=MAX_STATUS_CAS_ATTEMPTS {
            let txn = self.db.begin().await?;

            let current = OrderRepository::find_by_id_in(&txn, order_id)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

            if let Some(required) = required_from {
                if current.status != required && current.status != target {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Order is {}, expected {}",
                        current.status, required
                    )));
                }
            }

            if check_transition(self.policy, current.status, target)? == Transition::Unchanged {
                txn.commit().await?;
                return Ok(current);
            }

            let now = Utc::now();
            let mut changes = OrderActiveModel {
                status: Set(target),
                updated_at: Set(now),
                version: Set(current.version + 1),
                ..Default::default()
            };
            if target == OrderStatus::Approved && current.approved_at.is_none() {
                changes.approved_at = Set(Some(now));
            }
            if target == OrderStatus::Delivered && current.delivered_at.is_none() {
                changes.delivered_at = Set(Some(now));
            }
            if let Some(extra) = &notes {
                changes.notes = Set(Some(match &current.notes {
                    Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, extra),
                    _ => extra.clone(),
                }));
            }

            if OrderRepository::compare_and_set(&txn, order_id, current.version, changes).await? {
                let updated = OrderRepository::find_by_id_in(&txn, order_id)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!("Order {} not found", order_id))
                    })?;
                txn.commit().await?;
                info!(
                    order_id,
                    from = %current.status,
                    to = %target,
                    "Order status updated"
                );
                return Ok(updated);
            }

            txn.rollback().await?;
            warn!(order_id, attempt, "Order changed concurrently, re-evaluating transition");
        }

        Err(ServiceError::ConcurrentModification(order_id))
    }

    async fn with_line_items(&self, order: OrderModel) -> Result<OrderResponse, ServiceError> {
        let line_items = self.orders.line_items(order.id).await?;
        Ok(OrderResponse { order, line_items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[test]
    fn five_units_get_bulk_discount() {
        let prices = price_lines(&[(dec!(10000), 5)], &PricingRules::default()).unwrap();
        assert_eq!(prices.subtotal, dec!(50000));
        assert_eq!(prices.discount, dec!(2500));
        assert_eq!(prices.tax, dec!(9025));
        assert_eq!(prices.total, dec!(56525));
    }

    #[test]
    fn four_units_pay_full_price() {
        let prices = price_lines(
            &[(dec!(1990), 3), (dec!(5000), 1)],
            &PricingRules::default(),
        )
        .unwrap();
        assert_eq!(prices.subtotal, dec!(10970));
        assert_eq!(prices.discount, Decimal::ZERO);
        assert_eq!(prices.tax, dec!(2084.30));
        assert_eq!(prices.total, dec!(13054.30));
    }

    #[test]
    fn fractional_amounts_round_half_away_from_zero() {
        let prices = price_lines(&[(dec!(0.05), 1)], &PricingRules::default()).unwrap();
        // 0.05 * 0.19 = 0.0095
        assert_eq!(prices.tax, dec!(0.01));
        assert_eq!(prices.total, dec!(0.06));
    }

    #[test]
    fn overflowing_amounts_are_rejected() {
        let rules = PricingRules::default();
        assert_matches!(
            price_lines(&[(Decimal::MAX / dec!(10), 100)], &rules),
            Err(ServiceError::ValidationError(_))
        );
        assert_matches!(
            price_lines(&[(Decimal::MAX, 1), (Decimal::MAX, 1)], &rules),
            Err(ServiceError::ValidationError(_))
        );
    }

    #[test]
    fn line_subtotals_follow_input_order() {
        let prices = price_lines(
            &[(dec!(1990), 3), (dec!(5000), 1)],
            &PricingRules::default(),
        )
        .unwrap();
        assert_eq!(prices.line_subtotals, vec![dec!(5970), dec!(5000)]);
    }

    #[test]
    fn oversized_quantities_are_field_errors() {
        let request = CreateOrderRequest {
            customer_id: None,
            seller_id: None,
            branch_id: 1,
            line_items: vec![LineItemRequest {
                product_id: 1,
                quantity: i32::MAX,
            }],
            delivery_type: DeliveryType::Pickup,
            delivery_address: None,
            notes: None,
        };
        assert_eq!(
            request.field_errors(),
            vec![format!("line_items[0].quantity: must be at most {}", MAX_LINE_QUANTITY)]
        );
    }

    #[test]
    fn order_numbers_have_expected_shape() {
        let number = generate_order_number();
        assert!(number.starts_with("ORD-"));
        assert_eq!(number.len(), 13);
        assert!(number[4..].chars().all(|c| c.is_ascii_digit()));
    }

    #[rstest]
    #[case(OrderStatus::Pending, OrderStatus::Approved)]
    #[case(OrderStatus::Approved, OrderStatus::Preparing)]
    #[case(OrderStatus::Preparing, OrderStatus::Ready)]
    #[case(OrderStatus::Ready, OrderStatus::Delivered)]
    #[case(OrderStatus::Pending, OrderStatus::Cancelled)]
    #[case(OrderStatus::Ready, OrderStatus::Cancelled)]
    fn strict_allows_forward_steps_and_cancellation(
        #[case] from: OrderStatus,
        #[case] to: OrderStatus,
    ) {
        assert_eq!(
            check_transition(TransitionPolicy::Strict, from, to).unwrap(),
            Transition::Apply
        );
    }

    #[rstest]
    #[case(OrderStatus::Pending, OrderStatus::Delivered)]
    #[case(OrderStatus::Approved, OrderStatus::Pending)]
    #[case(OrderStatus::Ready, OrderStatus::Preparing)]
    fn strict_rejects_skips_and_regressions(#[case] from: OrderStatus, #[case] to: OrderStatus) {
        assert_matches!(
            check_transition(TransitionPolicy::Strict, from, to),
            Err(ServiceError::InvalidStatus(_))
        );
    }

    #[rstest]
    #[case(TransitionPolicy::Strict)]
    #[case(TransitionPolicy::Permissive)]
    fn terminal_states_are_final(#[case] policy: TransitionPolicy) {
        for from in [OrderStatus::Delivered, OrderStatus::Cancelled] {
            for to in [OrderStatus::Pending, OrderStatus::Approved, OrderStatus::Ready] {
                assert_matches!(
                    check_transition(policy, from, to),
                    Err(ServiceError::InvalidStatus(_))
                );
            }
        }
        assert_matches!(
            check_transition(policy, OrderStatus::Delivered, OrderStatus::Cancelled),
            Err(ServiceError::InvalidStatus(_))
        );
    }

    #[test]
    fn same_status_is_unchanged_even_when_terminal() {
        assert_eq!(
            check_transition(
                TransitionPolicy::Strict,
                OrderStatus::Delivered,
                OrderStatus::Delivered
            )
            .unwrap(),
            Transition::Unchanged
        );
    }

    #[test]
    fn permissive_allows_skipping_ahead() {
        assert_eq!(
            check_transition(
                TransitionPolicy::Permissive,
                OrderStatus::Pending,
                OrderStatus::Delivered
            )
            .unwrap(),
            Transition::Apply
        );
    }

    #[test]
    fn home_delivery_requires_address() {
        let request = CreateOrderRequest {
            customer_id: None,
            seller_id: None,
            branch_id: 1,
            line_items: vec![LineItemRequest {
                product_id: 1,
                quantity: 0,
            }],
            delivery_type: DeliveryType::HomeDelivery,
            delivery_address: Some("   ".into()),
            notes: None,
        };
        assert_eq!(
            request.field_errors(),
            vec![
                "line_items[0].quantity: must be greater than 0".to_string(),
                "delivery_address: required for home delivery".to_string(),
            ]
        );
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!(
            TransitionPolicy::from_str("Strict").unwrap(),
            TransitionPolicy::Strict
        );
        assert_eq!(
            TransitionPolicy::from_str("permissive").unwrap(),
            TransitionPolicy::Permissive
        );
        assert!(TransitionPolicy::from_str("lenient").is_err());
    }
}
