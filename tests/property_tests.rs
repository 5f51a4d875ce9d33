//! Property-based tests for pricing, the order state machine and
//! payment reconciliation.

use chrono::{TimeZone, Utc};
use ferremas_api::entities::order::OrderStatus;
use ferremas_api::entities::payment::PaymentStatus;
use ferremas_api::services::orders::{
    check_transition, generate_order_number, price_lines, PricingRules, Transition,
    TransitionPolicy,
};
use ferremas_api::services::payments::{decide, normalize_notification, Decision};
use proptest::prelude::*;
use rust_decimal::Decimal;
use std::collections::HashMap;

// Prices from 1.00 to 9 999 999.99
fn price_strategy() -> impl Strategy<Value = Decimal> {
    (100i64..1_000_000_000).prop_map(|cents| Decimal::new(cents, 2))
}

fn lines_strategy() -> impl Strategy<Value = Vec<(Decimal, i32)>> {
    prop::collection::vec((price_strategy(), 1i32..50), 1..8)
}

fn order_status_strategy() -> impl Strategy<Value = OrderStatus> {
    prop_oneof![
        Just(OrderStatus::Pending),
        Just(OrderStatus::Approved),
        Just(OrderStatus::Preparing),
        Just(OrderStatus::Ready),
        Just(OrderStatus::Delivered),
        Just(OrderStatus::Cancelled),
    ]
}

fn payment_status_strategy() -> impl Strategy<Value = PaymentStatus> {
    prop_oneof![
        Just(PaymentStatus::Pending),
        Just(PaymentStatus::Approved),
        Just(PaymentStatus::Rejected),
    ]
}

fn timestamp_strategy() -> impl Strategy<Value = Option<chrono::DateTime<Utc>>> {
    prop::option::of((1_600_000_000i64..1_800_000_000).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn totals_always_add_up(lines in lines_strategy()) {
        let prices = price_lines(&lines, &PricingRules::default()).expect("realistic prices fit");
        prop_assert_eq!(prices.total, prices.subtotal - prices.discount + prices.tax);
        prop_assert!(prices.discount >= Decimal::ZERO);
        prop_assert!(prices.discount < prices.subtotal);
        prop_assert!(prices.tax >= Decimal::ZERO);
    }

    #[test]
    fn discount_applies_only_above_four_units(lines in lines_strategy()) {
        let quantity: i32 = lines.iter().map(|(_, q)| *q).sum();
        let prices = price_lines(&lines, &PricingRules::default()).expect("realistic prices fit");
        prop_assert_eq!(prices.discount > Decimal::ZERO, quantity > 4);
    }

    #[test]
    fn amounts_have_at_most_two_decimals(lines in lines_strategy()) {
        let prices = price_lines(&lines, &PricingRules::default()).expect("realistic prices fit");
        for amount in [prices.subtotal, prices.discount, prices.tax, prices.total] {
            prop_assert!(amount.scale() <= 2, "too many decimals: {}", amount);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn repeating_a_status_is_always_a_no_op(
        status in order_status_strategy(),
        strict in any::<bool>(),
    ) {
        let policy = if strict { TransitionPolicy::Strict } else { TransitionPolicy::Permissive };
        prop_assert_eq!(check_transition(policy, status, status).ok(), Some(Transition::Unchanged));
    }

    #[test]
    fn terminal_orders_never_move(
        from in prop_oneof![Just(OrderStatus::Delivered), Just(OrderStatus::Cancelled)],
        to in order_status_strategy(),
    ) {
        prop_assume!(from != to);
        prop_assert!(check_transition(TransitionPolicy::Permissive, from, to).is_err());
    }

    #[test]
    fn strict_policy_only_allows_next_step_or_cancel(
        from in order_status_strategy(),
        to in order_status_strategy(),
    ) {
        prop_assume!(from != to && !from.is_terminal());
        let allowed = check_transition(TransitionPolicy::Strict, from, to).is_ok();
        prop_assert_eq!(allowed, to == OrderStatus::Cancelled || from.successor() == Some(to));
    }

    #[test]
    fn approved_payments_are_sticky(
        incoming in payment_status_strategy(),
        stored_at in timestamp_strategy(),
        received_at in timestamp_strategy(),
    ) {
        let decision = decide(PaymentStatus::Approved, stored_at, incoming, received_at);
        prop_assert_ne!(decision, Decision::Apply);
    }

    #[test]
    fn approval_always_applies_over_other_states(
        current in prop_oneof![Just(PaymentStatus::Pending), Just(PaymentStatus::Rejected)],
        stored_at in timestamp_strategy(),
        received_at in timestamp_strategy(),
    ) {
        prop_assert_eq!(
            decide(current, stored_at, PaymentStatus::Approved, received_at),
            Decision::Apply
        );
    }

    #[test]
    fn arbitrary_notification_bodies_normalize(
        event_type in prop::option::of("[a-z._]{1,20}"),
        id in "[0-9A-Za-z-]{0,12}",
    ) {
        let mut body = serde_json::json!({ "data": { "id": id } });
        if let Some(event_type) = &event_type {
            body["type"] = serde_json::Value::String(event_type.clone());
        }
        let envelope = normalize_notification(&HashMap::new(), &body);
        prop_assert_eq!(envelope.event_type, event_type);
    }
}

#[test]
fn order_numbers_have_the_expected_shape() {
    for _ in 0..100 {
        let number = generate_order_number();
        assert!(number.starts_with("ORD-"), "{number}");
        assert_eq!(number.len(), 13, "{number}");
        assert!(number[4..].chars().all(|c| c.is_ascii_digit()), "{number}");
    }
}
