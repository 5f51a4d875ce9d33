use crate::{
    entities::{
        gateway_notification::NotificationOutcome,
        order::{Model as OrderModel, OrderStatus},
        payment::{
            ActiveModel as PaymentActiveModel, Model as PaymentModel, PaymentMethod,
            PaymentStatus,
        },
    },
    errors::ServiceError,
    gateway::{BackUrls, GatewayPayment, PaymentGateway, PreferenceItem, PreferenceRequest},
    repositories::{NotificationRecord, NotificationRepository, PaymentFilter, PaymentRepository},
    services::orders::OrderService,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, Set};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

type HmacSha256 = Hmac<Sha256>;

/// Attempts at a compare-and-set payment write before reporting contention.
const MAX_PAYMENT_CAS_ATTEMPTS: usize = 3;

/// Maps a raw gateway status onto the local payment status.
pub fn map_gateway_status(status: &str) -> PaymentStatus {
    match status.trim().to_ascii_lowercase().as_str() {
        "approved" => PaymentStatus::Approved,
        "rejected" | "cancelled" | "refunded" | "charged_back" => PaymentStatus::Rejected,
        _ => PaymentStatus::Pending,
    }
}

/// Result of comparing an incoming gateway status with the stored one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Apply,
    /// Approved payments never move back.
    RefusedDowngrade,
    /// The stored gateway record is at least as recent as the incoming one.
    Stale,
    Unchanged,
}

/// Decides whether an incoming gateway status should overwrite the stored one.
pub fn decide(
    current: PaymentStatus,
    current_updated_at: Option<DateTime<Utc>>,
    incoming: PaymentStatus,
    incoming_updated_at: Option<DateTime<Utc>>,
) -> Decision {
    if current == PaymentStatus::Approved && incoming != PaymentStatus::Approved {
        return Decision::RefusedDowngrade;
    }
    if incoming == PaymentStatus::Approved && current != PaymentStatus::Approved {
        return Decision::Apply;
    }
    if let (Some(stored), Some(received)) = (current_updated_at, incoming_updated_at) {
        if stored >= received {
            return Decision::Stale;
        }
    }
    if current == incoming {
        return Decision::Unchanged;
    }
    Decision::Apply
}

/// A gateway notification reduced to its event type and data.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEnvelope {
    pub event_type: Option<String>,
    pub data: Value,
}

impl NotificationEnvelope {
    /// Id of the resource the event refers to, from `data.id`.
    pub fn resource_id(&self) -> Option<String> {
        match self.data.get("id")? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Accepts the three shapes MercadoPago uses to deliver notifications:
/// `type`/`data` in the body, `type`/`topic` in the query string,
/// or `action`/`data` in the body.
pub fn normalize_notification(query: &HashMap<String, String>, body: &Value) -> NotificationEnvelope {
    let body_str = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);

    if let (Some(event_type), Some(data)) = (body_str("type"), body.get("data")) {
        return NotificationEnvelope {
            event_type: Some(event_type),
            data: data.clone(),
        };
    }

    if let Some(event_type) = query.get("type").or_else(|| query.get("topic")) {
        let id = ["data.id", "data_id", "id"]
            .iter()
            .find_map(|key| query.get(*key).filter(|v| !v.trim().is_empty()));
        let data = match (id, query.get("data")) {
            (Some(id), _) => json!({ "id": id }),
            (None, Some(raw)) => {
                serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.clone()))
            }
            (None, None) => Value::Null,
        };
        return NotificationEnvelope {
            event_type: Some(event_type.clone()),
            data,
        };
    }

    if let (Some(action), Some(data)) = (body_str("action"), body.get("data")) {
        return NotificationEnvelope {
            event_type: Some(action),
            data: data.clone(),
        };
    }

    NotificationEnvelope {
        event_type: None,
        data: body.get("data").cloned().unwrap_or(Value::Null),
    }
}

/// Checks an `x-signature: ts=...,v1=...` header against
/// `id:<data.id>;request-id:<x-request-id>;ts:<ts>;`.
pub fn verify_signature(
    secret: &str,
    signature: Option<&str>,
    request_id: Option<&str>,
    data_id: &str,
) -> bool {
    let Some(signature) = signature else {
        return false;
    };
    let mut ts = "";
    let mut v1 = "";
    for part in signature.split(',') {
        match part.trim().split_once('=') {
            Some(("ts", value)) => ts = value.trim(),
            Some(("v1", value)) => v1 = value.trim(),
            _ => {}
        }
    }
    if ts.is_empty() || v1.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(v1) else {
        return false;
    };

    let manifest = format!(
        "id:{};request-id:{};ts:{};",
        data_id,
        request_id.unwrap_or_default(),
        ts
    );
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(manifest.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// Headers relevant to notification authenticity.
#[derive(Debug, Clone, Default)]
pub struct NotificationHeaders {
    pub signature: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ReceivedNotification {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    #[schema(value_type = Object)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement returned to the gateway for every notification.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NotificationAck {
    pub success: bool,
    pub message: String,
    pub received: ReceivedNotification,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckoutRequest {
    pub order_id: i32,
}

/// A payment taken at a branch: card terminal or bank transfer.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ManualPaymentRequest {
    pub order_id: i32,
    /// `debit`, `credit` or `bank_transfer`
    pub method: PaymentMethod,
    /// Defaults to the order total
    #[serde(default)]
    pub amount: Option<Decimal>,
    /// Voucher or transfer number
    #[serde(default)]
    #[validate(length(max = 128, message = "must be at most 128 characters"))]
    pub reference: Option<String>,
    #[serde(default)]
    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ConfirmPaymentRequest {
    /// `approved` or `rejected`
    pub status: String,
    #[serde(default)]
    #[validate(length(max = 1000, message = "must be at most 1000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub payment_id: i32,
    pub redirect_url: String,
    /// True when an existing pending payment was returned
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentVerification {
    pub payment_id: i32,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub currency: String,
    pub method: PaymentMethod,
    pub order_id: i32,
    pub order_number: String,
    pub order_status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub external_ref: Option<String>,
    pub internal_ref: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentMethodInfo {
    pub method: PaymentMethod,
    pub name: String,
    pub description: String,
    pub fees: String,
}

/// Where the gateway sends the buyer (and its notifications) after checkout.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub back_urls: BackUrls,
    pub notification_url: Option<String>,
    /// Redirect to `sandbox_init_point` instead of `init_point`
    pub sandbox: bool,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            back_urls: BackUrls {
                success: "http://localhost:3000/payment/success".to_string(),
                failure: "http://localhost:3000/payment/failure".to_string(),
                pending: "http://localhost:3000/payment/pending".to_string(),
            },
            notification_url: None,
            sandbox: false,
        }
    }
}

#[derive(Debug)]
struct Reconciled {
    outcome: NotificationOutcome,
    detail: Option<String>,
    payment_id: Option<i32>,
}

impl Reconciled {
    fn new(outcome: NotificationOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: Some(detail.into()),
            payment_id: None,
        }
    }

    fn for_payment(mut self, payment_id: i32) -> Self {
        self.payment_id = Some(payment_id);
        self
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Gateway checkout, branch payments and reconciliation of gateway notifications.
#[derive(Clone)]
pub struct PaymentService {
    payments: PaymentRepository,
    notifications: NotificationRepository,
    orders: OrderService,
    gateway: Option<Arc<dyn PaymentGateway>>,
    checkout: CheckoutSettings,
    webhook_secret: Option<String>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: OrderService,
        gateway: Option<Arc<dyn PaymentGateway>>,
    ) -> Self {
        Self {
            payments: PaymentRepository::new(db.clone()),
            notifications: NotificationRepository::new(db),
            orders,
            gateway,
            checkout: CheckoutSettings::default(),
            webhook_secret: None,
        }
    }

    pub fn with_checkout(mut self, checkout: CheckoutSettings) -> Self {
        self.checkout = checkout;
        self
    }

    /// Notifications must carry a valid `x-signature` once a secret is set.
    pub fn with_webhook_secret(mut self, secret: Option<String>) -> Self {
        self.webhook_secret = secret.filter(|s| !s.trim().is_empty());
        self
    }

    fn gateway(&self) -> Result<&Arc<dyn PaymentGateway>, ServiceError> {
        self.gateway.as_ref().ok_or_else(|| {
            ServiceError::ExternalServiceError("payment gateway is not configured".to_string())
        })
    }

    /// The order, provided it exists, is not terminal and has no approved payment.
    async fn payable_order(&self, order_id: i32) -> Result<OrderModel, ServiceError> {
        let order = self
            .orders
            .find_order(order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.status.is_terminal() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is {} and cannot be paid",
                order.order_number, order.status
            )));
        }
        if self
            .payments
            .latest_for_order_with_status(order.id, PaymentStatus::Approved, None)
            .await?
            .is_some()
        {
            return Err(ServiceError::InvalidStatus(format!(
                "Order {} is already paid",
                order.order_number
            )));
        }
        Ok(order)
    }

    /// Starts (or resumes) a gateway checkout for an order.
    #[instrument(skip(self))]
    pub async fn initiate_checkout(&self, order_id: i32) -> Result<CheckoutResponse, ServiceError> {
        let order = self.payable_order(order_id).await?;

        let existing = self
            .payments
            .latest_for_order_with_status(
                order.id,
                PaymentStatus::Pending,
                Some(PaymentMethod::GatewayCheckout),
            )
            .await?;
        if let Some(payment) = &existing {
            if let (Some(_), Some(redirect_url)) = (&payment.external_ref, &payment.redirect_url) {
                info!(payment_id = payment.id, "Reusing pending checkout");
                return Ok(CheckoutResponse {
                    payment_id: payment.id,
                    redirect_url: redirect_url.clone(),
                    reused: true,
                });
            }
        }

        let gateway = self.gateway()?.clone();
        let reused = existing.is_some();
        let payment = match existing {
            Some(payment) => payment,
            None => {
                let payment = self
                    .payments
                    .insert(PaymentActiveModel {
                        order_id: Set(order.id),
                        method: Set(PaymentMethod::GatewayCheckout),
                        status: Set(PaymentStatus::Pending),
                        amount: Set(order.total),
                        currency: Set(order.currency.clone()),
                        internal_ref: Set(format!("PAY-{}", Uuid::new_v4())),
                        version: Set(1),
                        ..Default::default()
                    })
                    .await?;
                info!(payment_id = payment.id, internal_ref = %payment.internal_ref, "Payment created");
                payment
            }
        };

        let preference = gateway
            .create_preference(&self.preference_for(&order, &payment))
            .await
            .map_err(|e| {
                warn!(payment_id = payment.id, error = %e, "Checkout preference request failed");
                ServiceError::from(e)
            })?;

        let redirect_url = match (&preference.sandbox_init_point, self.checkout.sandbox) {
            (Some(sandbox), true) => sandbox.clone(),
            _ => preference.init_point.clone(),
        };

        let mut current = payment;
        for attempt in 1..=MAX_PAYMENT_CAS_ATTEMPTS {
            let changes = PaymentActiveModel {
                external_ref: Set(Some(preference.id.clone())),
                redirect_url: Set(Some(redirect_url.clone())),
                updated_at: Set(Utc::now()),
                version: Set(current.version + 1),
                ..Default::default()
            };
            if self
                .payments
                .compare_and_set(current.id, current.version, changes)
                .await?
            {
                info!(payment_id = current.id, preference_id = %preference.id, "Checkout ready");
                return Ok(CheckoutResponse {
                    payment_id: current.id,
                    redirect_url,
                    reused,
                });
            }
            warn!(payment_id = current.id, attempt, "Payment changed concurrently during checkout");
            current = self.require_payment(current.id).await?;
        }

        Err(ServiceError::ConcurrentModification(current.id))
    }

    fn preference_for(&self, order: &OrderModel, payment: &PaymentModel) -> PreferenceRequest {
        PreferenceRequest {
            items: vec![PreferenceItem {
                title: format!("Order {}", order.order_number),
                quantity: 1,
                unit_price: payment.amount,
                currency_id: payment.currency.clone(),
            }],
            external_reference: payment.internal_ref.clone(),
            back_urls: self.checkout.back_urls.clone(),
            auto_return: "approved".to_string(),
            notification_url: self.checkout.notification_url.clone(),
        }
    }

    /// Processes a gateway notification. Never fails: every outcome,
    /// errors included, is recorded and acknowledged.
    #[instrument(skip_all)]
    pub async fn handle_notification(
        &self,
        query: &HashMap<String, String>,
        headers: &NotificationHeaders,
        body: &[u8],
    ) -> NotificationAck {
        let parsed: Value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(body).unwrap_or_else(|e| {
                warn!(error = %e, "Notification body is not valid JSON");
                Value::Null
            })
        };
        let envelope = normalize_notification(query, &parsed);
        let resource_id = envelope.resource_id();

        let result = match self
            .process_notification(&envelope, resource_id.as_deref(), headers)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(
                    target: "dead_letter",
                    event_type = ?envelope.event_type,
                    resource_id = ?resource_id,
                    error = %e,
                    "Gateway notification failed"
                );
                Reconciled::new(NotificationOutcome::Failed, e.to_string())
            }
        };

        counter!("ferremas_webhook_events_total", 1, "outcome" => result.outcome.to_string());

        let payload = if body.is_empty() {
            serde_json::to_string(query).unwrap_or_default()
        } else {
            String::from_utf8_lossy(body).into_owned()
        };
        let record = NotificationRecord {
            event_type: envelope.event_type.clone(),
            resource_id: resource_id.clone(),
            payload,
            outcome: result.outcome,
            detail: result.detail,
            payment_id: result.payment_id,
        };
        if let Err(e) = self.notifications.record(record).await {
            error!(
                target: "dead_letter",
                resource_id = ?resource_id,
                error = %e,
                "Could not record gateway notification"
            );
        }

        NotificationAck {
            success: true,
            message: "Notification received".to_string(),
            received: ReceivedNotification {
                event_type: envelope.event_type,
                data: envelope.data,
                timestamp: Utc::now(),
            },
        }
    }

    async fn process_notification(
        &self,
        envelope: &NotificationEnvelope,
        resource_id: Option<&str>,
        headers: &NotificationHeaders,
    ) -> Result<Reconciled, ServiceError> {
        if let Some(secret) = &self.webhook_secret {
            if !verify_signature(
                secret,
                headers.signature.as_deref(),
                headers.request_id.as_deref(),
                resource_id.unwrap_or_default(),
            ) {
                warn!(resource_id = ?resource_id, "Rejected notification with invalid signature");
                return Ok(Reconciled::new(
                    NotificationOutcome::RejectedSignature,
                    "missing or invalid x-signature",
                ));
            }
        }

        let event_type = envelope.event_type.as_deref().unwrap_or_default();
        if !matches!(event_type, "payment" | "payment.updated") {
            info!(event_type, "Ignoring notification");
            return Ok(Reconciled::new(
                NotificationOutcome::Ignored,
                format!("unhandled event type '{}'", event_type),
            ));
        }
        let Some(gateway_payment_id) = resource_id else {
            warn!(event_type, "Payment notification without an id");
            return Ok(Reconciled::new(NotificationOutcome::Ignored, "missing data.id"));
        };

        let remote = self.gateway()?.get_payment(gateway_payment_id).await?;
        let Some(local) = self.match_payment(&remote).await? else {
            warn!(
                gateway_payment_id,
                external_reference = ?remote.external_reference,
                "No local payment matches gateway payment"
            );
            return Ok(Reconciled::new(
                NotificationOutcome::Unmatched,
                format!("no local payment for gateway payment {}", gateway_payment_id),
            ));
        };

        self.reconcile(local, &remote).await
    }

    async fn match_payment(
        &self,
        remote: &GatewayPayment,
    ) -> Result<Option<PaymentModel>, ServiceError> {
        if let Some(found) = self.payments.find_by_gateway_payment_id(&remote.id).await? {
            return Ok(Some(found));
        }
        if let Some(reference) = remote.external_reference.as_deref() {
            if let Some(found) = self.payments.find_by_internal_ref(reference).await? {
                return Ok(Some(found));
            }
        }
        self.payments.find_by_external_ref_containing(&remote.id).await
    }

    /// Applies the authoritative gateway record to a local payment.
    #[instrument(skip(self, local, remote), fields(payment_id = local.id, gateway_payment_id = %remote.id))]
    async fn reconcile(
        &self,
        local: PaymentModel,
        remote: &GatewayPayment,
    ) -> Result<Reconciled, ServiceError> {
        let incoming = map_gateway_status(&remote.status);

        if let Some(amount) = remote.transaction_amount {
            if amount != local.amount {
                warn!(
                    expected = %local.amount,
                    received = %amount,
                    "Gateway amount differs from payment amount"
                );
            }
        }

        let mut current = local;
        for attempt in 1..=MAX_PAYMENT_CAS_ATTEMPTS {
            let decision = decide(
                current.status,
                current.gateway_updated_at,
                incoming,
                remote.date_last_updated,
            );
            if decision != Decision::Apply {
                info!(%decision, status = %current.status, incoming = %incoming, "Payment left as is");
                if current.status == PaymentStatus::Approved {
                    // An earlier delivery may have approved the payment but failed to move the order.
                    self.ensure_order_follows(current.order_id).await?;
                }
                return Ok(
                    Reconciled::new(NotificationOutcome::Unchanged, decision.to_string())
                        .for_payment(current.id),
                );
            }

            let now = Utc::now();
            let mut changes = PaymentActiveModel {
                status: Set(incoming),
                gateway_payment_id: Set(Some(remote.id.clone())),
                gateway_status: Set(Some(remote.status.clone())),
                gateway_updated_at: Set(remote.date_last_updated.or(current.gateway_updated_at)),
                updated_at: Set(now),
                version: Set(current.version + 1),
                ..Default::default()
            };
            if incoming == PaymentStatus::Approved && current.approved_at.is_none() {
                changes.approved_at = Set(Some(remote.date_approved.unwrap_or(now)));
            }

            if self
                .payments
                .compare_and_set(current.id, current.version, changes)
                .await?
            {
                info!(from = %current.status, to = %incoming, "Payment reconciled");
                if incoming == PaymentStatus::Approved {
                    self.advance_order(current.order_id).await?;
                }
                return Ok(Reconciled::new(
                    NotificationOutcome::Processed,
                    format!("{} -> {}", current.status, incoming),
                )
                .for_payment(current.id));
            }

            warn!(attempt, "Payment changed concurrently, re-evaluating");
            current = self.require_payment(current.id).await?;
        }

        Err(ServiceError::ConcurrentModification(current.id))
    }

    /// Advances the order of an approved payment if it is still pending.
    async fn ensure_order_follows(&self, order_id: i32) -> Result<(), ServiceError> {
        match self.orders.find_order(order_id).await? {
            Some(order) if order.status == OrderStatus::Pending => {
                info!(order_id, "Advancing order left pending behind an approved payment");
                self.advance_order(order_id).await
            }
            _ => Ok(()),
        }
    }

    async fn advance_order(&self, order_id: i32) -> Result<(), ServiceError> {
        match self.orders.approve_after_payment(order_id).await {
            Ok(_) => Ok(()),
            Err(ServiceError::InvalidStatus(reason)) => {
                warn!(order_id, %reason, "Order not advanced after payment approval");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Records a pending branch payment for an accountant to confirm.
    #[instrument(skip(self, request), fields(order_id = request.order_id, method = %request.method))]
    pub async fn register_manual_payment(
        &self,
        request: ManualPaymentRequest,
    ) -> Result<PaymentModel, ServiceError> {
        request.validate()?;
        if request.method == PaymentMethod::GatewayCheckout {
            return Err(ServiceError::InvalidFields(vec![
                "method: gateway payments are started through checkout".to_string(),
            ]));
        }
        let order = self.payable_order(request.order_id).await?;

        let amount = request.amount.unwrap_or(order.total).round_dp(2);
        if amount <= Decimal::ZERO || amount > order.total {
            return Err(ServiceError::InvalidFields(vec![format!(
                "amount: must be greater than 0 and at most the order total {}",
                order.total
            )]));
        }
        if amount != order.total {
            warn!(expected = %order.total, received = %amount, "Partial branch payment registered");
        }

        let payment = self
            .payments
            .insert(PaymentActiveModel {
                order_id: Set(order.id),
                method: Set(request.method),
                status: Set(PaymentStatus::Pending),
                amount: Set(amount),
                currency: Set(order.currency.clone()),
                external_ref: Set(non_blank(request.reference)),
                internal_ref: Set(format!("PAY-{}", Uuid::new_v4())),
                notes: Set(non_blank(request.notes)),
                version: Set(1),
                ..Default::default()
            })
            .await?;

        info!(payment_id = payment.id, "Branch payment registered");
        Ok(payment)
    }

    /// Branch payments still waiting for confirmation, oldest first.
    #[instrument(skip(self))]
    pub async fn pending_confirmation(
        &self,
        method: Option<PaymentMethod>,
    ) -> Result<Vec<PaymentModel>, ServiceError> {
        if method == Some(PaymentMethod::GatewayCheckout) {
            return Err(ServiceError::ValidationError(
                "gateway payments are confirmed by the gateway".to_string(),
            ));
        }
        self.payments.pending_confirmation(method).await
    }

    /// Approves or rejects a pending branch payment. Approval advances the
    /// order like a gateway approval does; repeating the same decision is a no-op.
    #[instrument(skip(self, request), fields(payment_id = payment_id, status = %request.status))]
    pub async fn confirm_manual_payment(
        &self,
        payment_id: i32,
        request: ConfirmPaymentRequest,
    ) -> Result<PaymentModel, ServiceError> {
        request.validate()?;
        let target = PaymentStatus::from_str(request.status.trim())
            .ok()
            .filter(|s| *s != PaymentStatus::Pending)
            .ok_or_else(|| {
                ServiceError::InvalidStatus(format!(
                    "Payments can be confirmed as approved or rejected, not '{}'",
                    request.status
                ))
            })?;
        let notes = non_blank(request.notes);

        let mut current = self.require_payment(payment_id).await?;
        if current.method == PaymentMethod::GatewayCheckout {
            return Err(ServiceError::InvalidStatus(
                "Gateway payments are confirmed by the gateway".to_string(),
            ));
        }

        for attempt in 1..=MAX_PAYMENT_CAS_ATTEMPTS {
            if current.status == target {
                if target == PaymentStatus::Approved {
                    self.ensure_order_follows(current.order_id).await?;
                }
                return Ok(current);
            }
            if current.status != PaymentStatus::Pending {
                return Err(ServiceError::InvalidStatus(format!(
                    "Payment {} is already {}",
                    current.id, current.status
                )));
            }
            if target == PaymentStatus::Approved {
                if let Some(other) = self
                    .payments
                    .latest_for_order_with_status(current.order_id, PaymentStatus::Approved, None)
                    .await?
                {
                    return Err(ServiceError::InvalidStatus(format!(
                        "Order already paid by payment {}",
                        other.id
                    )));
                }
            }

            let now = Utc::now();
            let mut changes = PaymentActiveModel {
                status: Set(target),
                updated_at: Set(now),
                version: Set(current.version + 1),
                ..Default::default()
            };
            if target == PaymentStatus::Approved {
                changes.approved_at = Set(Some(now));
            }
            if let Some(extra) = &notes {
                changes.notes = Set(Some(match &current.notes {
                    Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, extra),
                    _ => extra.clone(),
                }));
            }

            if self
                .payments
                .compare_and_set(current.id, current.version, changes)
                .await?
            {
                info!(from = %current.status, to = %target, "Branch payment confirmed");
                if target == PaymentStatus::Approved {
                    self.advance_order(current.order_id).await?;
                }
                return self.require_payment(current.id).await;
            }

            warn!(attempt, "Payment changed concurrently, re-evaluating");
            current = self.require_payment(current.id).await?;
        }

        Err(ServiceError::ConcurrentModification(payment_id))
    }

    async fn require_payment(&self, payment_id: i32) -> Result<PaymentModel, ServiceError> {
        self.payments
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_payment(&self, payment_id: i32) -> Result<PaymentModel, ServiceError> {
        self.require_payment(payment_id).await
    }

    #[instrument(skip(self))]
    pub async fn payments_for_order(&self, order_id: i32) -> Result<Vec<PaymentModel>, ServiceError> {
        self.payments.find_by_order(order_id).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_payments(
        &self,
        filter: &PaymentFilter,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<PaymentModel>, u64), ServiceError> {
        self.payments.list(filter, offset, limit).await
    }

    /// Payment status together with its order. A pending gateway payment is
    /// first synced against the gateway on a best-effort basis.
    #[instrument(skip(self))]
    pub async fn verify(&self, payment_id: i32) -> Result<PaymentVerification, ServiceError> {
        let mut payment = self.require_payment(payment_id).await?;

        if payment.status == PaymentStatus::Pending
            && payment.method == PaymentMethod::GatewayCheckout
        {
            if let Some(gateway) = &self.gateway {
                match gateway.search_payments(&payment.internal_ref).await {
                    Ok(results) => {
                        let latest = results.iter().max_by_key(|p| p.date_last_updated);
                        if let Some(remote) = latest {
                            if let Err(e) = self.reconcile(payment.clone(), remote).await {
                                warn!(payment_id, error = %e, "Sync during verification failed");
                            }
                            payment = self.require_payment(payment_id).await?;
                        }
                    }
                    Err(e) => warn!(payment_id, error = %e, "Gateway search failed"),
                }
            }
        }

        if payment.status == PaymentStatus::Approved {
            if let Err(e) = self.ensure_order_follows(payment.order_id).await {
                warn!(payment_id, error = %e, "Could not advance order during verification");
            }
        }

        let order = self.orders.find_order(payment.order_id).await?.ok_or_else(|| {
            ServiceError::NotFound(format!("Order {} not found", payment.order_id))
        })?;

        Ok(PaymentVerification {
            payment_id: payment.id,
            status: payment.status,
            amount: payment.amount,
            currency: payment.currency,
            method: payment.method,
            order_id: order.id,
            order_number: order.order_number,
            order_status: order.status,
            created_at: payment.created_at,
            approved_at: payment.approved_at,
            external_ref: payment.external_ref,
            internal_ref: payment.internal_ref,
            notes: payment.notes,
        })
    }

    pub fn payment_methods() -> Vec<PaymentMethodInfo> {
        vec![
            PaymentMethodInfo {
                method: PaymentMethod::GatewayCheckout,
                name: "MercadoPago".to_string(),
                description: "Pay online through the MercadoPago checkout".to_string(),
                fees: "2.9% + $30".to_string(),
            },
            PaymentMethodInfo {
                method: PaymentMethod::Debit,
                name: "Debit card".to_string(),
                description: "Debit card at the branch".to_string(),
                fees: "none".to_string(),
            },
            PaymentMethodInfo {
                method: PaymentMethod::Credit,
                name: "Credit card".to_string(),
                description: "Credit card at the branch".to_string(),
                fees: "2.5%".to_string(),
            },
            PaymentMethodInfo {
                method: PaymentMethod::BankTransfer,
                name: "Bank transfer".to_string(),
                description: "Direct transfer, confirmed by an accountant".to_string(),
                fees: "none".to_string(),
            },
        ]
    }
}
