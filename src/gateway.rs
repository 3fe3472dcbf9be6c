use anyhow::Context;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::debug;

use crate::error::{HuntError, Result};
use crate::models::Money;

type HmacSha256 = Hmac<Sha256>;

// --- Gateway seam ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Attempted,
    Paid,
    /// Any status this client does not know; never treated as paid.
    #[serde(other)]
    Unknown,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Attempted => "attempted",
            OrderStatus::Paid => "paid",
            OrderStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: Money,
    pub currency: String,
    pub receipt: Option<String>,
    pub status: OrderStatus,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_order(&self, amount: Money, receipt: &str) -> Result<GatewayOrder>;

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder>;

    /// Checks the checkout signature over `order_id|payment_id`.
    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// Checks the webhook signature over the raw request body.
    fn verify_webhook(&self, raw_body: &[u8], signature: &str) -> bool;
}

// --- Signatures ---

/// Hex-encoded HMAC-SHA256 of `message`.
#[cfg(test)]
pub fn sign(secret: &str, message: &[u8]) -> String {
    let mut mac = new_mac(secret);
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison against a hex-encoded HMAC-SHA256.
pub fn verify_signature(secret: &str, message: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = new_mac(secret);
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

pub fn payment_message(order_id: &str, payment_id: &str) -> String {
    format!("{}|{}", order_id, payment_id)
}

fn new_mac(secret: &str) -> HmacSha256 {
    // HMAC is defined for keys of any length, so this never fails.
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"))
}

// --- Webhook payloads ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
    PaymentCaptured,
    OrderPaid,
    PaymentFailed,
    Other(String),
}

impl WebhookKind {
    fn from_event(event: &str) -> Self {
        match event {
            "payment.captured" => WebhookKind::PaymentCaptured,
            "order.paid" => WebhookKind::OrderPaid,
            "payment.failed" => WebhookKind::PaymentFailed,
            other => WebhookKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEvent {
    pub event: String,
    pub kind: WebhookKind,
    pub order_id: Option<String>,
    pub payment_id: Option<String>,
    pub error_code: Option<String>,
    pub error_description: Option<String>,
    pub error_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWebhook {
    event: String,
    #[serde(default)]
    payload: RawPayload,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    payment: Option<RawEntity<RawPayment>>,
    order: Option<RawEntity<RawOrderRef>>,
}

#[derive(Debug, Deserialize)]
struct RawEntity<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct RawPayment {
    id: Option<String>,
    order_id: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    error_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawOrderRef {
    id: Option<String>,
}

impl WebhookEvent {
    pub fn parse(raw_body: &[u8]) -> Result<Self> {
        let raw: RawWebhook = serde_json::from_slice(raw_body)
            .map_err(|e| HuntError::Validation(format!("malformed webhook payload: {}", e)))?;
        let payment = raw.payload.payment.map(|p| p.entity);
        let order_ref = raw.payload.order.and_then(|o| o.entity.id);

        let (payment_id, payment_order, error_code, error_description, error_reason) = match payment {
            Some(p) => (p.id, p.order_id, p.error_code, p.error_description, p.error_reason),
            None => (None, None, None, None, None),
        };

        Ok(Self {
            kind: WebhookKind::from_event(&raw.event),
            event: raw.event,
            order_id: payment_order.or(order_ref),
            payment_id,
            error_code,
            error_description,
            error_reason,
        })
    }
}

// --- Razorpay client ---

pub const DEFAULT_GATEWAY_URL: &str = "https://api.razorpay.com";

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub base_url: String,
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
    pub currency: String,
}

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
}

#[derive(Debug, Deserialize)]
struct RazorpayOrder {
    id: String,
    amount: i64,
    currency: String,
    receipt: Option<String>,
    status: OrderStatus,
}

impl From<RazorpayOrder> for GatewayOrder {
    fn from(order: RazorpayOrder) -> Self {
        Self {
            id: order.id,
            amount: Money::from_cents(order.amount),
            currency: order.currency,
            receipt: order.receipt,
            status: order.status,
        }
    }
}

pub struct RazorpayGateway {
    config: RazorpayConfig,
    client: reqwest::Client,
}

impl RazorpayGateway {
    pub fn new(config: RazorpayConfig, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn read_order(response: reqwest::Response) -> Result<GatewayOrder> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("status {}: {}", status, body);
            // Server-side trouble is worth retrying later; client errors are not.
            return Err(if status.is_server_error() {
                HuntError::GatewayUnreachable(message)
            } else {
                HuntError::Gateway(message)
            });
        }
        let order: RazorpayOrder = response
            .json()
            .await
            .map_err(|e| HuntError::Gateway(format!("unexpected order payload: {}", e)))?;
        Ok(order.into())
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    async fn create_order(&self, amount: Money, receipt: &str) -> Result<GatewayOrder> {
        let request = CreateOrderRequest {
            amount: amount.cents(),
            currency: &self.config.currency,
            receipt,
        };
        debug!(receipt, amount = %amount, "Creating gateway order");
        let response = self
            .client
            .post(self.url("/v1/orders"))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(&request)
            .send()
            .await?;
        Self::read_order(response).await
    }

    async fn fetch_order(&self, order_id: &str) -> Result<GatewayOrder> {
        let response = self
            .client
            .get(self.url(&format!("/v1/orders/{}", order_id)))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await?;
        Self::read_order(response).await
    }

    fn verify_payment(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
        verify_signature(
            &self.config.key_secret,
            payment_message(order_id, payment_id).as_bytes(),
            signature,
        )
    }

    fn verify_webhook(&self, raw_body: &[u8], signature: &str) -> bool {
        verify_signature(&self.config.webhook_secret, raw_body, signature)
    }
}
