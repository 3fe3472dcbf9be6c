use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::db::{CreditCompletion, CreditFailure, CreditOutcome, Database, FailOutcome};
use crate::error::{HuntError, Result};
use crate::gateway::{OrderStatus, PaymentGateway, WebhookEvent, WebhookKind};
use crate::models::{Money, ResolutionPath, Transaction, TxnId, TxnMetadata, TxnStatus, UserId};

/// Receipt ids are capped by the gateway.
const MAX_RECEIPT_LEN: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopUpLimits {
    pub min_dollars: i64,
    pub max_dollars: i64,
}

impl Default for TopUpLimits {
    fn default() -> Self {
        Self {
            min_dollars: 5,
            max_dollars: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopUpOrder {
    pub txn_id: TxnId,
    pub order_id: String,
    pub amount: Money,
    pub currency: String,
    pub receipt: String,
}

/// What a reconciliation entry point did to the credit it was pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Credited { new_balance: Money },
    AlreadyCredited,
    Failed,
    /// The transaction was already terminal; nothing changed.
    Unchanged(TxnStatus),
    StillPending(OrderStatus),
    Ignored,
}

/// Webhooks are always acknowledged; processing problems ride along here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookAck {
    pub received: bool,
    pub error: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub left_pending: usize,
}

/// Moves credit transactions out of `pending` through whichever entry point
/// gets there first. Wallet application is gated in storage by the
/// `wallet_credited` marker, so entry points may race freely.
pub struct Reconciler {
    db: Arc<Database>,
    gateway: Arc<dyn PaymentGateway>,
    limits: TopUpLimits,
    stale_after: Duration,
    currency: String,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        gateway: Arc<dyn PaymentGateway>,
        limits: TopUpLimits,
        stale_after: Duration,
        currency: String,
    ) -> Self {
        Self {
            db,
            gateway,
            limits,
            stale_after,
            currency,
        }
    }

    // --- Order issuance ---

    pub async fn create_top_up(
        &self,
        user_id: UserId,
        dollars: i64,
        now: DateTime<Utc>,
    ) -> Result<TopUpOrder> {
        if dollars < self.limits.min_dollars || dollars > self.limits.max_dollars {
            return Err(HuntError::Validation(format!(
                "top-up amount must be a whole number of dollars between {} and {}",
                self.limits.min_dollars, self.limits.max_dollars
            )));
        }
        if self.db.get_user(user_id)?.is_none() {
            return Err(HuntError::NotFound(format!("user #{}", user_id)));
        }

        let amount = Money::from_dollars(dollars);
        let receipt = receipt_id(user_id, now);
        let order = self.gateway.create_order(amount, &receipt).await?;
        let currency = if order.currency.is_empty() {
            self.currency.clone()
        } else {
            order.currency.clone()
        };

        let metadata = TxnMetadata {
            receipt: Some(receipt.clone()),
            currency: Some(currency.clone()),
            ..Default::default()
        };
        let txn_id = self.db.insert_pending_credit(
            user_id,
            amount,
            &format!("Wallet top-up of {}", amount),
            &order.id,
            &metadata,
            now,
        )?;
        info!(user_id, txn_id, order_id = %order.id, amount = %amount, "Created top-up order");

        Ok(TopUpOrder {
            txn_id,
            order_id: order.id,
            amount,
            currency,
            receipt,
        })
    }

    // --- Entry points ---

    /// Client-side confirmation after checkout. A bad signature leaves the
    /// transaction pending for the other paths to resolve.
    pub async fn confirm_payment(
        &self,
        user_id: UserId,
        order_id: &str,
        payment_id: &str,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let txn = self.owned_credit(user_id, order_id)?;

        if !self.gateway.verify_payment(order_id, payment_id, signature) {
            self.note_signature_rejection(&txn, now);
            warn!(user_id, txn_id = txn.id, order_id, "Rejected payment confirmation with invalid signature");
            return Err(HuntError::GatewaySignatureInvalid {
                order_id: order_id.to_string(),
            });
        }

        let mut completion = CreditCompletion::new(ResolutionPath::ClientConfirmation);
        completion.payment_id = Some(payment_id.to_string());
        self.complete(&txn, &completion, now)
    }

    /// Gateway webhook. Always acknowledged; errors are logged and echoed.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> WebhookAck {
        match self.process_webhook(raw_body, signature, now) {
            Ok(resolution) => {
                debug!(?resolution, "Processed webhook");
                WebhookAck {
                    received: true,
                    error: None,
                }
            }
            Err(err) => {
                error!(error = %err, "Webhook processing failed");
                WebhookAck {
                    received: true,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    fn process_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        // Unauthenticated bodies are never parsed and never touch stored state.
        if !self.gateway.verify_webhook(raw_body, signature) {
            warn!(body_len = raw_body.len(), "Rejected webhook with invalid signature");
            return Err(HuntError::GatewaySignatureInvalid {
                order_id: "unverified webhook".to_string(),
            });
        }
        let event = WebhookEvent::parse(raw_body)?;

        let order_id = match (&event.kind, event.order_id.as_deref()) {
            (WebhookKind::Other(name), _) => {
                debug!(event = %name, "Ignoring unhandled webhook event");
                return Ok(Resolution::Ignored);
            }
            (_, Some(id)) => id,
            (_, None) => {
                return Err(HuntError::Validation(format!(
                    "webhook '{}' carries no order id",
                    event.event
                )));
            }
        };

        let Some(txn) = self.db.find_credit_by_order(order_id)? else {
            info!(order_id, event = %event.event, "Webhook for unknown order");
            return Ok(Resolution::Ignored);
        };

        match event.kind {
            WebhookKind::PaymentCaptured | WebhookKind::OrderPaid => {
                let completion = CreditCompletion {
                    path: ResolutionPath::Webhook,
                    payment_id: event.payment_id.clone(),
                    gateway_status: Some(event.event.clone()),
                    webhook_event: Some(event.event.clone()),
                };
                self.complete(&txn, &completion, now)
            }
            WebhookKind::PaymentFailed => {
                let failure = CreditFailure {
                    path: ResolutionPath::Webhook,
                    reason: event
                        .error_description
                        .clone()
                        .unwrap_or_else(|| "Payment failed".to_string()),
                    error_code: event.error_code.clone(),
                    error_reason: event.error_reason.clone(),
                    webhook_event: Some(event.event.clone()),
                };
                self.fail(&txn, &failure, now)
            }
            WebhookKind::Other(_) => Ok(Resolution::Ignored),
        }
    }

    /// Polls the gateway for one order on the client's request.
    pub async fn sync_transaction(
        &self,
        user_id: UserId,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let txn = self.owned_credit(user_id, order_id)?;
        if txn.status.is_terminal() {
            return Ok(Resolution::Unchanged(txn.status));
        }

        let order = self.gateway.fetch_order(order_id).await?;
        if order.status == OrderStatus::Paid {
            let mut completion = CreditCompletion::new(ResolutionPath::ManualSync);
            completion.gateway_status = Some(order.status.as_str().to_string());
            return self.complete(&txn, &completion, now);
        }

        self.db.update_metadata(txn.id, now, |m| {
            m.gateway_status = Some(order.status.as_str().to_string());
        })?;
        debug!(user_id, txn_id = txn.id, order_id, status = order.status.as_str(), "Order not paid yet");
        Ok(Resolution::StillPending(order.status))
    }

    /// Resolves pending credits older than the staleness window: paid orders
    /// are completed, anything else is expired. Rows whose order cannot be
    /// fetched stay pending for the next sweep.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let cutoff = now - self.stale_after;
        let stale = self.db.stale_pending_credits(cutoff)?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }
        info!(count = stale.len(), "Sweeping stale pending credits");

        for txn in stale {
            match self.sweep_one(&txn, now).await {
                Ok(Resolution::Credited { .. }) | Ok(Resolution::AlreadyCredited) => report.completed += 1,
                Ok(Resolution::Failed) => report.failed += 1,
                Ok(_) => {}
                Err(err) => {
                    report.left_pending += 1;
                    if err.is_transient() {
                        warn!(txn_id = txn.id, error = %err, "Gateway unreachable, leaving credit pending");
                    } else {
                        error!(txn_id = txn.id, error = %err, "Failed to sweep stale credit");
                    }
                }
            }
        }
        Ok(report)
    }

    async fn sweep_one(&self, txn: &Transaction, now: DateTime<Utc>) -> Result<Resolution> {
        let minutes = (now - txn.created_at).num_minutes();
        let Some(order_id) = txn.gateway_order_id.as_deref() else {
            let failure = CreditFailure::new(
                ResolutionPath::StaleSweep,
                HuntError::StaleTransactionUnresolved { txn_id: txn.id, minutes }.to_string(),
            );
            return self.fail(txn, &failure, now);
        };

        let order = self.gateway.fetch_order(order_id).await?;
        if order.status == OrderStatus::Paid {
            let mut completion = CreditCompletion::new(ResolutionPath::StaleSweep);
            completion.gateway_status = Some(order.status.as_str().to_string());
            let resolution = self.complete(txn, &completion, now)?;
            info!(txn_id = txn.id, order_id, "Recovered paid credit during sweep");
            return Ok(resolution);
        }

        let mut failure = CreditFailure::new(
            ResolutionPath::StaleSweep,
            HuntError::StaleTransactionUnresolved { txn_id: txn.id, minutes }.to_string(),
        );
        failure.error_reason = Some(format!("gateway order status: {}", order.status.as_str()));
        self.fail(txn, &failure, now)
    }

    /// Checkout dismissed by the user. Unknown or settled orders are a no-op.
    pub fn cancel(&self, user_id: UserId, order_id: &str, now: DateTime<Utc>) -> Result<Resolution> {
        let Some(txn) = self.find_owned(user_id, order_id)? else {
            return Ok(Resolution::Ignored);
        };
        let failure = CreditFailure::new(ResolutionPath::ClientCancel, "Payment cancelled by user");
        self.fail(&txn, &failure, now)
    }

    /// Payment failure reported by the checkout client.
    pub fn report_client_failure(
        &self,
        user_id: UserId,
        order_id: &str,
        error_code: Option<String>,
        error_description: Option<String>,
        error_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let Some(txn) = self.find_owned(user_id, order_id)? else {
            return Ok(Resolution::Ignored);
        };
        let failure = CreditFailure {
            path: ResolutionPath::ClientFailure,
            reason: error_description.unwrap_or_else(|| "Payment failed".to_string()),
            error_code,
            error_reason,
            webhook_event: None,
        };
        self.fail(&txn, &failure, now)
    }

    // --- Helpers ---

    fn find_owned(&self, user_id: UserId, order_id: &str) -> Result<Option<Transaction>> {
        Ok(self
            .db
            .find_credit_by_order(order_id)?
            .filter(|txn| txn.user_id == user_id))
    }

    fn owned_credit(&self, user_id: UserId, order_id: &str) -> Result<Transaction> {
        self.find_owned(user_id, order_id)?
            .ok_or_else(|| HuntError::NotFound(format!("transaction for order {}", order_id)))
    }

    fn complete(
        &self,
        txn: &Transaction,
        completion: &CreditCompletion,
        now: DateTime<Utc>,
    ) -> Result<Resolution> {
        let path = completion.path;
        match self.db.complete_credit(txn.id, completion, now)? {
            CreditOutcome::Credited { new_balance } => {
                info!(user_id = txn.user_id, txn_id = txn.id, ?path, amount = %txn.amount, balance = %new_balance, "Credited wallet");
                Ok(Resolution::Credited { new_balance })
            }
            CreditOutcome::AlreadyCredited => {
                debug!(txn_id = txn.id, ?path, "Credit already applied");
                Ok(Resolution::AlreadyCredited)
            }
            CreditOutcome::AlreadyFailed => {
                warn!(
                    user_id = txn.user_id,
                    txn_id = txn.id,
                    order_id = txn.gateway_order_id.as_deref().unwrap_or("-"),
                    ?path,
                    "Completion signal for a failed transaction, needs manual follow-up"
                );
                Ok(Resolution::Unchanged(TxnStatus::Failed))
            }
        }
    }

    fn fail(&self, txn: &Transaction, failure: &CreditFailure, now: DateTime<Utc>) -> Result<Resolution> {
        match self.db.fail_pending_credit(txn.id, failure, now)? {
            FailOutcome::Failed => {
                info!(user_id = txn.user_id, txn_id = txn.id, path = ?failure.path, reason = %failure.reason, "Marked credit failed");
                Ok(Resolution::Failed)
            }
            FailOutcome::NotPending(status) => {
                debug!(txn_id = txn.id, status = status.as_str(), "Credit no longer pending");
                Ok(Resolution::Unchanged(status))
            }
        }
    }

    fn note_signature_rejection(&self, txn: &Transaction, now: DateTime<Utc>) {
        if let Err(err) = self
            .db
            .update_metadata(txn.id, now, |m| m.signature_rejections += 1)
        {
            warn!(txn_id = txn.id, error = %err, "Failed to record signature rejection");
        }
    }
}

/// `wlt_<user>_<suffix>`, at most 40 characters.
fn receipt_id(user_id: UserId, now: DateTime<Utc>) -> String {
    let stamp = now.timestamp_millis().rem_euclid(100_000_000);
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    let mut receipt = format!("wlt_{}_{:08}{}", user_id, stamp, nonce);
    receipt.truncate(MAX_RECEIPT_LEN);
    receipt
}
