//! Payment executor (spec §4.6): the only component that ever calls
//! [`ChainClient::submit_transfer`].
//!
//! The algorithm mirrors the teacher's `PaymentsManager::check -> persist ->
//! commit` shape: load, validate preconditions, perform the side-effecting
//! call, then persist the outcome and tell the ledger and bus about it. A
//! chain failure never loses the attempt: it is always recorded as a FAILED
//! [`Payment`] row with a synthetic tx_hash so it stays queryable alongside
//! confirmed payments.
//!
//! The actual chain submission runs in a detached task reached through a
//! `oneshot` channel, not inline in `execute`'s own future. If the caller's
//! future is dropped — an HTTP client disconnecting mid-request — the
//! detached task still runs to completion; a payment it confirms after the
//! channel's receiver is gone is never silently lost, it is recorded as
//! `PAYMENT:orphaned` (spec §5).

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::{
    amount::Amount,
    balance::BalanceMonitor,
    bus::{Event, EventBus},
    chain::{ChainClient, ChainError},
    clock::Clock,
    error::AgentError,
    facilitator::{FacilitatorClient, VerificationPacket},
    ids::{new_id, synthetic_tx_hash},
    ledger::Ledger,
    models::{LedgerCategory, Payment, PaymentStatus, PremiumRequest, RequestStatus},
    repository::Repository,
    session::SessionRegistry,
};

pub struct PaymentExecutor<C: Clock> {
    repo: Arc<dyn Repository>,
    chain: Arc<dyn ChainClient>,
    balance: Arc<BalanceMonitor<C>>,
    sessions: Arc<SessionRegistry<C>>,
    ledger: Arc<Ledger<C>>,
    bus: EventBus,
    clock: Arc<C>,
    facilitator: Arc<FacilitatorClient<C>>,
    recipient_public_key: String,
}

impl<C: Clock> PaymentExecutor<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn Repository>,
        chain: Arc<dyn ChainClient>,
        balance: Arc<BalanceMonitor<C>>,
        sessions: Arc<SessionRegistry<C>>,
        ledger: Arc<Ledger<C>>,
        bus: EventBus,
        clock: Arc<C>,
        facilitator: Arc<FacilitatorClient<C>>,
        recipient_public_key: String,
    ) -> Self {
        Self {
            repo,
            chain,
            balance,
            sessions,
            ledger,
            bus,
            clock,
            facilitator,
            recipient_public_key,
        }
    }

    /// Executes payment for `request_id`, per spec §4.6 steps 1-9. `session_id`
    /// is `None` when a caller-supplied (non-scheduler) signer is used.
    ///
    /// Takes `self: Arc<Self>` so the chain submission can run detached from
    /// the caller's future (see module docs).
    #[instrument(skip(self))]
    pub async fn execute(
        self: Arc<Self>,
        request_id: &str,
        session_id: Option<&str>,
    ) -> Result<PremiumRequest, AgentError> {
        self.balance.ensure_payments_active().await?;

        let request = self
            .repo
            .get_request(request_id)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .ok_or(AgentError::RequestNotFound)?;

        if request.status != RequestStatus::PaymentRequired {
            // Already advanced past this step; return as-is (idempotent no-op).
            return Ok(request);
        }

        if let Some(session_id) = session_id {
            self.sessions
                .get_active(session_id)
                .await
                .map_err(AgentError::RepositoryTransient)?
                .ok_or(AgentError::SessionInvalid)?;
        }

        let lamports = request
            .amount
            .to_lamports()
            .map_err(|e| AgentError::ChainRejected(e.to_string()))?;

        let session_id = session_id.map(str::to_string);
        let executor = self.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let outcome = match executor
                .chain
                .submit_transfer(&executor.recipient_public_key, lamports)
                .await
            {
                Ok(transfer) => {
                    executor
                        .on_confirmed(request, transfer.signature, session_id.as_deref())
                        .await
                }
                Err(e) => executor.on_failed(request, e).await,
            };

            if let Err(outcome) = tx.send(outcome) {
                if let Ok(updated) = outcome {
                    warn!(
                        request_id = %updated.id,
                        "payment confirmed after the caller's request was cancelled, recording as orphaned"
                    );
                    let _ = executor
                        .ledger
                        .append(
                            LedgerCategory::Payment,
                            "orphaned",
                            Some(updated.id.clone()),
                            None,
                            updated.payment_hash.clone(),
                            None,
                        )
                        .await;
                }
            }
        });

        match rx.await {
            Ok(outcome) => outcome,
            Err(_recv_error) => Err(AgentError::RepositoryTransient(anyhow::anyhow!(
                "payment execution task ended without producing an outcome"
            ))),
        }
    }

    async fn on_confirmed(
        &self,
        request: PremiumRequest,
        signature: String,
        session_id: Option<&str>,
    ) -> Result<PremiumRequest, AgentError> {
        let now = self.clock.now();

        let payment = Payment {
            id: new_id(),
            request_id: request.id.clone(),
            tx_hash: signature.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentStatus::Confirmed,
            failure_code: None,
            confirmed_at: Some(now),
            created_at: now,
            version: 0,
        };
        let payment = match self
            .repo
            .create_payment(payment)
            .await
            .map_err(AgentError::RepositoryTransient)?
        {
            Ok(payment) => payment,
            // Spec §4.6 idempotency: the chain returned a signature that
            // collides with an already-recorded payment. Reconcile onto the
            // existing row rather than erroring.
            Err(duplicate) => {
                warn!(tx_hash = %signature, "chain returned a tx_hash already on record, reconciling");
                duplicate.0
            }
        };

        let mut updated = request.clone();
        updated.status = RequestStatus::Paid;
        updated.payment_hash = Some(signature.clone());
        updated.updated_at = now;
        let updated = self
            .repo
            .update_request(updated)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .unwrap_or(request);

        if let Some(session_id) = session_id {
            if let Err(e) = self.sessions.increment_usage(session_id).await {
                warn!(error = ?e, "failed to record session usage after a confirmed payment");
            }
        }

        if let Ok(lamports) = self.chain.get_balance_lamports().await {
            if let Err(e) = self.balance.ingest_balance(lamports, "payment").await {
                warn!(error = %e, "failed to record post-payment balance snapshot");
            }
        }

        self.ledger
            .append(
                LedgerCategory::Payment,
                "payment-confirmed",
                Some(updated.id.clone()),
                Some(payment.id.clone()),
                Some(signature.clone()),
                Some(serde_json::json!({ "amount": updated.amount.to_string() })),
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        self.ledger
            .append(
                LedgerCategory::Request,
                "paid",
                Some(updated.id.clone()),
                None,
                Some(signature.clone()),
                None,
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        self.bus.publish(Event::PaymentStatus {
            payment_id: payment.id.clone(),
            status: "CONFIRMED".to_string(),
        });

        // Best-effort facilitator verification (spec §4.6 step 7): a failure
        // here must never undo a payment the chain already confirmed.
        let packet = VerificationPacket {
            request_id: updated.id.clone(),
            payment_id: payment.id.clone(),
            tx_hash: signature.clone(),
            amount: updated.amount.to_string(),
            currency: updated.currency.clone(),
        };
        if let Err(e) = self.facilitator.submit(&packet).await {
            warn!(error = %e, "facilitator verification submission failed, continuing");
        }

        info!(request_id = %updated.id, %signature, "payment confirmed");
        Ok(updated)
    }

    async fn on_failed(
        &self,
        request: PremiumRequest,
        error: ChainError,
    ) -> Result<PremiumRequest, AgentError> {
        let now = self.clock.now();
        let tx_hash = synthetic_tx_hash();

        let payment = Payment {
            id: new_id(),
            request_id: request.id.clone(),
            tx_hash: tx_hash.clone(),
            amount: request.amount,
            currency: request.currency.clone(),
            status: PaymentStatus::Failed,
            failure_code: Some(error.to_string()),
            confirmed_at: None,
            created_at: now,
            version: 0,
        };
        let payment = self
            .repo
            .create_payment(payment)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .unwrap_or_else(|dup| dup.0);

        let mut updated = request.clone();
        updated.status = RequestStatus::Failed;
        updated.updated_at = now;
        let updated = self
            .repo
            .update_request(updated)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .unwrap_or(request);

        self.ledger
            .append(
                LedgerCategory::Payment,
                "payment-failed",
                Some(updated.id.clone()),
                Some(payment.id.clone()),
                Some(tx_hash.clone()),
                Some(serde_json::json!({ "error": error.to_string() })),
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        self.ledger
            .append(
                LedgerCategory::Request,
                "failed",
                Some(updated.id.clone()),
                None,
                None,
                Some(serde_json::json!({ "error": error.to_string() })),
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        self.bus.publish(Event::PaymentStatus {
            payment_id: updated.id.clone(),
            status: "FAILED".to_string(),
        });

        warn!(request_id = %updated.id, error = %error, "payment failed");

        Err(match error {
            ChainError::Rejected(msg) => AgentError::ChainRejected(msg),
            ChainError::Timeout => AgentError::ChainTimeout,
            ChainError::SignerUnavailable => AgentError::SignerUnavailable,
            ChainError::Transport(e) => AgentError::RepositoryTransient(e),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::EventBus;
    use crate::chain::fake::FakeChainClient;
    use crate::clock::{FakeClock, TimestampMs};
    use crate::models::RequestStatus;
    use crate::repository::InMemoryRepository;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    struct Harness {
        executor: Arc<PaymentExecutor<FakeClock>>,
        repo: Arc<dyn Repository>,
        ledger: Arc<Ledger<FakeClock>>,
        chain: Arc<FakeChainClient>,
    }

    fn harness(initial_lamports: u64) -> Harness {
        let clock = Arc::new(FakeClock::new(TimestampMs::from_i64(0)));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new(clock.clone()));
        let bus = EventBus::new();
        let ledger = Arc::new(Ledger::new(repo.clone(), bus.clone(), clock.clone()));
        let chain = Arc::new(FakeChainClient::new(initial_lamports));
        let chain_dyn: Arc<dyn ChainClient> = chain.clone();
        let balance = Arc::new(BalanceMonitor::new(
            repo.clone(),
            chain_dyn.clone(),
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            Amount::try_from_str("0.01").unwrap(),
        ));
        let sessions = Arc::new(SessionRegistry::new(repo.clone(), ledger.clone(), clock.clone()));
        let facilitator = Arc::new(FacilitatorClient::new(
            "https://facilitator.invalid".to_string(),
            None,
            ledger.clone(),
            Duration::from_secs(10),
        ));
        let executor = Arc::new(PaymentExecutor::new(
            repo.clone(),
            chain_dyn,
            balance,
            sessions,
            ledger.clone(),
            bus,
            clock,
            facilitator,
            "recipient-pubkey".to_string(),
        ));
        Harness {
            executor,
            repo,
            ledger,
            chain,
        }
    }

    async fn seed_request(repo: &Arc<dyn Repository>, amount: &str) -> PremiumRequest {
        repo.create_request(PremiumRequest {
            id: new_id(),
            endpoint: "market".to_string(),
            status: RequestStatus::PaymentRequired,
            amount: Amount::try_from_str(amount).unwrap(),
            currency: "USDC".to_string(),
            facilitator_url: "https://facilitator.invalid".to_string(),
            payment_hash: None,
            data_payload: None,
            created_at: TimestampMs::from_i64(0),
            updated_at: TimestampMs::from_i64(0),
            version: 0,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn successful_execution_marks_request_paid() {
        let h = harness(1_000_000_000);
        let request = seed_request(&h.repo, "0.05").await;

        let updated = h.executor.clone().execute(&request.id, None).await.unwrap();
        assert_eq!(updated.status, RequestStatus::Paid);
        assert!(updated.payment_hash.is_some());

        let page = h
            .ledger
            .query(&crate::repository::LedgerFilter::default(), 50, None)
            .await
            .unwrap();
        assert_eq!(page.entries.iter().filter(|e| e.event == "paid").count(), 1);
    }

    #[tokio::test]
    async fn rejected_transfer_marks_request_failed_with_synthetic_hash() {
        let h = harness(1_000_000_000);
        let request = seed_request(&h.repo, "0.05").await;
        h.chain.fail_next_submit.store(true, Ordering::SeqCst);

        let err = h.executor.clone().execute(&request.id, None).await.unwrap_err();
        assert!(matches!(err, AgentError::ChainRejected(_)));

        let stored = h.repo.get_request(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Failed);

        let page = h
            .ledger
            .query(&crate::repository::LedgerFilter::default(), 50, None)
            .await
            .unwrap();
        assert_eq!(
            page.entries
                .iter()
                .filter(|e| e.category == LedgerCategory::Request && e.event == "failed")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn already_paid_request_is_a_noop() {
        let h = harness(1_000_000_000);
        let request = seed_request(&h.repo, "0.05").await;
        let first = h.executor.clone().execute(&request.id, None).await.unwrap();
        let second = h.executor.clone().execute(&first.id, None).await.unwrap();
        assert_eq!(second.status, RequestStatus::Paid);
        assert_eq!(second.payment_hash, first.payment_hash);
    }
}
