//! Request coordinator (spec §4.7): the closed catalog of premium endpoints,
//! request lifecycle advancement, and facilitator-callback reconciliation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rust_decimal_macros::dec;
use tokio::time::sleep;
use tracing::{instrument, warn};

use crate::{
    amount::Amount,
    bus::{Event, EventBus},
    clock::Clock,
    error::AgentError,
    ids::new_id,
    ledger::Ledger,
    models::{LedgerCategory, Payment, PaymentStatus, PremiumRequest, RequestStatus},
    repository::Repository,
};

/// A single catalog entry: the price and currency charged for an endpoint,
/// the facilitator URL quoted alongside it, and the opaque payload it
/// unlocks once paid.
#[derive(Clone, Debug)]
pub struct CatalogEntry {
    pub price: Amount,
    pub currency: &'static str,
    pub facilitator_url: String,
    pub payload: fn() -> serde_json::Value,
}

/// The closed set of premium endpoints this agent knows how to serve (spec
/// §4.7). Unlisted endpoints are rejected with `UnknownEndpoint`. Every entry
/// quotes `facilitator_base_url` as its facilitator URL (spec §6).
pub fn catalog(facilitator_base_url: &str) -> HashMap<&'static str, CatalogEntry> {
    let mut map = HashMap::new();
    map.insert(
        "market",
        CatalogEntry {
            price: Amount::try_from_decimal(dec!(0.05)).expect("0.05 is a valid Amount"),
            currency: "USDC",
            facilitator_url: facilitator_base_url.to_string(),
            payload: || {
                serde_json::json!({
                    "prices": { "SOL/USDC": "164.32" },
                    "arbitrageSignals": [],
                    "sentiment": "neutral",
                })
            },
        },
    );
    map.insert(
        "knowledge",
        CatalogEntry {
            price: Amount::try_from_decimal(dec!(0.03)).expect("0.03 is a valid Amount"),
            currency: "CASH",
            facilitator_url: facilitator_base_url.to_string(),
            payload: || {
                serde_json::json!({
                    "summary": "no new developments",
                    "citations": [],
                })
            },
        },
    );
    map
}

const RECONCILE_RETRIES: u32 = 3;
const RECONCILE_BACKOFF: Duration = Duration::from_millis(150);

pub struct RequestCoordinator<C: Clock> {
    repo: Arc<dyn Repository>,
    ledger: Arc<Ledger<C>>,
    bus: EventBus,
    clock: Arc<C>,
    catalog: HashMap<&'static str, CatalogEntry>,
}

impl<C: Clock> RequestCoordinator<C> {
    pub fn new(
        repo: Arc<dyn Repository>,
        ledger: Arc<Ledger<C>>,
        bus: EventBus,
        clock: Arc<C>,
        facilitator_base_url: &str,
    ) -> Self {
        Self {
            repo,
            ledger,
            bus,
            clock,
            catalog: catalog(facilitator_base_url),
        }
    }

    /// Implements the requestOrAdvance dispatch of spec §4.7 step 2: loads
    /// `existing_id` if supplied and dispatches on its current status rather
    /// than ever creating a request behind a caller's back. A brand-new
    /// `PAYMENT_REQUIRED` request is only ever seeded from the catalog when
    /// no `existing_id` is given.
    #[instrument(skip(self))]
    pub async fn request_or_advance(
        &self,
        endpoint: &str,
        existing_id: Option<&str>,
    ) -> Result<PremiumRequest, AgentError> {
        if let Some(id) = existing_id {
            let existing = self
                .repo
                .get_request(id)
                .await
                .map_err(AgentError::RepositoryTransient)?
                .ok_or(AgentError::RequestNotFound)?;

            return match existing.status {
                RequestStatus::Fulfilled => Ok(existing),
                RequestStatus::Paid => self.advance_to_fulfilled(existing).await,
                RequestStatus::PaymentRequired | RequestStatus::Failed => Ok(existing),
            };
        }

        let entry = self
            .catalog
            .get(endpoint)
            .ok_or(AgentError::UnknownEndpoint)?;

        let now = self.clock.now();
        let request = PremiumRequest {
            id: new_id(),
            endpoint: endpoint.to_string(),
            status: RequestStatus::PaymentRequired,
            amount: entry.price,
            currency: entry.currency.to_string(),
            facilitator_url: entry.facilitator_url.clone(),
            payment_hash: None,
            data_payload: None,
            created_at: now,
            updated_at: now,
            version: 0,
        };
        let request = self
            .repo
            .create_request(request)
            .await
            .map_err(AgentError::RepositoryTransient)?;

        self.ledger
            .append(
                LedgerCategory::Request,
                "payment-required",
                Some(request.id.clone()),
                None,
                None,
                Some(serde_json::json!({ "endpoint": endpoint })),
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        Ok(request)
    }

    /// PAID → FULFILLED (spec §4.7 step 2): attaches the catalog payload and
    /// appends the `data-fulfilled` ledger entry. Call sites only ever reach
    /// this from PAID, so it never needs to be idempotent against itself.
    async fn advance_to_fulfilled(
        &self,
        request: PremiumRequest,
    ) -> Result<PremiumRequest, AgentError> {
        let entry = self
            .catalog
            .get(request.endpoint.as_str())
            .ok_or(AgentError::UnknownEndpoint)?;

        let mut updated = request;
        updated.status = RequestStatus::Fulfilled;
        updated.data_payload = Some((entry.payload)());
        updated.updated_at = self.clock.now();

        let updated = self
            .repo
            .update_request(updated)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .map_err(|_conflict| {
                AgentError::RepositoryTransient(anyhow::anyhow!(
                    "lost a race advancing a paid request to fulfilled"
                ))
            })?;

        self.ledger
            .append(
                LedgerCategory::Request,
                "data-fulfilled",
                Some(updated.id.clone()),
                None,
                None,
                None,
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;

        Ok(updated)
    }

    /// Reconciles a facilitator callback against an already-submitted
    /// transaction hash, retrying a bounded number of times on an optimistic-
    /// concurrency conflict (spec §4.7: 3x, 150ms linear backoff).
    ///
    /// Idempotent: a payment already CONFIRMED with the same tx_hash records
    /// a `facilitator-callback-duplicate` entry and returns unchanged rather
    /// than re-confirming (spec §8 invariant 7).
    #[instrument(skip(self))]
    pub async fn reconcile_callback(&self, tx_hash: &str) -> Result<(), AgentError> {
        for attempt in 0..RECONCILE_RETRIES {
            let payment = self
                .repo
                .get_payment_by_tx_hash(tx_hash)
                .await
                .map_err(AgentError::RepositoryTransient)?
                .ok_or(AgentError::UnknownTransaction)?;

            if payment.status == PaymentStatus::Confirmed {
                self.ledger
                    .append(
                        LedgerCategory::Payment,
                        "facilitator-callback-duplicate",
                        Some(payment.request_id.clone()),
                        Some(payment.id.clone()),
                        Some(tx_hash.to_string()),
                        None,
                    )
                    .await
                    .map_err(AgentError::RepositoryTransient)?;
                return Ok(());
            }

            let mut confirmed = payment.clone();
            confirmed.status = PaymentStatus::Confirmed;
            confirmed.failure_code = None;
            confirmed.confirmed_at = Some(self.clock.now());

            match self
                .repo
                .update_payment(confirmed)
                .await
                .map_err(AgentError::RepositoryTransient)?
            {
                Ok(confirmed) => {
                    self.move_request_to_paid(&confirmed).await?;

                    self.ledger
                        .append(
                            LedgerCategory::Payment,
                            "facilitator-callback",
                            Some(confirmed.request_id.clone()),
                            Some(confirmed.id.clone()),
                            Some(tx_hash.to_string()),
                            None,
                        )
                        .await
                        .map_err(AgentError::RepositoryTransient)?;

                    self.bus.publish(Event::PaymentStatus {
                        payment_id: confirmed.id,
                        status: "CONFIRMED".to_string(),
                    });
                    return Ok(());
                }
                Err(_conflict) if attempt + 1 < RECONCILE_RETRIES => {
                    warn!(attempt, "facilitator reconciliation lost a race, retrying");
                    sleep(RECONCILE_BACKOFF * (attempt + 1)).await;
                }
                Err(_conflict) => {
                    return Err(AgentError::RepositoryTransient(anyhow::anyhow!(
                        "facilitator callback reconciliation exhausted its retries"
                    )))
                }
            }
        }
        Err(AgentError::UnknownTransaction)
    }

    /// Moves the owning request to PAID on a confirmed callback (spec §8
    /// invariant 2: a CONFIRMED payment's request must be PAID or
    /// FULFILLED). A request already PAID or FULFILLED — the executor
    /// reached it first — is left untouched; the PAID→FULFILLED advance
    /// only ever happens from `request_or_advance`.
    async fn move_request_to_paid(&self, payment: &Payment) -> Result<(), AgentError> {
        let request = self
            .repo
            .get_request(&payment.request_id)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .ok_or(AgentError::RequestNotFound)?;

        if matches!(request.status, RequestStatus::Paid | RequestStatus::Fulfilled) {
            return Ok(());
        }

        let mut updated = request;
        updated.status = RequestStatus::Paid;
        updated.payment_hash = Some(payment.tx_hash.clone());
        updated.updated_at = self.clock.now();
        let updated = self
            .repo
            .update_request(updated)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .map_err(|_conflict| {
                AgentError::RepositoryTransient(anyhow::anyhow!(
                    "lost a race moving a reconciled request to paid"
                ))
            })?;

        self.ledger
            .append(
                LedgerCategory::Request,
                "paid",
                Some(updated.id),
                None,
                None,
                None,
            )
            .await
            .map_err(AgentError::RepositoryTransient)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bus::EventBus;
    use crate::clock::{FakeClock, TimestampMs};
    use crate::repository::InMemoryRepository;

    fn coordinator() -> (RequestCoordinator<FakeClock>, Arc<dyn Repository>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new(TimestampMs::from_i64(0)));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new(clock.clone()));
        let bus = EventBus::new();
        let ledger = Arc::new(Ledger::new(repo.clone(), bus.clone(), clock.clone()));
        let coordinator = RequestCoordinator::new(
            repo.clone(),
            ledger,
            bus,
            clock.clone(),
            "https://facilitator.invalid",
        );
        (coordinator, repo, clock)
    }

    #[tokio::test]
    async fn unknown_endpoint_is_rejected() {
        let (c, _repo, _clock) = coordinator();
        let err = c.request_or_advance("not-a-real-endpoint", None).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownEndpoint));
    }

    #[tokio::test]
    async fn requesting_twice_reuses_the_open_request() {
        let (c, _repo, _clock) = coordinator();
        let first = c.request_or_advance("market", None).await.unwrap();
        let second = c.request_or_advance("market", Some(&first.id)).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn new_requests_quote_the_configured_facilitator_url() {
        let (c, _repo, _clock) = coordinator();
        let request = c.request_or_advance("market", None).await.unwrap();
        assert_eq!(request.facilitator_url, "https://facilitator.invalid");
    }

    #[tokio::test]
    async fn paid_request_advances_to_fulfilled_with_payload() {
        let (c, repo, clock) = coordinator();
        let request = c.request_or_advance("knowledge", None).await.unwrap();

        let mut paid = request.clone();
        paid.status = RequestStatus::Paid;
        paid.payment_hash = Some("sig".to_string());
        paid.updated_at = clock.now();
        repo.update_request(paid).await.unwrap().unwrap();

        let fulfilled = c.request_or_advance("knowledge", Some(&request.id)).await.unwrap();
        assert_eq!(fulfilled.status, RequestStatus::Fulfilled);
        assert!(fulfilled.data_payload.is_some());
    }

    #[tokio::test]
    async fn fulfilled_request_is_returned_unchanged() {
        let (c, repo, clock) = coordinator();
        let request = c.request_or_advance("market", None).await.unwrap();

        let mut fulfilled = request.clone();
        fulfilled.status = RequestStatus::Fulfilled;
        fulfilled.data_payload = Some(serde_json::json!({ "already": "fulfilled" }));
        fulfilled.updated_at = clock.now();
        repo.update_request(fulfilled).await.unwrap().unwrap();

        let refetched = c.request_or_advance("market", Some(&request.id)).await.unwrap();
        assert_eq!(refetched.status, RequestStatus::Fulfilled);
        assert_eq!(refetched.data_payload.unwrap()["already"], "fulfilled");
    }

    #[tokio::test]
    async fn unknown_existing_id_is_rejected() {
        let (c, _repo, _clock) = coordinator();
        let err = c.request_or_advance("market", Some("no-such-id")).await.unwrap_err();
        assert!(matches!(err, AgentError::RequestNotFound));
    }
}
