//! Abstract persistence (spec §4.9 / §6).
//!
//! The core depends only on the [`Repository`] trait, never on a concrete
//! store, mirroring the teacher's `LexePersister` / `LexeInnerPersister`
//! trait-boundary idiom in `lexe-ln::traits`. [`InMemoryRepository`] is the
//! one production-shaped implementation that ships in-crate, used by both
//! the test suite and the demo binary; a relational implementation would
//! need to satisfy the same optimistic-concurrency contract (the `version`
//! field on every mutable row).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use crate::{
    clock::{Clock, TimestampMs},
    ids::new_id,
    models::{
        AutonomyTask, BalanceSnapshot, LedgerCategory, LedgerEntry, Payment,
        PremiumRequest, SessionCapability, SystemState,
    },
};

/// Returned when a repository mutation lost an optimistic-concurrency race;
/// callers retry per spec §4.7 (3x, 150ms linear backoff).
#[derive(Debug, thiserror::Error)]
#[error("optimistic concurrency conflict")]
pub struct ConflictError;

/// Returned by [`Repository::create_payment`] when the transaction hash
/// already exists. Carries the pre-existing row so the executor can
/// reconcile instead of failing (spec §4.6 idempotency / §7 DuplicatePayment).
#[derive(Debug, thiserror::Error)]
#[error("a payment with this tx_hash already exists")]
pub struct DuplicateTxHash(pub Payment);

/// Conjunctive filter over [`LedgerEntry`] fields (spec §4.1).
#[derive(Clone, Debug, Default)]
pub struct LedgerFilter {
    pub category: Option<LedgerCategory>,
    pub event: Option<String>,
    pub request_id: Option<String>,
    pub payment_id: Option<String>,
    pub tx_hash: Option<String>,
    pub from: Option<TimestampMs>,
    pub to: Option<TimestampMs>,
}

impl LedgerFilter {
    fn matches(&self, entry: &LedgerEntry) -> bool {
        if let Some(category) = self.category {
            if entry.category != category {
                return false;
            }
        }
        if let Some(event) = &self.event {
            if &entry.event != event {
                return false;
            }
        }
        if let Some(request_id) = &self.request_id {
            if entry.request_id.as_ref() != Some(request_id) {
                return false;
            }
        }
        if let Some(payment_id) = &self.payment_id {
            if entry.payment_id.as_ref() != Some(payment_id) {
                return false;
            }
        }
        if let Some(tx_hash) = &self.tx_hash {
            if entry.tx_hash.as_ref() != Some(tx_hash) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp > to {
                return false;
            }
        }
        true
    }
}

/// A page of ledger entries, newest first.
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    pub next_cursor: Option<String>,
}

pub const LEDGER_QUERY_MIN_LIMIT: usize = 1;
pub const LEDGER_QUERY_MAX_LIMIT: usize = 500;
pub const LEDGER_EXPORT_MAX_LIMIT: usize = 5000;

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // --- PremiumRequest --- //
    async fn create_request(&self, request: PremiumRequest) -> anyhow::Result<PremiumRequest>;
    async fn get_request(&self, id: &str) -> anyhow::Result<Option<PremiumRequest>>;
    /// Compare-and-swap update keyed on `request.version`; the implementation
    /// bumps the version on success.
    async fn update_request(
        &self,
        request: PremiumRequest,
    ) -> anyhow::Result<Result<PremiumRequest, ConflictError>>;

    // --- Payment --- //
    async fn create_payment(
        &self,
        payment: Payment,
    ) -> anyhow::Result<Result<Payment, DuplicateTxHash>>;
    async fn get_payment(&self, id: &str) -> anyhow::Result<Option<Payment>>;
    async fn get_payment_by_tx_hash(&self, tx_hash: &str) -> anyhow::Result<Option<Payment>>;
    async fn update_payment(
        &self,
        payment: Payment,
    ) -> anyhow::Result<Result<Payment, ConflictError>>;

    // --- SessionCapability --- //
    async fn create_session(&self, session: SessionCapability) -> anyhow::Result<SessionCapability>;
    async fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionCapability>>;
    async fn update_session(
        &self,
        session: SessionCapability,
    ) -> anyhow::Result<Result<SessionCapability, ConflictError>>;

    // --- AutonomyTask --- //
    async fn upsert_task(&self, task: AutonomyTask) -> anyhow::Result<AutonomyTask>;
    async fn find_task(&self, endpoint: &str) -> anyhow::Result<Option<AutonomyTask>>;
    async fn list_tasks(&self) -> anyhow::Result<Vec<AutonomyTask>>;
    async fn update_task(
        &self,
        task: AutonomyTask,
    ) -> anyhow::Result<Result<AutonomyTask, ConflictError>>;

    // --- BalanceSnapshot --- //
    async fn insert_balance_snapshot(&self, snapshot: BalanceSnapshot) -> anyhow::Result<()>;
    async fn latest_balance_snapshot(&self) -> anyhow::Result<Option<BalanceSnapshot>>;

    // --- SystemState --- //
    async fn get_system_state(&self) -> anyhow::Result<SystemState>;
    async fn set_system_state(&self, state: SystemState) -> anyhow::Result<()>;

    // --- Ledger --- //
    async fn append_ledger_entry(&self, entry: LedgerEntry) -> anyhow::Result<()>;
    async fn query_ledger(
        &self,
        filter: &LedgerFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> anyhow::Result<LedgerPage>;
    async fn export_ledger(
        &self,
        filter: &LedgerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>>;
}

/// In-memory [`Repository`] guarded by a single std [`Mutex`]. Every method
/// is a short, non-`.await`-ing critical section, so the lock is never held
/// across a suspension point (spec §5's "transaction scopes never span an
/// RPC call" rule).
pub struct InMemoryRepository<C: Clock> {
    clock: Arc<C>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<String, PremiumRequest>,
    payments: HashMap<String, Payment>,
    payments_by_tx_hash: HashMap<String, String>,
    sessions: HashMap<String, SessionCapability>,
    tasks: HashMap<String, AutonomyTask>,
    balance_snapshots: Vec<BalanceSnapshot>,
    system_state: SystemState,
    ledger: Vec<LedgerEntry>,
}

impl<C: Clock> InMemoryRepository<C> {
    pub fn new(clock: Arc<C>) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    #[allow(dead_code)]
    fn now(&self) -> TimestampMs {
        self.clock.now()
    }
}

#[async_trait]
impl<C: Clock> Repository for InMemoryRepository<C> {
    async fn create_request(&self, request: PremiumRequest) -> anyhow::Result<PremiumRequest> {
        let mut inner = self.inner.lock().unwrap();
        inner.requests.insert(request.id.clone(), request.clone());
        Ok(request)
    }

    async fn get_request(&self, id: &str) -> anyhow::Result<Option<PremiumRequest>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.requests.get(id).cloned())
    }

    async fn update_request(
        &self,
        mut request: PremiumRequest,
    ) -> anyhow::Result<Result<PremiumRequest, ConflictError>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.requests.get(&request.id) {
            Some(existing) if existing.version != request.version => {
                Ok(Err(ConflictError))
            }
            Some(_) => {
                request.version += 1;
                inner.requests.insert(request.id.clone(), request.clone());
                Ok(Ok(request))
            }
            None => Ok(Err(ConflictError)),
        }
    }

    async fn create_payment(
        &self,
        payment: Payment,
    ) -> anyhow::Result<Result<Payment, DuplicateTxHash>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing_id) = inner.payments_by_tx_hash.get(&payment.tx_hash).cloned() {
            let existing = inner.payments.get(&existing_id).unwrap().clone();
            return Ok(Err(DuplicateTxHash(existing)));
        }
        inner
            .payments_by_tx_hash
            .insert(payment.tx_hash.clone(), payment.id.clone());
        inner.payments.insert(payment.id.clone(), payment.clone());
        Ok(Ok(payment))
    }

    async fn get_payment(&self, id: &str) -> anyhow::Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.payments.get(id).cloned())
    }

    async fn get_payment_by_tx_hash(&self, tx_hash: &str) -> anyhow::Result<Option<Payment>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .payments_by_tx_hash
            .get(tx_hash)
            .and_then(|id| inner.payments.get(id))
            .cloned())
    }

    async fn update_payment(
        &self,
        mut payment: Payment,
    ) -> anyhow::Result<Result<Payment, ConflictError>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.payments.get(&payment.id) {
            Some(existing) if existing.version != payment.version => Ok(Err(ConflictError)),
            Some(_) => {
                payment.version += 1;
                inner.payments.insert(payment.id.clone(), payment.clone());
                Ok(Ok(payment))
            }
            None => Ok(Err(ConflictError)),
        }
    }

    async fn create_session(&self, session: SessionCapability) -> anyhow::Result<SessionCapability> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> anyhow::Result<Option<SessionCapability>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.sessions.get(id).cloned())
    }

    async fn update_session(
        &self,
        mut session: SessionCapability,
    ) -> anyhow::Result<Result<SessionCapability, ConflictError>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sessions.get(&session.id) {
            Some(existing) if existing.version != session.version => Ok(Err(ConflictError)),
            Some(_) => {
                session.version += 1;
                inner.sessions.insert(session.id.clone(), session.clone());
                Ok(Ok(session))
            }
            None => Ok(Err(ConflictError)),
        }
    }

    async fn upsert_task(&self, mut task: AutonomyTask) -> anyhow::Result<AutonomyTask> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tasks.contains_key(&task.endpoint) {
            task.version = 0;
        }
        inner.tasks.insert(task.endpoint.clone(), task.clone());
        Ok(task)
    }

    async fn find_task(&self, endpoint: &str) -> anyhow::Result<Option<AutonomyTask>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.get(endpoint).cloned())
    }

    async fn list_tasks(&self) -> anyhow::Result<Vec<AutonomyTask>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tasks.values().cloned().collect())
    }

    async fn update_task(
        &self,
        mut task: AutonomyTask,
    ) -> anyhow::Result<Result<AutonomyTask, ConflictError>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.get(&task.endpoint) {
            Some(existing) if existing.version != task.version => Ok(Err(ConflictError)),
            Some(_) => {
                task.version += 1;
                inner.tasks.insert(task.endpoint.clone(), task.clone());
                Ok(Ok(task))
            }
            None => Ok(Err(ConflictError)),
        }
    }

    async fn insert_balance_snapshot(&self, snapshot: BalanceSnapshot) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.balance_snapshots.push(snapshot);
        Ok(())
    }

    async fn latest_balance_snapshot(&self) -> anyhow::Result<Option<BalanceSnapshot>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.balance_snapshots.last().cloned())
    }

    async fn get_system_state(&self) -> anyhow::Result<SystemState> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.system_state)
    }

    async fn set_system_state(&self, state: SystemState) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.system_state = state;
        Ok(())
    }

    async fn append_ledger_entry(&self, mut entry: LedgerEntry) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if entry.id.is_empty() {
            entry.id = new_id();
        }
        inner.ledger.push(entry);
        Ok(())
    }

    async fn query_ledger(
        &self,
        filter: &LedgerFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> anyhow::Result<LedgerPage> {
        let limit = limit.clamp(LEDGER_QUERY_MIN_LIMIT, LEDGER_QUERY_MAX_LIMIT);
        let inner = self.inner.lock().unwrap();

        // Newest-first: sort by (timestamp, insertion index) descending, tie
        // broken by id for determinism, per spec §4.1's ordering contract.
        let mut matched: Vec<&LedgerEntry> = inner
            .ledger
            .iter()
            .filter(|e| filter.matches(e))
            .collect();
        matched.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });

        let start = match cursor {
            Some(cursor_id) => matched
                .iter()
                .position(|e| e.id == cursor_id)
                .map(|idx| idx + 1)
                .unwrap_or(matched.len()),
            None => 0,
        };

        let page: Vec<LedgerEntry> = matched
            .iter()
            .skip(start)
            .take(limit)
            .map(|e| (*e).clone())
            .collect();

        let next_cursor = if start + page.len() < matched.len() {
            page.last().map(|e| e.id.clone())
        } else {
            None
        };

        Ok(LedgerPage {
            entries: page,
            next_cursor,
        })
    }

    async fn export_ledger(
        &self,
        filter: &LedgerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        let limit = limit.min(LEDGER_EXPORT_MAX_LIMIT);
        let inner = self.inner.lock().unwrap();
        let mut matched: Vec<LedgerEntry> = inner
            .ledger
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        matched.truncate(limit);
        Ok(matched)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::SystemClock;

    fn repo() -> InMemoryRepository<SystemClock> {
        InMemoryRepository::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn duplicate_tx_hash_is_reported() {
        let repo = repo();
        let payment = Payment {
            id: new_id(),
            request_id: "req-1".to_string(),
            tx_hash: "abc".to_string(),
            amount: crate::amount::Amount::ZERO,
            currency: "USDC".to_string(),
            status: crate::models::PaymentStatus::Confirmed,
            failure_code: None,
            confirmed_at: None,
            created_at: TimestampMs::from_i64(0),
            version: 0,
        };
        repo.create_payment(payment.clone()).await.unwrap().unwrap();
        let mut dup = payment.clone();
        dup.id = new_id();
        let result = repo.create_payment(dup).await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn ledger_query_clamps_limit() {
        let repo = repo();
        for i in 0..10 {
            repo.append_ledger_entry(LedgerEntry {
                id: format!("e{i}"),
                timestamp: TimestampMs::from_i64(i),
                category: LedgerCategory::System,
                event: "tick".to_string(),
                request_id: None,
                payment_id: None,
                tx_hash: None,
                metadata: None,
            })
            .await
            .unwrap();
        }
        let page = repo
            .query_ledger(&LedgerFilter::default(), 0, None)
            .await
            .unwrap();
        assert_eq!(page.entries.len(), 1);
    }

    #[tokio::test]
    async fn broadening_filter_never_shrinks_result_set() {
        let repo = repo();
        repo.append_ledger_entry(LedgerEntry {
            id: "e1".to_string(),
            timestamp: TimestampMs::from_i64(1),
            category: LedgerCategory::Request,
            event: "payment-required".to_string(),
            request_id: Some("r1".to_string()),
            payment_id: None,
            tx_hash: None,
            metadata: None,
        })
        .await
        .unwrap();

        let narrow = LedgerFilter {
            category: Some(LedgerCategory::Request),
            request_id: Some("r1".to_string()),
            ..Default::default()
        };
        let broad = LedgerFilter {
            category: Some(LedgerCategory::Request),
            ..Default::default()
        };

        let narrow_page = repo.query_ledger(&narrow, 500, None).await.unwrap();
        let broad_page = repo.query_ledger(&broad, 500, None).await.unwrap();
        assert!(broad_page.entries.len() >= narrow_page.entries.len());
    }
}
