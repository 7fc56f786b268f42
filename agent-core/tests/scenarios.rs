//! End-to-end scenarios driving the in-memory repository through every
//! component together, the concrete seeds called out for the test suite:
//! happy-path market flow, low-balance pause, facilitator-callback
//! reconciliation, session exhaustion, backoff progression, and duplicate
//! tx_hash reconciliation.

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use agent_core::{
    amount::Amount,
    balance::BalanceMonitor,
    bus::{Event, EventBus},
    chain::{fake::FakeChainClient, ChainClient},
    clock::{Clock, FakeClock, TimestampMs},
    coordinator::RequestCoordinator,
    executor::PaymentExecutor,
    ledger::Ledger,
    models::{AutonomyTask, LedgerCategory, PaymentStatus, RequestStatus, SessionStatus, TaskStatus},
    repository::{InMemoryRepository, LedgerFilter, Repository},
    scheduler::{self, Scheduler},
    session::SessionRegistry,
    AgentError,
};

struct Harness {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    clock: Arc<FakeClock>,
    ledger: Arc<Ledger<FakeClock>>,
    balance: Arc<BalanceMonitor<FakeClock>>,
    sessions: Arc<SessionRegistry<FakeClock>>,
    coordinator: Arc<RequestCoordinator<FakeClock>>,
    executor: Arc<PaymentExecutor<FakeClock>>,
    scheduler: Arc<Scheduler<FakeClock>>,
    chain: Arc<FakeChainClient>,
}

fn harness(initial_lamports: u64, threshold: &str) -> Harness {
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
        Amount::try_from_str(threshold).unwrap(),
    ));
    let sessions = Arc::new(SessionRegistry::new(repo.clone(), ledger.clone(), clock.clone()));
    let coordinator = Arc::new(RequestCoordinator::new(
        repo.clone(),
        ledger.clone(),
        bus.clone(),
        clock.clone(),
        "https://facilitator.invalid",
    ));
    let facilitator = Arc::new(agent_core::facilitator::FacilitatorClient::new(
        "https://facilitator.invalid".to_string(),
        None,
        ledger.clone(),
        Duration::from_secs(10),
    ));
    let executor = Arc::new(PaymentExecutor::new(
        repo.clone(),
        chain_dyn,
        balance.clone(),
        sessions.clone(),
        ledger.clone(),
        bus.clone(),
        clock.clone(),
        facilitator,
        "recipient-pubkey".to_string(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        coordinator.clone(),
        executor.clone(),
        sessions.clone(),
        ledger.clone(),
        balance.clone(),
        clock.clone(),
        0.5,
        900,
    ));

    Harness {
        repo,
        bus,
        clock,
        ledger,
        balance,
        sessions,
        coordinator,
        executor,
        scheduler,
        chain,
    }
}

// --- A. Happy-path single request (market) --- //

#[tokio::test]
async fn a_happy_path_market_request() {
    let h = harness(1_000_000_000, "0.01");

    let request = h.coordinator.request_or_advance("market", None).await.unwrap();
    assert_eq!(request.status, RequestStatus::PaymentRequired);
    assert_eq!(request.amount, Amount::try_from_str("0.05").unwrap());
    assert_eq!(request.currency, "USDC");

    let filter = LedgerFilter::default();
    let page = h.ledger.query(&filter, 50, None).await.unwrap();
    let created = page
        .entries
        .iter()
        .filter(|e| e.category == LedgerCategory::Request && e.event == "payment-required")
        .count();
    assert_eq!(created, 1);

    let executed = h.executor.clone().execute(&request.id, None).await.unwrap();
    assert_eq!(executed.status, RequestStatus::Paid);
    let tx_hash = executed.payment_hash.clone().unwrap();
    assert_eq!(tx_hash.len(), 64);

    let balance_after = h.chain.get_balance_lamports().await.unwrap();
    assert_eq!(balance_after, 1_000_000_000 - Amount::try_from_str("0.05").unwrap().to_lamports().unwrap());

    // request_or_advance is what drives PAID -> FULFILLED, attaching the
    // catalog payload and recording the transition (spec §4.7 step 2).
    let fulfilled = h
        .coordinator
        .request_or_advance("market", Some(&request.id))
        .await
        .unwrap();
    assert_eq!(fulfilled.status, RequestStatus::Fulfilled);
    let payload = fulfilled.data_payload.unwrap();
    assert!(payload.get("prices").is_some());
    assert!(payload.get("arbitrageSignals").is_some());
    assert!(payload.get("sentiment").is_some());

    let page = h.ledger.query(&LedgerFilter::default(), 50, None).await.unwrap();
    assert_eq!(
        page.entries
            .iter()
            .filter(|e| e.category == LedgerCategory::Request && e.event == "data-fulfilled")
            .count(),
        1
    );
}

// --- B. Low balance pauses --- //

#[tokio::test]
async fn b_low_balance_pauses_and_blocks_execution_and_scheduling() {
    let h = harness(1_000_000, "0.05"); // 0.001 SOL, below threshold
    h.balance.poll_once().await;

    let request = h.coordinator.request_or_advance("market", None).await.unwrap();
    let err = h.executor.clone().execute(&request.id, None).await.unwrap_err();
    match err {
        AgentError::PaymentsPaused(reason) => assert_eq!(reason.to_string(), "LOW_BALANCE"),
        other => panic!("expected PaymentsPaused, got {other:?}"),
    }

    h.scheduler
        .register_task(autonomy_task("market", 0))
        .await
        .unwrap();
    let mut sub = h.bus.subscribe();
    h.scheduler.tick().await;

    let tasks = h.repo.list_tasks().await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Idle); // never claimed: ensure_payments_active trips first
    assert!(tasks[0].last_run_at.is_none());

    // No queue-update or payment-status event was published by the tick.
    let drained = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
    assert!(drained.is_err(), "expected no event from a skipped tick");
}

// --- C. Facilitator callback confirms a previously-timed-out payment --- //

#[tokio::test]
async fn c_facilitator_callback_confirms_a_failed_payment() {
    let h = harness(1_000_000_000, "0.01");
    let request = h.coordinator.request_or_advance("market", None).await.unwrap();

    h.chain.fail_next_submit.store(true, Ordering::SeqCst);
    let _ = h.executor.clone().execute(&request.id, None).await.unwrap_err();

    let stored_request = h.repo.get_request(&request.id).await.unwrap().unwrap();
    assert_eq!(stored_request.status, RequestStatus::Failed);

    let page = h.ledger.query(&LedgerFilter::default(), 50, None).await.unwrap();
    let failed_payment = page
        .entries
        .iter()
        .find(|e| e.event == "payment-failed")
        .and_then(|e| e.payment_id.clone())
        .unwrap();
    let payment = h.repo.get_payment(&failed_payment).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Failed);

    let mut sub = h.bus.subscribe();
    h.coordinator.reconcile_callback(&payment.tx_hash).await.unwrap();

    let reconfirmed = h.repo.get_payment(&payment.id).await.unwrap().unwrap();
    assert_eq!(reconfirmed.status, PaymentStatus::Confirmed);
    assert!(reconfirmed.confirmed_at.is_some());

    let page = h.ledger.query(&LedgerFilter::default(), 50, None).await.unwrap();
    let callback_entries = page.entries.iter().filter(|e| e.event == "facilitator-callback").count();
    assert_eq!(callback_entries, 1);

    let mut saw_confirmed = false;
    while let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await {
        if let Event::PaymentStatus { status, .. } = event {
            if status == "CONFIRMED" {
                saw_confirmed = true;
            }
        }
    }
    assert!(saw_confirmed);

    // Idempotent: applying the same callback again only adds a "duplicate" entry.
    h.coordinator.reconcile_callback(&payment.tx_hash).await.unwrap();
    let page = h.ledger.query(&LedgerFilter::default(), 500, None).await.unwrap();
    assert_eq!(
        page.entries.iter().filter(|e| e.event == "facilitator-callback").count(),
        1
    );
    assert_eq!(
        page.entries
            .iter()
            .filter(|e| e.event == "facilitator-callback-duplicate")
            .count(),
        1
    );
}

// --- D. Session exhaustion --- //

#[tokio::test]
async fn d_session_exhaustion_rejects_a_second_execution() {
    let h = harness(1_000_000_000, "0.01");
    let session = h
        .sessions
        .issue("wallet".into(), "session".into(), 1, 1, Duration::from_secs(3600))
        .await
        .unwrap();

    let first = h.coordinator.request_or_advance("market", None).await.unwrap();
    let executed = h.executor.clone().execute(&first.id, Some(&session.id)).await.unwrap();
    assert_eq!(executed.status, RequestStatus::Paid);

    let after_first = h.sessions.get_active(&session.id).await.unwrap();
    assert!(after_first.is_none()); // exhausted
    let stored_session = h.repo.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(stored_session.status, SessionStatus::Exhausted);

    let second = h.coordinator.request_or_advance("market", None).await.unwrap();
    let payment_events_before = count_payment_events(&h).await;

    let err = h
        .executor
        .clone()
        .execute(&second.id, Some(&session.id))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::SessionInvalid));

    let second_stored = h.repo.get_request(&second.id).await.unwrap().unwrap();
    assert_eq!(second_stored.status, RequestStatus::PaymentRequired); // no spurious PAYMENT transition
    assert_eq!(count_payment_events(&h).await, payment_events_before); // no spurious Payment row
}

async fn count_payment_events(h: &Harness) -> usize {
    h.ledger
        .query(&LedgerFilter::default(), 500, None)
        .await
        .unwrap()
        .entries
        .iter()
        .filter(|e| e.category == LedgerCategory::Payment)
        .count()
}

// --- E. Backoff progression --- //

#[test]
fn e_backoff_progression_matches_exponential_schedule_with_cap() {
    assert_eq!(scheduler::backoff_secs(30, 1, 900), 30);
    assert_eq!(scheduler::backoff_secs(30, 2, 900), 60);
    assert_eq!(scheduler::backoff_secs(30, 3, 900), 120);
    assert_eq!(scheduler::backoff_secs(30, 4, 900), 240);
    assert_eq!(scheduler::backoff_secs(30, 20, 900), 900);
}

#[tokio::test]
async fn e_backoff_progression_drives_next_eligible_at_through_the_scheduler() {
    let h = harness(1_000_000_000, "0.01");
    h.scheduler
        .register_task(autonomy_task("market", 30))
        .await
        .unwrap();

    // Force three consecutive chain rejections, then let the fourth tick
    // through to succeed.
    let expected_backoff = [30u64, 60, 120];
    for expected in expected_backoff {
        h.chain.fail_next_submit.store(true, Ordering::SeqCst);
        let before = h.clock.now();
        h.scheduler.tick().await;
        let task = h.repo.find_task("market").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Backoff);
        assert_eq!(
            task.next_eligible_at.as_i64() - before.as_i64(),
            (expected as i64) * 1000
        );
        h.clock.advance_secs(expected + 1);
    }

    let task = h.repo.find_task("market").await.unwrap().unwrap();
    assert_eq!(task.failure_count, 3);

    h.scheduler.tick().await;

    let task = h.repo.find_task("market").await.unwrap().unwrap();
    assert_eq!(task.failure_count, 0);
    assert_eq!(task.status, TaskStatus::Idle);
}

fn autonomy_task(endpoint: &str, base_backoff_secs: u64) -> AutonomyTask {
    AutonomyTask {
        endpoint: endpoint.to_string(),
        value_score: 1.0,
        cost: 0.05,
        freshness_window_secs: 300,
        base_backoff_secs,
        status: TaskStatus::Idle,
        last_run_at: None,
        last_success_at: None,
        failure_count: 0,
        next_eligible_at: TimestampMs::from_i64(0),
        locked_at: None,
        last_error: None,
        last_score: None,
        version: 0,
    }
}

// --- F. Duplicate tx_hash reconciles --- //

#[tokio::test]
async fn f_duplicate_tx_hash_reconciles_instead_of_erroring() {
    let clock = Arc::new(FakeClock::new(TimestampMs::from_i64(0)));
    let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new(clock.clone()));

    let request = repo
        .create_request(agent_core::models::PremiumRequest {
            id: "req-1".to_string(),
            endpoint: "market".to_string(),
            status: RequestStatus::PaymentRequired,
            amount: Amount::try_from_str("0.05").unwrap(),
            currency: "USDC".to_string(),
            facilitator_url: String::new(),
            payment_hash: None,
            data_payload: None,
            created_at: clock.now(),
            updated_at: clock.now(),
            version: 0,
        })
        .await
        .unwrap();

    let existing = repo
        .create_payment(agent_core::models::Payment {
            id: "pay-existing".to_string(),
            request_id: request.id.clone(),
            tx_hash: "shared-signature".to_string(),
            amount: request.amount,
            currency: "USDC".to_string(),
            status: PaymentStatus::Confirmed,
            failure_code: None,
            confirmed_at: Some(clock.now()),
            created_at: clock.now(),
            version: 0,
        })
        .await
        .unwrap()
        .unwrap();

    // A second insert with the same tx_hash reports the conflict rather than
    // creating a second row.
    let result = repo
        .create_payment(agent_core::models::Payment {
            id: "pay-new".to_string(),
            request_id: request.id.clone(),
            tx_hash: "shared-signature".to_string(),
            amount: request.amount,
            currency: "USDC".to_string(),
            status: PaymentStatus::Confirmed,
            failure_code: None,
            confirmed_at: Some(clock.now()),
            created_at: clock.now(),
            version: 0,
        })
        .await
        .unwrap();

    let duplicate = result.unwrap_err();
    assert_eq!(duplicate.0.id, existing.id);

    let all_payments_with_hash = repo.get_payment_by_tx_hash("shared-signature").await.unwrap();
    assert_eq!(all_payments_with_hash.unwrap().id, existing.id);
}
