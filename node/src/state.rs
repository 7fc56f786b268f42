//! Process-wide wiring: every shared component lives behind an `Arc` in
//! [`AppState`], cloned cheaply into each axum handler and background task —
//! the same shape as the teacher's `Arc<RouterState>`.

use std::sync::Arc;

use agent_core::{
    balance::BalanceMonitor,
    bus::EventBus,
    chain::ChainClient,
    clock::SystemClock,
    config::Config,
    coordinator::RequestCoordinator,
    executor::PaymentExecutor,
    facilitator::FacilitatorClient,
    ledger::Ledger,
    repository::{InMemoryRepository, Repository},
    scheduler::Scheduler,
    session::SessionRegistry,
};

pub struct AppState {
    pub config: Config,
    pub repo: Arc<dyn Repository>,
    pub bus: EventBus,
    pub clock: Arc<SystemClock>,
    pub ledger: Arc<Ledger<SystemClock>>,
    pub balance: Arc<BalanceMonitor<SystemClock>>,
    pub sessions: Arc<SessionRegistry<SystemClock>>,
    pub coordinator: Arc<RequestCoordinator<SystemClock>>,
    pub executor: Arc<PaymentExecutor<SystemClock>>,
    pub scheduler: Arc<Scheduler<SystemClock>>,
    pub facilitator: Arc<FacilitatorClient<SystemClock>>,
}

impl AppState {
    pub fn new(config: Config, chain: Arc<dyn ChainClient>) -> Self {
        let clock = Arc::new(SystemClock);
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new(clock.clone()));
        let bus = EventBus::new();
        let ledger = Arc::new(Ledger::new(repo.clone(), bus.clone(), clock.clone()));

        let balance = Arc::new(BalanceMonitor::new(
            repo.clone(),
            chain.clone(),
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            config.balance_threshold,
        ));
        let sessions = Arc::new(SessionRegistry::new(repo.clone(), ledger.clone(), clock.clone()));
        let coordinator = Arc::new(RequestCoordinator::new(
            repo.clone(),
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            &config.facilitator_base_url,
        ));
        let facilitator = Arc::new(FacilitatorClient::new(
            config.facilitator_base_url.clone(),
            config.facilitator_secret.clone(),
            ledger.clone(),
            std::time::Duration::from_secs(10),
        ));
        let executor = Arc::new(PaymentExecutor::new(
            repo.clone(),
            chain.clone(),
            balance.clone(),
            sessions.clone(),
            ledger.clone(),
            bus.clone(),
            clock.clone(),
            facilitator.clone(),
            config.payment_recipient_public_key.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            repo.clone(),
            coordinator.clone(),
            executor.clone(),
            sessions.clone(),
            ledger.clone(),
            balance.clone(),
            clock.clone(),
            config.autonomy_min_run_score,
            config.autonomy_max_backoff.as_secs(),
        ));

        Self {
            config,
            repo,
            bus,
            clock,
            ledger,
            balance,
            sessions,
            coordinator,
            executor,
            scheduler,
            facilitator,
        }
    }

    /// Loads `SystemState` into the balance monitor's in-memory mirror and
    /// registers the closed catalog's autonomy tasks. Call once at boot.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        self.balance.bootstrap().await?;

        for (endpoint, entry) in agent_core::coordinator::catalog(&self.config.facilitator_base_url) {
            let now = self.clock_now();
            self.scheduler
                .register_task(agent_core::models::AutonomyTask {
                    endpoint: endpoint.to_string(),
                    value_score: 1.0,
                    cost: rust_decimal::prelude::ToPrimitive::to_f64(&entry.price.as_decimal())
                        .unwrap_or(1.0),
                    freshness_window_secs: 300,
                    base_backoff_secs: 10,
                    status: agent_core::models::TaskStatus::Idle,
                    last_run_at: None,
                    last_success_at: None,
                    failure_count: 0,
                    next_eligible_at: now,
                    locked_at: None,
                    last_error: None,
                    last_score: None,
                    version: 0,
                })
                .await?;
        }
        Ok(())
    }

    fn clock_now(&self) -> agent_core::clock::TimestampMs {
        use agent_core::clock::Clock;
        self.clock.now()
    }
}
