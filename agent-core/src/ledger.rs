//! Append-only observability log (spec §4.1).
//!
//! [`Ledger`] is a thin actor over the [`Repository`]'s ledger table: it
//! commits the entry first, then publishes to the [`EventBus`]. Per the
//! cyclic-reference design note in spec §9, the bus is a pure sink here —
//! the ledger never subscribes to anything, so there is no possibility of a
//! publish-triggers-append loop.

use std::sync::Arc;

use crate::{
    bus::{Event, EventBus},
    clock::Clock,
    ids::new_id,
    models::{LedgerCategory, LedgerEntry},
    repository::{LedgerFilter, LedgerPage, Repository},
};

pub struct Ledger<C: Clock> {
    repo: Arc<dyn Repository>,
    bus: EventBus,
    clock: Arc<C>,
}

impl<C: Clock> Ledger<C> {
    pub fn new(repo: Arc<dyn Repository>, bus: EventBus, clock: Arc<C>) -> Self {
        Self { repo, bus, clock }
    }

    /// Appends a single event. Persistence failure propagates; it is never
    /// swallowed.
    pub async fn append(
        &self,
        category: LedgerCategory,
        event: impl Into<String>,
        request_id: Option<String>,
        payment_id: Option<String>,
        tx_hash: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> anyhow::Result<LedgerEntry> {
        let entry = LedgerEntry {
            id: new_id(),
            timestamp: self.clock.now(),
            category,
            event: event.into(),
            request_id,
            payment_id,
            tx_hash,
            metadata,
        };
        self.repo.append_ledger_entry(entry.clone()).await?;
        self.bus.publish(Event::LedgerEntry(entry.clone()));
        Ok(entry)
    }

    pub async fn query(
        &self,
        filter: &LedgerFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> anyhow::Result<LedgerPage> {
        self.repo.query_ledger(filter, limit, cursor).await
    }

    pub async fn export(
        &self,
        filter: &LedgerFilter,
        limit: usize,
    ) -> anyhow::Result<Vec<LedgerEntry>> {
        self.repo.export_ledger(filter, limit).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::{FakeClock, TimestampMs};
    use crate::repository::InMemoryRepository;

    #[tokio::test]
    async fn append_publishes_to_bus() {
        let clock = Arc::new(FakeClock::new(TimestampMs::from_i64(0)));
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new(clock.clone()));
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let ledger = Ledger::new(repo, bus, clock);

        ledger
            .append(LedgerCategory::System, "payments-paused", None, None, None, None)
            .await
            .unwrap();

        let event = sub.recv().await.unwrap();
        match event {
            Event::LedgerEntry(entry) => assert_eq!(entry.event, "payments-paused"),
            _ => panic!("expected a ledger-entry event"),
        }
    }
}
