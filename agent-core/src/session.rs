//! Session capability registry (spec §4.3).
//!
//! Issues and tracks bounded, time-limited signing authority. The registry
//! itself holds no shared mutable state beyond the `Repository` handle: each
//! operation reads, checks, and writes back a single row via the
//! repository's optimistic-concurrency contract, retrying on a lost race the
//! same way `PaymentsManager::check -> persist -> commit` serializes updates
//! to a single payment through its data lock.

use std::{sync::Arc, time::Duration};

use tracing::instrument;

use crate::{
    clock::Clock,
    error::AgentError,
    ids::new_id,
    ledger::Ledger,
    models::{LedgerCategory, SessionCapability, SessionStatus},
    repository::Repository,
};

pub struct SessionRegistry<C: Clock> {
    repo: Arc<dyn Repository>,
    ledger: Arc<Ledger<C>>,
    clock: Arc<C>,
}

impl<C: Clock> SessionRegistry<C> {
    pub fn new(repo: Arc<dyn Repository>, ledger: Arc<Ledger<C>>, clock: Arc<C>) -> Self {
        Self { repo, ledger, clock }
    }

    #[instrument(skip(self))]
    pub async fn issue(
        &self,
        wallet_key: String,
        session_key: String,
        nonce: u64,
        max_signatures: u32,
        ttl: Duration,
    ) -> anyhow::Result<SessionCapability> {
        let now = self.clock.now();
        let session = SessionCapability {
            id: new_id(),
            wallet_key,
            session_key,
            nonce,
            max_signatures,
            signatures_used: 0,
            status: SessionStatus::Active,
            expires_at: now.plus_secs(ttl.as_secs()),
            version: 0,
        };
        let session = self.repo.create_session(session).await?;

        self.ledger
            .append(
                LedgerCategory::System,
                "session-issued",
                None,
                None,
                None,
                Some(serde_json::json!({
                    "sessionId": session.id,
                    "walletKey": session.wallet_key,
                    "maxSignatures": session.max_signatures,
                })),
            )
            .await?;

        Ok(session)
    }

    /// Returns the capability iff it is currently usable, transitioning it
    /// to EXPIRED or EXHAUSTED as a side effect when it is not.
    #[instrument(skip(self))]
    pub async fn get_active(&self, id: &str) -> anyhow::Result<Option<SessionCapability>> {
        let Some(session) = self.repo.get_session(id).await? else {
            return Ok(None);
        };
        if session.status != SessionStatus::Active {
            return Ok(None);
        }

        let now = self.clock.now();
        if now >= session.expires_at {
            let mut expired = session;
            expired.status = SessionStatus::Expired;
            let _ = self.repo.update_session(expired).await?;
            return Ok(None);
        }
        if session.signatures_used >= session.max_signatures {
            let mut exhausted = session;
            exhausted.status = SessionStatus::Exhausted;
            let _ = self.repo.update_session(exhausted).await?;
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Atomically increments usage, retrying on a lost optimistic-concurrency
    /// race (another caller incrementing the same session concurrently).
    #[instrument(skip(self))]
    pub async fn increment_usage(&self, id: &str) -> Result<SessionCapability, AgentError> {
        for _ in 0..8 {
            let session = self
                .repo
                .get_session(id)
                .await
                .map_err(AgentError::RepositoryTransient)?
                .ok_or(AgentError::SessionInvalid)?;

            if session.status != SessionStatus::Active {
                return Err(AgentError::SessionInvalid);
            }

            let mut updated = session;
            updated.signatures_used += 1;
            if updated.signatures_used >= updated.max_signatures {
                updated.status = SessionStatus::Exhausted;
            }

            match self
                .repo
                .update_session(updated)
                .await
                .map_err(AgentError::RepositoryTransient)?
            {
                Ok(session) => return Ok(session),
                Err(_conflict) => continue,
            }
        }
        Err(AgentError::SessionInvalid)
    }

    /// Refresh policy (decided open question, spec §4.3 / §9): refreshable
    /// from ACTIVE, or from EXPIRED within `grace` of its expiry. Any other
    /// state fails `SessionNotRefreshable`.
    #[instrument(skip(self))]
    pub async fn refresh(
        &self,
        id: &str,
        ttl: Duration,
        grace: Duration,
    ) -> Result<SessionCapability, AgentError> {
        let session = self
            .repo
            .get_session(id)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .ok_or(AgentError::SessionInvalid)?;

        let now = self.clock.now();
        let refreshable = match session.status {
            SessionStatus::Active => true,
            SessionStatus::Expired => now <= session.expires_at.plus_secs(grace.as_secs()),
            SessionStatus::Exhausted | SessionStatus::Revoked => false,
        };
        if !refreshable {
            return Err(AgentError::SessionNotRefreshable);
        }

        let mut updated = session;
        updated.status = SessionStatus::Active;
        updated.expires_at = now.plus_secs(ttl.as_secs());
        self.repo
            .update_session(updated)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .map_err(|_conflict| AgentError::SessionNotRefreshable)
    }

    #[instrument(skip(self))]
    pub async fn revoke(&self, id: &str) -> Result<SessionCapability, AgentError> {
        let session = self
            .repo
            .get_session(id)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .ok_or(AgentError::SessionInvalid)?;
        let mut revoked = session;
        revoked.status = SessionStatus::Revoked;
        self.repo
            .update_session(revoked)
            .await
            .map_err(AgentError::RepositoryTransient)?
            .map_err(|_conflict| AgentError::SessionInvalid)
    }
}
