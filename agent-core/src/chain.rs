//! The narrow seam to the external chain RPC / signer.
//!
//! [`ChainClient`] is deliberately small: the spec treats "the simulated
//! premium endpoints" and the chain RPC itself as external collaborators, so
//! the core only needs a trait boundary to mock against in tests, the same
//! way `lexe-ln::traits::LexeChannelManager` lets `PaymentsManager` be
//! exercised without a live Lightning node.

use async_trait::async_trait;

/// The outcome of submitting and confirming a transfer on-chain.
#[derive(Clone, Debug)]
pub struct ChainTransfer {
    pub signature: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain rejected the transaction: {0}")]
    Rejected(String),
    #[error("timed out waiting for confirmation")]
    Timeout,
    #[error("no signer is configured for this chain client")]
    SignerUnavailable,
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    /// Queries the signer's balance, in the chain's smallest unit.
    async fn get_balance_lamports(&self) -> Result<u64, ChainError>;

    /// Builds, signs, submits, and awaits confirmation of a transfer of
    /// `amount_lamports` from the configured signer to `recipient`, at the
    /// configured commitment level, within the caller's deadline.
    async fn submit_transfer(
        &self,
        recipient: &str,
        amount_lamports: u64,
    ) -> Result<ChainTransfer, ChainError>;
}

/// Used when no signer endpoint is configured and the demo fallback isn't
/// opted into (spec §4.6 step 3): every call fails with
/// `ChainError::SignerUnavailable` rather than silently running against a
/// simulated balance.
pub struct NoSignerChainClient;

#[async_trait]
impl ChainClient for NoSignerChainClient {
    async fn get_balance_lamports(&self) -> Result<u64, ChainError> {
        Err(ChainError::SignerUnavailable)
    }

    async fn submit_transfer(
        &self,
        _recipient: &str,
        _amount_lamports: u64,
    ) -> Result<ChainTransfer, ChainError> {
        Err(ChainError::SignerUnavailable)
    }
}

/// A fake chain client for tests and the demo binary: balances and transfers
/// are tracked in-memory, no network call is made.
pub mod fake {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::ids::new_id;

    pub struct FakeChainClient {
        balance_lamports: AtomicU64,
        /// When `true`, the next `submit_transfer` call fails with
        /// `ChainError::Rejected`, for exercising the executor's failure path.
        pub fail_next_submit: std::sync::atomic::AtomicBool,
    }

    impl FakeChainClient {
        pub fn new(initial_balance_lamports: u64) -> Self {
            Self {
                balance_lamports: AtomicU64::new(initial_balance_lamports),
                fail_next_submit: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub fn set_balance_lamports(&self, lamports: u64) {
            self.balance_lamports.store(lamports, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainClient for FakeChainClient {
        async fn get_balance_lamports(&self) -> Result<u64, ChainError> {
            Ok(self.balance_lamports.load(Ordering::SeqCst))
        }

        async fn submit_transfer(
            &self,
            _recipient: &str,
            amount_lamports: u64,
        ) -> Result<ChainTransfer, ChainError> {
            if self.fail_next_submit.swap(false, Ordering::SeqCst) {
                return Err(ChainError::Rejected("simulated rejection".to_string()));
            }
            let current = self.balance_lamports.load(Ordering::SeqCst);
            if current < amount_lamports {
                return Err(ChainError::Rejected("insufficient funds".to_string()));
            }
            self.balance_lamports
                .fetch_sub(amount_lamports, Ordering::SeqCst);
            Ok(ChainTransfer {
                signature: hex_signature(),
            })
        }
    }

    fn hex_signature() -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(new_id().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// A devnet-facing [`ChainClient`]. Balance reads go straight to the RPC's
/// `getBalance` JSON-RPC method over `reqwest`. Signing and submission are
/// delegated to an external signer endpoint — the spec treats "the signer"
/// itself as an external collaborator, the same way the teacher never
/// re-implements Bitcoin Core's wallet inside `node`, only calls out to it.
pub mod http {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    pub struct HttpChainClient {
        http: reqwest::Client,
        rpc_url: String,
        wallet_public_key: String,
        signer_url: String,
        /// Bounds both the balance read and the submit call (spec §5: chain
        /// submit/confirm defaults to <= 30s).
        timeout: std::time::Duration,
    }

    impl HttpChainClient {
        pub fn new(
            rpc_url: String,
            wallet_public_key: String,
            signer_url: String,
            timeout: std::time::Duration,
        ) -> Self {
            Self {
                http: reqwest::Client::new(),
                rpc_url,
                wallet_public_key,
                signer_url,
                timeout,
            }
        }
    }

    #[derive(Deserialize)]
    struct RpcResponse<T> {
        result: T,
    }

    #[derive(Deserialize)]
    struct BalanceResult {
        value: u64,
    }

    #[derive(Deserialize)]
    struct SignerResponse {
        signature: String,
    }

    #[async_trait]
    impl ChainClient for HttpChainClient {
        async fn get_balance_lamports(&self) -> Result<u64, ChainError> {
            let body = json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "getBalance",
                "params": [self.wallet_public_key],
            });
            let resp: RpcResponse<BalanceResult> = self
                .http
                .post(&self.rpc_url)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| ChainError::Transport(e.into()))?
                .error_for_status()
                .map_err(|e| ChainError::Transport(e.into()))?
                .json()
                .await
                .map_err(|e| ChainError::Transport(e.into()))?;
            Ok(resp.result.value)
        }

        async fn submit_transfer(
            &self,
            recipient: &str,
            amount_lamports: u64,
        ) -> Result<ChainTransfer, ChainError> {
            let body = json!({
                "from": self.wallet_public_key,
                "recipient": recipient,
                "amountLamports": amount_lamports,
            });
            let resp = self
                .http
                .post(&self.signer_url)
                .timeout(self.timeout)
                .json(&body)
                .send()
                .await
                .map_err(|e| ChainError::Transport(e.into()))?;

            if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
                let reason = resp.text().await.unwrap_or_default();
                return Err(ChainError::Rejected(reason));
            }

            let signed: SignerResponse = resp
                .error_for_status()
                .map_err(|e| ChainError::Transport(e.into()))?
                .json()
                .await
                .map_err(|e| ChainError::Transport(e.into()))?;
            Ok(ChainTransfer {
                signature: signed.signature,
            })
        }
    }
}
