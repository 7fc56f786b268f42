//! Process configuration, loaded from the environment (spec §6).
//!
//! Mirrors the teacher's convention of a single typed config struct built at
//! boot and shared behind an `Arc`, rather than reading `std::env::var`
//! scattered through the codebase.

use std::time::Duration;

use crate::amount::Amount;

#[derive(Clone, Debug)]
pub struct Config {
    pub solana_rpc_url: String,
    pub payment_recipient_public_key: String,
    /// The agent's own wallet, used for balance reads and as the `from` of
    /// every transfer.
    pub wallet_public_key: String,
    /// Base URL of the external signer that actually holds key material and
    /// produces signatures (spec: the signer is an external collaborator).
    /// `None` falls back to the in-memory fake chain client, useful for demos
    /// and local development without a real signer running.
    pub chain_signer_url: Option<String>,
    /// Bounds every chain RPC / signer call (spec §5: default <= 30s).
    pub chain_rpc_timeout: Duration,
    /// Opts into the in-memory fake chain client when no signer is
    /// configured. Without it, an absent signer fails every payment with
    /// `SignerUnavailable` instead of silently running on simulated funds.
    pub allow_fake_chain: bool,

    pub session_expiry: Duration,
    pub session_max_signatures: u32,
    /// Grace period within which an EXPIRED session may still be refreshed
    /// (decided open question, spec §4.3).
    pub session_refresh_grace: Duration,

    pub balance_threshold: Amount,
    pub balance_poll_interval: Duration,

    pub facilitator_base_url: String,
    pub facilitator_secret: Option<String>,

    pub autonomy_queue_interval: Duration,
    pub autonomy_min_run_score: f64,
    pub autonomy_max_backoff: Duration,

    pub admin_api_key: String,
    pub allowed_origins: Vec<String>,

    pub bind_addr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for environment variable {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    /// Loads configuration from environment variables, applying the
    /// defaults documented in spec §6.
    pub fn from_env() -> Result<Self, ConfigError> {
        fn required(key: &'static str) -> Result<String, ConfigError> {
            std::env::var(key).map_err(|_| ConfigError::Missing(key))
        }

        fn optional(key: &str) -> Option<String> {
            std::env::var(key).ok()
        }

        fn with_default<T: std::str::FromStr>(
            key: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match std::env::var(key) {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::Invalid(key, raw)),
                Err(_) => Ok(default),
            }
        }

        let chain_rpc_timeout_secs: u64 = with_default("CHAIN_RPC_TIMEOUT_SECONDS", 30)?;
        let allow_fake_chain: bool = with_default("ALLOW_FAKE_CHAIN", false)?;

        let session_expiry_secs: u64 = with_default("SESSION_EXPIRY_SECONDS", 3600)?;
        let session_max_signatures: u32 = with_default("SESSION_MAX_SIGNATURES", 3)?;
        let balance_threshold_str =
            optional("BALANCE_THRESHOLD").unwrap_or_else(|| "0.05".to_string());
        let balance_threshold = Amount::try_from_str(&balance_threshold_str)
            .map_err(|e| ConfigError::Invalid("BALANCE_THRESHOLD", e.to_string()))?;
        let balance_poll_interval_secs: u64 =
            with_default("BALANCE_POLL_INTERVAL_SECONDS", 30)?;
        let autonomy_queue_interval_secs: u64 =
            with_default("AUTONOMY_QUEUE_INTERVAL_SECONDS", 20)?;
        let autonomy_min_run_score: f64 = with_default("AUTONOMY_MIN_RUN_SCORE", 0.5)?;
        let autonomy_max_backoff_secs: u64 =
            with_default("AUTONOMY_MAX_BACKOFF_SECONDS", 900)?;

        Ok(Self {
            solana_rpc_url: required("SOLANA_RPC_URL")?,
            payment_recipient_public_key: required("PAYMENT_RECIPIENT_PUBLIC_KEY")?,
            wallet_public_key: required("WALLET_PUBLIC_KEY")?,
            chain_signer_url: optional("CHAIN_SIGNER_URL"),
            chain_rpc_timeout: Duration::from_secs(chain_rpc_timeout_secs.clamp(1, 30)),
            allow_fake_chain,

            session_expiry: Duration::from_secs(session_expiry_secs.max(1)),
            session_max_signatures: session_max_signatures.max(1),
            session_refresh_grace: Duration::from_secs(300),

            balance_threshold,
            balance_poll_interval: Duration::from_secs(balance_poll_interval_secs.max(5)),

            facilitator_base_url: optional("FACILITATOR_BASE_URL")
                .unwrap_or_else(|| "https://facilitator.invalid".to_string()),
            facilitator_secret: optional("FACILITATOR_SECRET"),

            autonomy_queue_interval: Duration::from_secs(autonomy_queue_interval_secs.max(5)),
            autonomy_min_run_score,
            autonomy_max_backoff: Duration::from_secs(autonomy_max_backoff_secs.max(1)),

            admin_api_key: optional("ADMIN_API_KEY").unwrap_or_default(),
            allowed_origins: optional("ALLOWED_ORIGINS")
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),

            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
        })
    }
}
