//! Command-line flags, mirroring the teacher's `argh`-based sidecar CLI:
//! everything is optional on the command line and falls back to the
//! environment (see [`agent_core::config::Config::from_env`]).

use std::net::SocketAddr;

/// x402 payment agent
#[derive(argh::FromArgs)]
pub struct AgentArgs {
    /// the <ip-address:port> to listen on. Overrides `BIND_ADDR`.
    #[argh(option)]
    pub bind_addr: Option<SocketAddr>,

    /// path to a `.env` file to load before reading the environment.
    #[argh(option)]
    pub env_file: Option<String>,
}

impl AgentArgs {
    pub fn from_cli() -> Self {
        argh::from_env()
    }
}
