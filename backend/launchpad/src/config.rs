//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{LaunchpadError, Result};
use crate::rules::is_hex_address;

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// JSON pinning endpoint; `None` keeps snapshots in process memory
    pub pinning_api_url: Option<String>,
    /// Bearer token sent to the pinning endpoint
    pub pinning_jwt: Option<String>,
    /// Host used to build `https://<cid>.ipfs.<host>` gateway links
    pub ipfs_gateway_host: Option<String>,
    /// JSON-RPC endpoint of the deployment gateway
    pub ledger_rpc_url: String,
    /// Project factory contract (0x-prefixed)
    pub factory_address: String,
    /// Chain the factory lives on
    pub chain_id: u64,
    /// Remote wallet signer endpoint
    pub signer_url: String,
    /// Address the signer submits transactions from
    pub signer_address: String,
    pub defaults: FundingDefaults,
    pub timeouts: Timeouts,
}

/// Platform defaults applied when a draft leaves a funding field unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundingDefaults {
    /// Currency label that may omit an explicit token address
    pub currency: String,
    /// Accepted token used for the default currency
    pub token_address: Option<String>,
    pub stamp_uri: String,
    pub vote_duration_days: u32,
    pub quorum_bps: u16,
}

impl Default for FundingDefaults {
    fn default() -> Self {
        Self {
            currency: "USDC".to_string(),
            token_address: None,
            stamp_uri: String::new(),
            vote_duration_days: 7,
            quorum_bps: 2000,
        }
    }
}

/// Bounds on the blocking waits of an opening attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub publish: Duration,
    pub finality: Duration,
    pub receipt_poll: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            publish: Duration::from_secs(30),
            finality: Duration::from_secs(180),
            receipt_poll: Duration::from_millis(2000),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |key: &str| {
            var(key).ok_or_else(|| {
                LaunchpadError::Config(format!("{key} environment variable is required"))
            })
        };

        let factory_address = required("FACTORY_ADDRESS")?.to_lowercase();
        if !is_hex_address(&factory_address) {
            return Err(LaunchpadError::Config("Invalid FACTORY_ADDRESS".to_string()));
        }

        let default_token_address = var("DEFAULT_TOKEN_ADDRESS").map(|v| v.to_lowercase());
        if let Some(addr) = &default_token_address {
            if !is_hex_address(addr) {
                return Err(LaunchpadError::Config(
                    "Invalid DEFAULT_TOKEN_ADDRESS".to_string(),
                ));
            }
        }

        let base = FundingDefaults::default();
        let defaults = FundingDefaults {
            currency: var("DEFAULT_CURRENCY").unwrap_or(base.currency),
            token_address: default_token_address,
            stamp_uri: var("DEFAULT_STAMP_URI").unwrap_or(base.stamp_uri),
            vote_duration_days: parse_or(
                var("DEFAULT_VOTE_DURATION_DAYS"),
                "DEFAULT_VOTE_DURATION_DAYS",
                base.vote_duration_days,
            )?,
            quorum_bps: parse_or(var("DEFAULT_QUORUM_BPS"), "DEFAULT_QUORUM_BPS", base.quorum_bps)?,
        };

        let timeouts = Timeouts {
            publish: Duration::from_secs(parse_or(
                var("PUBLISH_TIMEOUT_SECS"),
                "PUBLISH_TIMEOUT_SECS",
                30,
            )?),
            finality: Duration::from_secs(parse_or(
                var("FINALITY_TIMEOUT_SECS"),
                "FINALITY_TIMEOUT_SECS",
                180,
            )?),
            receipt_poll: Duration::from_millis(parse_or(
                var("RECEIPT_POLL_INTERVAL_MS"),
                "RECEIPT_POLL_INTERVAL_MS",
                2000,
            )?),
        };

        Ok(Config {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./launchpad.db".to_string()),
            api_port: parse_or(var("API_PORT"), "API_PORT", 3002)?,
            pinning_api_url: var("PINNING_API_URL"),
            pinning_jwt: var("PINNING_JWT"),
            ipfs_gateway_host: var("IPFS_GATEWAY_HOST"),
            ledger_rpc_url: required("LEDGER_RPC_URL")?,
            factory_address,
            chain_id: parse_or(var("CHAIN_ID"), "CHAIN_ID", 137)?,
            signer_url: required("SIGNER_URL")?,
            signer_address: required("SIGNER_ADDRESS")?.to_lowercase(),
            defaults,
            timeouts,
        })
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| LaunchpadError::Config(format!("Invalid {key}"))),
    }
}
