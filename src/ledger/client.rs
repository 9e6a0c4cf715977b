//! Ledger service client.
//!
//! The chain is consumed through a narrow per-action interface; every call
//! returns a transaction hash or fails on revert. Mutating calls from the
//! planner/executor must be routed through the transaction queue.

use crate::types::CultId;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Domain-action calls against the external ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn record_raid(
        &self,
        attacker: CultId,
        defender: CultId,
        attacker_won: bool,
        spoils: f64,
    ) -> Result<String>;

    async fn create_prophecy(&self, cult: CultId, digest: &str) -> Result<String>;

    async fn resolve_prophecy(&self, prophecy_id: &str, fulfilled: bool) -> Result<String>;

    async fn record_defection(
        &self,
        from_cult: CultId,
        to_cult: CultId,
        defectors: u64,
        reason_digest: &str,
    ) -> Result<String>;

    async fn transfer_token(&self, from_cult: CultId, to_cult: CultId, amount: f64)
        -> Result<String>;
}

/// HTTP implementation against the ledger relay service.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

// -- Request / response types -----------------------------------------------

#[derive(Debug, Serialize)]
struct RaidRequest {
    attacker: CultId,
    defender: CultId,
    attacker_won: bool,
    spoils: f64,
}

#[derive(Debug, Serialize)]
struct ProphecyRequest<'a> {
    cult: CultId,
    digest: &'a str,
}

#[derive(Debug, Serialize)]
struct ResolveProphecyRequest<'a> {
    prophecy_id: &'a str,
    fulfilled: bool,
}

#[derive(Debug, Serialize)]
struct DefectionRequest<'a> {
    from_cult: CultId,
    to_cult: CultId,
    defectors: u64,
    reason_digest: &'a str,
}

#[derive(Debug, Serialize)]
struct TransferRequest {
    from_cult: CultId,
    to_cult: CultId,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    tx_hash: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }

    async fn post_tx<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<String> {
        debug!("Ledger call: {path}");

        let resp = self
            .http
            .post(format!("{}/v1/ledger/{path}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Ledger {path} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Ledger {path} failed ({status}): {body}");
        }

        let body: TxResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse ledger {path} response"))?;
        Ok(body.tx_hash)
    }
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn record_raid(
        &self,
        attacker: CultId,
        defender: CultId,
        attacker_won: bool,
        spoils: f64,
    ) -> Result<String> {
        self.post_tx(
            "raids",
            &RaidRequest {
                attacker,
                defender,
                attacker_won,
                spoils,
            },
        )
        .await
    }

    async fn create_prophecy(&self, cult: CultId, digest: &str) -> Result<String> {
        self.post_tx("prophecies", &ProphecyRequest { cult, digest })
            .await
    }

    async fn resolve_prophecy(&self, prophecy_id: &str, fulfilled: bool) -> Result<String> {
        self.post_tx(
            "prophecies/resolve",
            &ResolveProphecyRequest {
                prophecy_id,
                fulfilled,
            },
        )
        .await
    }

    async fn record_defection(
        &self,
        from_cult: CultId,
        to_cult: CultId,
        defectors: u64,
        reason_digest: &str,
    ) -> Result<String> {
        self.post_tx(
            "defections",
            &DefectionRequest {
                from_cult,
                to_cult,
                defectors,
                reason_digest,
            },
        )
        .await
    }

    async fn transfer_token(
        &self,
        from_cult: CultId,
        to_cult: CultId,
        amount: f64,
    ) -> Result<String> {
        self.post_tx(
            "transfers",
            &TransferRequest {
                from_cult,
                to_cult,
                amount,
            },
        )
        .await
    }
}
