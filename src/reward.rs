//! Uptime-gated reward issuance.
//!
//! The evaluator compares this run's client uptime against the wall-clock
//! window since the last reward (or since the agent was first started) and
//! pays out through a [`RewardIssuer`] once the window is both long enough
//! and well enough covered.

use crate::config::RewardConfig;
use crate::connection::{ConnectionManager, OutboundKind, Priority};
use crate::error::{AgentError, Result};
use crate::state::StateHandle;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transaction identifier returned by a [`RewardIssuer`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Settlement state of an issued reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub confirmed: bool,
    pub status: String,
}

/// Pays rewards and checks their settlement.
#[async_trait]
pub trait RewardIssuer: Send + Sync {
    async fn send(&self, amount: f64) -> Result<TxId>;
    async fn verify(&self, tx: &TxId) -> Result<Verification>;
}

/// Dry-run issuer: logs the payout and invents a transaction id.
#[derive(Debug, Clone, Default)]
pub struct LoggingRewardIssuer;

#[async_trait]
impl RewardIssuer for LoggingRewardIssuer {
    async fn send(&self, amount: f64) -> Result<TxId> {
        let tx = TxId(uuid::Uuid::new_v4().to_string());
        info!(tx = %tx, amount, "reward issued (dry run)");
        Ok(tx)
    }

    async fn verify(&self, tx: &TxId) -> Result<Verification> {
        debug!(tx = %tx, "verifying reward (dry run)");
        Ok(Verification {
            confirmed: true,
            status: "confirmed".to_owned(),
        })
    }
}

/// Client uptime as a percentage of the elapsed window.
///
/// Returns `None` for an empty window.
pub fn uptime_percent(client_uptime_secs: u64, elapsed: chrono::Duration) -> Option<f64> {
    let elapsed_ms = elapsed.num_milliseconds();
    if elapsed_ms <= 0 {
        return None;
    }
    Some(client_uptime_secs as f64 * 100_000.0 / elapsed_ms as f64)
}

/// Outcome of one [`RewardEvaluator::evaluate`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// The last reward is more recent than the reward interval.
    NotDue,
    /// No snapshot yet, or the window is empty.
    NoData,
    /// Uptime did not reach the threshold; the window stays open.
    BelowThreshold { uptime_percent: f64 },
    Issued {
        tx: TxId,
        amount: f64,
        uptime_percent: f64,
    },
    /// The issuer failed; the window stays open for the next evaluation.
    Failed(String),
}

/// Decides when a reward is owed and issues it.
pub struct RewardEvaluator {
    state: StateHandle,
    connection: ConnectionManager,
    issuer: Arc<dyn RewardIssuer>,
    interval: chrono::Duration,
    base_amount: f64,
    threshold_percent: f64,
}

impl RewardEvaluator {
    pub fn new(
        config: &RewardConfig,
        state: StateHandle,
        connection: ConnectionManager,
        issuer: Arc<dyn RewardIssuer>,
    ) -> Self {
        Self {
            state,
            connection,
            issuer,
            interval: chrono::Duration::seconds(
                i64::try_from(config.interval_secs).unwrap_or(i64::MAX),
            ),
            base_amount: config.base_amount,
            threshold_percent: config.threshold_percent,
        }
    }

    pub fn issuer(&self) -> &Arc<dyn RewardIssuer> {
        &self.issuer
    }

    /// Start of the window the next reward would cover.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.state
            .last_reward_time()
            .unwrap_or_else(|| self.state.start_time())
    }

    /// Uptime percentage of the current window as of `now`.
    pub fn current_uptime_percent(&self, now: DateTime<Utc>) -> Option<f64> {
        let snapshot = self.state.current_snapshot()?;
        uptime_percent(snapshot.client_uptime_secs, now - self.window_start())
    }

    pub async fn evaluate(&self, now: DateTime<Utc>) -> Evaluation {
        if let Some(last) = self.state.last_reward_time()
            && now - last < self.interval
        {
            debug!(last_reward = %last, "reward not due");
            return Evaluation::NotDue;
        }

        let Some(pct) = self.current_uptime_percent(now) else {
            debug!("no uptime data for reward evaluation");
            return Evaluation::NoData;
        };

        if pct < self.threshold_percent {
            info!(uptime_percent = pct, threshold = self.threshold_percent, "uptime below reward threshold");
            return Evaluation::BelowThreshold { uptime_percent: pct };
        }

        let amount = self.base_amount * pct.min(100.0) / 100.0;
        match self.issuer.send(amount).await {
            Ok(tx) => {
                self.state.set_last_reward_time(now);
                info!(tx = %tx, amount, uptime_percent = pct, "reward issued");
                self.connection
                    .send(
                        OutboundKind::RewardIssued,
                        json!({ "txId": tx, "amount": amount, "uptimePercent": pct }),
                        Priority::High,
                    )
                    .await;
                Evaluation::Issued {
                    tx,
                    amount,
                    uptime_percent: pct,
                }
            }
            Err(e) => {
                warn!(error = %e, amount, "reward issuance failed, will retry");
                Evaluation::Failed(e.to_string())
            }
        }
    }

    /// Scheduler entry point. Issuance failures are not job failures.
    ///
    /// # Errors
    ///
    /// Never fails; the signature matches the scheduler's job contract.
    pub async fn run(&self) -> Result<()> {
        self.evaluate(Utc::now()).await;
        Ok(())
    }
}

/// Check settlement of a reward the aggregator says was paid.
///
/// # Errors
///
/// Returns [`AgentError::Reward`] if the issuer cannot verify the transaction.
pub async fn verify_reward(issuer: &dyn RewardIssuer, tx: &TxId) -> Result<Verification> {
    let verification = issuer
        .verify(tx)
        .await
        .map_err(|e| AgentError::Reward(format!("verify {tx}: {e}")))?;
    if verification.confirmed {
        info!(tx = %tx, status = %verification.status, "reward confirmed");
    } else {
        warn!(tx = %tx, status = %verification.status, "reward not confirmed");
    }
    Ok(verification)
}
