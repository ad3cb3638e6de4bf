use crate::core::error::{GenResult, GenerationError};
use crate::core::io::Storage;
use crate::core::state::{AccountState, Tier};
use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

const ACCOUNT_KEY: &str = "account/state.json";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BillingConfig {
    /// Balance granted to a fresh account.
    #[serde(default = "default_starting_balance")]
    pub starting_balance: u64,
    #[serde(default = "default_standard_cost")]
    pub standard_cost: u64,
    #[serde(default = "default_premium_cost")]
    pub premium_cost: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            starting_balance: default_starting_balance(),
            standard_cost: default_standard_cost(),
            premium_cost: default_premium_cost(),
        }
    }
}

impl BillingConfig {
    pub fn cost_for(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Standard => self.standard_cost,
            Tier::Premium => self.premium_cost,
        }
    }
}

fn default_starting_balance() -> u64 {
    200
}
fn default_standard_cost() -> u64 {
    10
}
fn default_premium_cost() -> u64 {
    50
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Credited { credits: u64, balance: u64 },
    /// Event id was already applied.
    Duplicate,
    /// Not a payment event, or carries no credits.
    Ignored,
}

/// Energy balance and onboarding flags, persisted through [`Storage`].
pub struct EnergyLedger {
    storage: Arc<dyn Storage>,
    state: Mutex<AccountState>,
}

impl EnergyLedger {
    pub async fn load(storage: Arc<dyn Storage>, starting_balance: u64) -> Result<Self> {
        let state = if storage.exists(ACCOUNT_KEY).await? {
            let bytes = storage.read(ACCOUNT_KEY).await?;
            serde_json::from_slice(&bytes).context("Corrupt account state")?
        } else {
            info!("No account state found, starting with {} energy", starting_balance);
            AccountState { balance: starting_balance, ..Default::default() }
        };
        Ok(Self { storage, state: Mutex::new(state) })
    }

    async fn persist(&self, state: &AccountState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        self.storage.write(ACCOUNT_KEY, &content).await
    }

    pub async fn balance(&self) -> u64 {
        self.state.lock().await.balance
    }

    /// Debits `cost` or fails without touching the balance.
    pub async fn try_debit(&self, cost: u64) -> GenResult<u64> {
        let mut state = self.state.lock().await;
        if state.balance < cost {
            return Err(GenerationError::InsufficientBalance { balance: state.balance, cost });
        }
        state.balance -= cost;
        if let Err(e) = self.persist(&state).await {
            state.balance += cost;
            return Err(e.context("Failed to persist debit").into());
        }
        Ok(state.balance)
    }

    pub async fn refund(&self, cost: u64) -> Result<u64> {
        let mut state = self.state.lock().await;
        state.balance = state.balance.saturating_add(cost);
        self.persist(&state).await?;
        info!("Refunded {} energy, balance {}", cost, state.balance);
        Ok(state.balance)
    }

    /// Applies a payment provider event. Credits are read from
    /// `metadata.credits` on the event object.
    pub async fn apply_webhook(&self, payload: &Value) -> Result<WebhookOutcome> {
        let event_id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("Webhook event has no id"))?;
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        if !matches!(kind, "checkout.session.completed" | "invoice.paid") {
            return Ok(WebhookOutcome::Ignored);
        }
        let Some(credits) = webhook_credits(payload).filter(|c| *c > 0) else {
            warn!("Webhook {} ({}) carries no credits", event_id, kind);
            return Ok(WebhookOutcome::Ignored);
        };

        let mut state = self.state.lock().await;
        if state.processed_events.contains(event_id) {
            info!("Webhook {} already applied", event_id);
            return Ok(WebhookOutcome::Duplicate);
        }
        state.balance = state.balance.saturating_add(credits);
        state.processed_events.insert(event_id.to_string());
        if let Err(e) = self.persist(&state).await {
            state.balance -= credits;
            state.processed_events.remove(event_id);
            return Err(e);
        }
        info!("Credited {} energy from {}, balance {}", credits, event_id, state.balance);
        Ok(WebhookOutcome::Credited { credits, balance: state.balance })
    }

    pub async fn apply_webhook_str(&self, body: &str) -> Result<WebhookOutcome> {
        let payload: Value = serde_json::from_str(body).context("Webhook body is not JSON")?;
        self.apply_webhook(&payload).await
    }

    pub async fn has_seen_guide(&self, guide: &str) -> bool {
        self.state.lock().await.seen_guides.contains(guide)
    }

    pub async fn mark_guide_seen(&self, guide: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.seen_guides.insert(guide.to_string()) {
            self.persist(&state).await?;
        }
        Ok(())
    }
}

fn webhook_credits(payload: &Value) -> Option<u64> {
    let object = payload
        .get("data")
        .and_then(|d| d.get("object"))
        .unwrap_or(payload);
    let credits = object.get("metadata")?.get("credits")?;
    match credits {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use serde_json::json;

    fn storage(dir: &std::path::Path) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(NativeStorage::new(dir, None)?))
    }

    fn paid(id: &str, credits: Value) -> Value {
        json!({
            "id": id,
            "type": "checkout.session.completed",
            "data": {"object": {"metadata": {"credits": credits}}}
        })
    }

    #[tokio::test]
    async fn test_debit_and_refund() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = EnergyLedger::load(storage(dir.path())?, 25).await?;

        assert_eq!(ledger.try_debit(10).await?, 15);
        assert_eq!(ledger.try_debit(10).await?, 5);
        let err = ledger.try_debit(10).await.unwrap_err();
        assert!(matches!(err, GenerationError::InsufficientBalance { balance: 5, cost: 10 }));
        assert_eq!(ledger.refund(10).await?, 15);

        // Balance survives a reload.
        let reloaded = EnergyLedger::load(storage(dir.path())?, 999).await?;
        assert_eq!(reloaded.balance().await, 15);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_replay_credits_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = EnergyLedger::load(storage(dir.path())?, 0).await?;

        let event = paid("evt_1", json!("100"));
        assert_eq!(
            ledger.apply_webhook(&event).await?,
            WebhookOutcome::Credited { credits: 100, balance: 100 }
        );
        assert_eq!(ledger.apply_webhook(&event).await?, WebhookOutcome::Duplicate);
        assert_eq!(ledger.balance().await, 100);

        let reloaded = EnergyLedger::load(storage(dir.path())?, 0).await?;
        assert_eq!(reloaded.apply_webhook(&event).await?, WebhookOutcome::Duplicate);
        assert_eq!(reloaded.balance().await, 100);
        Ok(())
    }

    #[tokio::test]
    async fn test_webhook_ignores_other_events() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = EnergyLedger::load(storage(dir.path())?, 0).await?;

        let refund = json!({"id": "evt_2", "type": "charge.refunded", "metadata": {"credits": 5}});
        assert_eq!(ledger.apply_webhook(&refund).await?, WebhookOutcome::Ignored);
        assert_eq!(ledger.apply_webhook(&paid("evt_3", json!(null))).await?, WebhookOutcome::Ignored);
        assert!(ledger.apply_webhook(&json!({"type": "invoice.paid"})).await.is_err());

        let body = r#"{"id":"evt_4","type":"invoice.paid","metadata":{"credits":40}}"#;
        assert_eq!(
            ledger.apply_webhook_str(body).await?,
            WebhookOutcome::Credited { credits: 40, balance: 40 }
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_guide_flags() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let ledger = EnergyLedger::load(storage(dir.path())?, 0).await?;
        assert!(!ledger.has_seen_guide("first-book").await);
        ledger.mark_guide_seen("first-book").await?;
        assert!(ledger.has_seen_guide("first-book").await);

        let reloaded = EnergyLedger::load(storage(dir.path())?, 0).await?;
        assert!(reloaded.has_seen_guide("first-book").await);
        Ok(())
    }
}
