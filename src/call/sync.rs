use super::session::{CallSession, CallState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Internal state mapped onto the proxy's dialog vocabulary.
pub fn dialog_state(state: CallState) -> &'static str {
    match state {
        CallState::Initializing | CallState::Ringing | CallState::Connecting => "early",
        CallState::Connected | CallState::OnHold | CallState::Transferring => "confirmed",
        CallState::Forwarding => "early",
        CallState::Ending => "confirmed",
        CallState::Completed
        | CallState::Failed
        | CallState::Cancelled
        | CallState::Busy
        | CallState::NoAnswer => "terminated",
    }
}

fn is_critical(state: CallState) -> bool {
    matches!(
        state,
        CallState::Connected | CallState::Completed | CallState::Failed
    )
}

/// RPC surface of the external signaling proxy. Implementations must not
/// be relied on for consistency: every error is logged and dropped.
#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn set_dialog_attributes(
        &self,
        dialog_id: &str,
        attrs: &[(String, String)],
    ) -> Result<()>;
    async fn clear_dialog_attributes(&self, dialog_id: &str) -> Result<()>;
    async fn increment_counter(&self, name: &str) -> Result<()>;
}

/// JSON-RPC client for the proxy's management endpoint.
pub struct HttpSignalingClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpSignalingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: serde_json::Value) -> Result<()> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("proxy rpc {} returned {}", method, response.status());
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingClient for HttpSignalingClient {
    async fn set_dialog_attributes(
        &self,
        dialog_id: &str,
        attrs: &[(String, String)],
    ) -> Result<()> {
        let attrs: serde_json::Map<String, serde_json::Value> = attrs
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        self.rpc(
            "dialog.set_attrs",
            json!({ "dialog_id": dialog_id, "attrs": attrs }),
        )
        .await
    }

    async fn clear_dialog_attributes(&self, dialog_id: &str) -> Result<()> {
        self.rpc("dialog.clear_attrs", json!({ "dialog_id": dialog_id }))
            .await
    }

    async fn increment_counter(&self, name: &str) -> Result<()> {
        self.rpc("stats.increment", json!({ "name": name })).await
    }
}

#[derive(Debug, Clone)]
enum SyncJob {
    SetAttributes {
        dialog_id: String,
        attrs: Vec<(String, String)>,
    },
    ClearDialog {
        dialog_id: String,
    },
    IncrementCounter {
        name: String,
    },
}

#[derive(Debug, Clone)]
struct PendingUpdate {
    dialog_id: String,
    state: CallState,
}

/// Reconciles internal call state with the external signaling proxy.
/// Routine transitions are batched (last write wins per call) and
/// flushed on a timer; critical transitions bypass the batch and go out
/// through the job channel immediately. The call path only enqueues.
pub struct StateSynchronizer {
    client: std::sync::Arc<dyn SignalingClient>,
    pending: Mutex<HashMap<String, PendingUpdate>>,
    jobs_tx: UnboundedSender<SyncJob>,
    jobs_rx: Mutex<Option<UnboundedReceiver<SyncJob>>>,
    flush_interval: Duration,
}

impl StateSynchronizer {
    pub fn new(client: std::sync::Arc<dyn SignalingClient>, flush_interval: Duration) -> Self {
        let (jobs_tx, jobs_rx) = unbounded_channel();
        Self {
            client,
            pending: Mutex::new(HashMap::new()),
            jobs_tx,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            flush_interval,
        }
    }

    /// Session admitted: push the correlation ids right away, even when
    /// the AI session id is still empty.
    pub fn record_created(&self, session: &CallSession) {
        let Some(dialog_id) = session.signaling_call_id.clone() else {
            debug!(call_id = session.call_id, "no signaling dialog to sync");
            return;
        };
        let attrs = vec![
            (
                "internal_call_id".to_string(),
                session.session_id.clone(),
            ),
            (
                "ai_session_id".to_string(),
                session.ai_session_id.clone().unwrap_or_default(),
            ),
        ];
        let _ = self.jobs_tx.send(SyncJob::SetAttributes { dialog_id, attrs });
    }

    pub fn record_state(&self, session: &CallSession, state: CallState) {
        let Some(dialog_id) = session.signaling_call_id.clone() else {
            debug!(call_id = session.call_id, "no signaling dialog to sync");
            return;
        };
        if is_critical(state) {
            self.pending.lock().unwrap().remove(&session.call_id);
            let _ = self.jobs_tx.send(SyncJob::SetAttributes {
                dialog_id,
                attrs: state_attrs(state),
            });
        } else {
            self.pending.lock().unwrap().insert(
                session.call_id.clone(),
                PendingUpdate { dialog_id, state },
            );
        }
    }

    /// Completion pipeline: bump the proxy-side call counter and clear
    /// the dialog's attributes. Any still-pending routine update for the
    /// call is dropped so nothing is written after the clear.
    pub fn record_completed(&self, session: &CallSession) {
        self.pending.lock().unwrap().remove(&session.call_id);
        let _ = self.jobs_tx.send(SyncJob::IncrementCounter {
            name: "calls_completed".to_string(),
        });
        if let Some(dialog_id) = session.signaling_call_id.clone() {
            let _ = self.jobs_tx.send(SyncJob::ClearDialog { dialog_id });
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Background worker: owns the immediate-dispatch channel and the
    /// periodic flush. Runs until the token is cancelled.
    pub async fn serve(&self, token: CancellationToken) {
        let mut jobs_rx = match self.jobs_rx.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                warn!("state synchronizer is already serving");
                return;
            }
        };
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            select! {
                _ = token.cancelled() => break,
                job = jobs_rx.recv() => match job {
                    Some(job) => self.run_job(job).await,
                    None => break,
                },
                _ = ticker.tick() => self.flush_pending().await,
            }
        }
        info!("state synchronizer stopped");
    }

    pub(crate) async fn flush_pending(&self) {
        let updates: Vec<(String, PendingUpdate)> =
            self.pending.lock().unwrap().drain().collect();
        for (call_id, update) in updates {
            if let Err(e) = self
                .client
                .set_dialog_attributes(&update.dialog_id, &state_attrs(update.state))
                .await
            {
                warn!(
                    call_id,
                    dialog_id = update.dialog_id,
                    "state sync flush failed: {}",
                    e
                );
            }
        }
    }

    async fn run_job(&self, job: SyncJob) {
        let result = match &job {
            SyncJob::SetAttributes { dialog_id, attrs } => {
                self.client.set_dialog_attributes(dialog_id, attrs).await
            }
            SyncJob::ClearDialog { dialog_id } => {
                self.client.clear_dialog_attributes(dialog_id).await
            }
            SyncJob::IncrementCounter { name } => self.client.increment_counter(name).await,
        };
        if let Err(e) = result {
            warn!("signaling sync job failed: {} ({:?})", e, job);
        }
    }
}

fn state_attrs(state: CallState) -> Vec<(String, String)> {
    vec![
        ("call_state".to_string(), dialog_state(state).to_string()),
        ("last_update".to_string(), Utc::now().to_rfc3339()),
    ]
}
