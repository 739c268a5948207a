use crate::call::features::DtmfSource;
use crate::call::session::{CallSession, CallState};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// CallEvent represents the lifecycle notifications published to
/// subscribers such as a media bridge or a signaling adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    CallStateChanged {
        call_id: String,
        old_state: CallState,
        new_state: CallState,
    },
    CallAccepted {
        call_id: String,
        ringing_timeout: u64,
    },
    CallCompleted {
        call_id: String,
        state: CallState,
    },
    DtmfDetected {
        call_id: String,
        digit: String,
        source: DtmfSource,
    },
    CallTransferring {
        call_id: String,
        target: String,
    },
    CallQueued {
        call_id: String,
        queue_name: String,
        position: usize,
    },
    CallForwarded {
        call_id: String,
        target: String,
    },
    QueueExpired {
        call_id: String,
        queue_name: String,
        waited_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEventKind {
    StateChanged,
    Accepted,
    Completed,
    Dtmf,
    Transferring,
    Queued,
    Forwarded,
    QueueExpired,
}

impl CallEvent {
    pub fn kind(&self) -> CallEventKind {
        match self {
            CallEvent::CallStateChanged { .. } => CallEventKind::StateChanged,
            CallEvent::CallAccepted { .. } => CallEventKind::Accepted,
            CallEvent::CallCompleted { .. } => CallEventKind::Completed,
            CallEvent::DtmfDetected { .. } => CallEventKind::Dtmf,
            CallEvent::CallTransferring { .. } => CallEventKind::Transferring,
            CallEvent::CallQueued { .. } => CallEventKind::Queued,
            CallEvent::CallForwarded { .. } => CallEventKind::Forwarded,
            CallEvent::QueueExpired { .. } => CallEventKind::QueueExpired,
        }
    }
}

/// Subscribers receive a snapshot of the session plus the event payload.
#[async_trait]
pub trait CallEventHandler: Send + Sync {
    async fn on_event(&self, session: &CallSession, event: &CallEvent) -> anyhow::Result<()>;
}

/// Per-event-type subscriber lists with failure isolation: one failing
/// handler is logged and the rest still run.
#[derive(Default)]
pub struct EventHub {
    handlers: RwLock<HashMap<CallEventKind, Vec<Arc<dyn CallEventHandler>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: CallEventKind, handler: Arc<dyn CallEventHandler>) {
        let mut handlers = self.handlers.write().unwrap();
        handlers.entry(kind).or_default().push(handler);
    }

    pub async fn publish(&self, session: &CallSession, event: &CallEvent) {
        let subscribers = {
            let handlers = self.handlers.read().unwrap();
            handlers.get(&event.kind()).cloned().unwrap_or_default()
        };
        for handler in subscribers {
            if let Err(e) = handler.on_event(session, event).await {
                warn!(
                    call_id = session.call_id,
                    event = ?event.kind(),
                    "event handler failed: {}",
                    e
                );
            }
        }
    }
}
