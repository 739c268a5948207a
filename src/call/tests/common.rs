use crate::call::session::CallSession;
use crate::call::sync::SignalingClient;
use crate::call::{CallDirection, CallParticipant, IncomingCall};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOp {
    SetAttrs {
        dialog_id: String,
        attrs: Vec<(String, String)>,
    },
    Clear {
        dialog_id: String,
    },
    Increment {
        name: String,
    },
}

/// In-memory signaling proxy double that records every RPC.
#[derive(Default)]
pub struct RecordingSignalingClient {
    ops: Mutex<Vec<SyncOp>>,
}

impl RecordingSignalingClient {
    pub fn ops(&self) -> Vec<SyncOp> {
        self.ops.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingClient for RecordingSignalingClient {
    async fn set_dialog_attributes(
        &self,
        dialog_id: &str,
        attrs: &[(String, String)],
    ) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::SetAttrs {
            dialog_id: dialog_id.to_string(),
            attrs: attrs.to_vec(),
        });
        Ok(())
    }

    async fn clear_dialog_attributes(&self, dialog_id: &str) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::Clear {
            dialog_id: dialog_id.to_string(),
        });
        Ok(())
    }

    async fn increment_counter(&self, name: &str) -> Result<()> {
        self.ops.lock().unwrap().push(SyncOp::Increment {
            name: name.to_string(),
        });
        Ok(())
    }
}

pub fn make_session(call_id: &str, caller: &str, callee: &str) -> CallSession {
    CallSession::new(
        call_id,
        CallDirection::Inbound,
        CallParticipant::new(caller),
        CallParticipant::new(callee),
    )
}

pub fn incoming(call_id: &str, caller: &str, callee: &str) -> IncomingCall {
    IncomingCall {
        call_id: call_id.to_string(),
        caller: caller.to_string(),
        callee: callee.to_string(),
        signaling_call_id: Some(format!("dlg-{}", call_id)),
        ..Default::default()
    }
}
