use super::{CallDirection, CallParticipant, CallPriority, DialogTags};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initializing,
    Ringing,
    Connecting,
    Connected,
    OnHold,
    Transferring,
    Forwarding,
    Ending,
    Completed,
    Failed,
    Cancelled,
    Busy,
    NoAnswer,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::Failed
                | CallState::Cancelled
                | CallState::Busy
                | CallState::NoAnswer
        )
    }

    /// Legal lifecycle edges. Self-transitions are accepted so repeated
    /// updates stay idempotent; re-entering a left state is otherwise
    /// only possible for ON_HOLD/TRANSFERRING back to CONNECTED.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        if *self == next {
            return true;
        }
        match (self, next) {
            (Initializing, Ringing | Connecting | Connected | Forwarding) => true,
            (Ringing, Connecting | Connected) => true,
            (Connecting, Connected) => true,
            (Connected, OnHold | Transferring | Ending) => true,
            (OnHold, Connected | Ending) => true,
            (Transferring, Connected | Ending) => true,
            (Forwarding, Ringing | Connecting | Connected) => true,
            (from, to) => to.is_terminal() && !from.is_terminal(),
        }
    }
}

/// The in-memory record of one call's identity, parties and lifecycle
/// state. Owned exclusively by the manager's active-call table;
/// collaborators refer to it by `call_id` only.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: String,
    pub session_id: String,
    /// Call identifier assigned by the external signaling proxy, opaque.
    pub signaling_call_id: Option<String>,
    pub dialog_tags: Option<DialogTags>,

    pub direction: CallDirection,
    pub priority: CallPriority,
    pub state: CallState,

    pub created_at: DateTime<Utc>,
    pub ring_start: Option<DateTime<Utc>>,
    pub connect_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub caller: CallParticipant,
    pub callee: CallParticipant,

    pub codec: Option<String>,
    pub recording: bool,
    pub recording_target: Option<String>,
    pub on_hold: bool,
    pub transfer_target: Option<String>,
    pub forward_target: Option<String>,

    pub ai_session_id: Option<String>,
    pub ai_context: Option<serde_json::Value>,
    pub custom_data: HashMap<String, serde_json::Value>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        direction: CallDirection,
        caller: CallParticipant,
        callee: CallParticipant,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            signaling_call_id: None,
            dialog_tags: None,
            direction,
            priority: CallPriority::Normal,
            state: CallState::Initializing,
            created_at: Utc::now(),
            ring_start: None,
            connect_time: None,
            end_time: None,
            caller,
            callee,
            codec: None,
            recording: false,
            recording_target: None,
            on_hold: false,
            transfer_target: None,
            forward_target: None,
            ai_session_id: None,
            ai_context: None,
            custom_data: HashMap::new(),
        }
    }

    /// Apply a state transition if it is legal. Lifecycle timestamps are
    /// stamped at most once, on first entry.
    pub fn transition_to(&mut self, next: CallState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        match next {
            CallState::Ringing => {
                if self.ring_start.is_none() {
                    self.ring_start = Some(Utc::now());
                }
            }
            CallState::Connected => {
                if self.connect_time.is_none() {
                    self.connect_time = Some(Utc::now());
                }
            }
            state if state.is_terminal() => {
                if self.end_time.is_none() {
                    self.end_time = Some(Utc::now());
                }
            }
            _ => {}
        }
        self.state = next;
        true
    }

    /// Merge caller-supplied metadata into `custom_data`. Only JSON
    /// objects contribute; top-level keys overwrite existing entries.
    pub fn merge_metadata(&mut self, metadata: &serde_json::Value) {
        if let Some(map) = metadata.as_object() {
            for (key, value) in map {
                self.custom_data.insert(key.clone(), value.clone());
            }
        }
    }

    /// Talk time: `end_time - connect_time` once both are set, running
    /// duration while the call is still connected, undefined before answer.
    pub fn duration(&self) -> Option<Duration> {
        let connect_time = self.connect_time?;
        match self.end_time {
            Some(end_time) => Some(end_time - connect_time),
            None => Some(Utc::now() - connect_time),
        }
    }

    pub fn ring_duration(&self) -> Option<Duration> {
        let ring_start = self.ring_start?;
        let until = self
            .connect_time
            .or(self.end_time)
            .unwrap_or_else(Utc::now);
        Some(until - ring_start)
    }
}
