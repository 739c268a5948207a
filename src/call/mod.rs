use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

pub mod features;
pub mod manager;
pub mod queue;
pub mod router;
pub mod session;
pub mod sync;
#[cfg(test)]
pub mod tests;

pub use manager::{CallManager, CallManagerBuilder, CallManagerRef};
pub use session::{CallSession, CallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Internal,
}

/// Call priority, ordered from lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallPriority {
    Low,
    Normal,
    High,
    Emergency,
}

impl Default for CallPriority {
    fn default() -> Self {
        CallPriority::Normal
    }
}

impl FromStr for CallPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(CallPriority::Low),
            "normal" => Ok(CallPriority::Normal),
            "high" => Ok(CallPriority::High),
            "emergency" => Ok(CallPriority::Emergency),
            other => Err(anyhow::anyhow!("unknown priority: {}", other)),
        }
    }
}

/// One side of a call. Immutable once attached to a session except for
/// the registration flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallParticipant {
    pub number: String,
    pub display_name: Option<String>,
    pub user_agent: Option<String>,
    pub source_addr: Option<String>,
    pub registered: bool,
    pub capabilities: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl CallParticipant {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            ..Default::default()
        }
    }
}

/// Dialog tags assigned by the external signaling proxy, stored verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DialogTags {
    pub local: String,
    pub remote: String,
}

/// Inbound call notification from the signaling adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncomingCall {
    pub call_id: String,
    pub caller: String,
    pub callee: String,
    pub signaling_call_id: Option<String>,
    pub display_name: Option<String>,
    pub user_agent: Option<String>,
    pub source_addr: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Outbound call request from the application backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundCall {
    pub caller: String,
    pub callee: String,
    pub call_id: Option<String>,
    pub priority: Option<CallPriority>,
    pub ai_session_id: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Decision returned to the caller of `handle_incoming_call`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CallDecision {
    Accept {
        call_id: String,
        session_id: String,
        ringing_timeout: u64,
    },
    Reject {
        code: u16,
        reason: String,
    },
    Queue {
        queue_name: String,
        position: usize,
        estimated_wait: u64,
    },
    Forward {
        target: String,
        timeout: u64,
        call_id: String,
    },
}
