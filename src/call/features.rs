use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where a DTMF digit was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtmfSource {
    /// RFC 4733 telephone-event payload embedded in RTP.
    Rtp,
    /// Tones detected in the decoded audio itself.
    InbandAudio,
    /// Out-of-band signaling (e.g. SIP INFO).
    Signaling,
}

#[derive(Debug, Clone, Serialize)]
pub struct DtmfEvent {
    pub digit: String,
    pub duration_ms: u32,
    pub source: DtmfSource,
}

#[async_trait]
pub trait DtmfProcessor: Send + Sync {
    async fn process_dtmf(&self, call_id: &str, source: DtmfSource) -> Option<DtmfEvent>;
    async fn unsubscribe(&self, call_id: &str);
}

#[async_trait]
pub trait IvrEngine: Send + Sync {
    async fn start_session(&self, call_id: &str, menu_id: Option<&str>) -> bool;
    async fn end_session(&self, call_id: &str, reason: &str) -> bool;
}

#[async_trait]
pub trait HoldMusicPlayer: Send + Sync {
    async fn start(&self, call_id: &str, source: Option<&str>) -> bool;
    async fn stop(&self, call_id: &str) -> bool;
}

/// Store-and-forward messaging runs its own lifecycle; the manager only
/// drives start/stop ordering.
#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

pub struct NoopDtmfProcessor;

#[async_trait]
impl DtmfProcessor for NoopDtmfProcessor {
    async fn process_dtmf(&self, _call_id: &str, _source: DtmfSource) -> Option<DtmfEvent> {
        None
    }

    async fn unsubscribe(&self, _call_id: &str) {}
}

pub struct NoopIvrEngine;

#[async_trait]
impl IvrEngine for NoopIvrEngine {
    async fn start_session(&self, _call_id: &str, _menu_id: Option<&str>) -> bool {
        true
    }

    async fn end_session(&self, _call_id: &str, _reason: &str) -> bool {
        true
    }
}

pub struct NoopHoldMusicPlayer;

#[async_trait]
impl HoldMusicPlayer for NoopHoldMusicPlayer {
    async fn start(&self, _call_id: &str, _source: Option<&str>) -> bool {
        true
    }

    async fn stop(&self, _call_id: &str) -> bool {
        true
    }
}

pub struct NoopMessagingService;

#[async_trait]
impl MessagingService for NoopMessagingService {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
