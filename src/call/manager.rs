use super::features::{
    DtmfEvent, DtmfProcessor, DtmfSource, HoldMusicPlayer, IvrEngine, MessagingService,
    NoopDtmfProcessor, NoopHoldMusicPlayer, NoopIvrEngine, NoopMessagingService,
};
use super::queue::{CallQueue, QueueStatistics, QueuedCall};
use super::router::{CallRouter, RouteDecision};
use super::session::{CallSession, CallState};
use super::sync::{HttpSignalingClient, SignalingClient, StateSynchronizer};
use super::{
    CallDecision, CallDirection, CallParticipant, CallPriority, IncomingCall, OutboundCall,
};
use crate::config::{Config, QueueConfig};
use crate::event::{CallEvent, CallEventHandler, CallEventKind, EventHub};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type CallManagerRef = Arc<CallManager>;

/// Everything the call path mutates lives behind one lock so that
/// admission check plus registration is atomic and updates to a single
/// call are applied in invocation order.
#[derive(Default)]
struct CallTable {
    sessions: HashMap<String, CallSession>,
    caller_counts: HashMap<String, usize>,
    queues: HashMap<String, CallQueue>,
}

struct CallCounters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    started_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatistics {
    pub total_calls: u64,
    pub completed_calls: u64,
    pub failed_calls: u64,
    pub active_calls: usize,
    pub uptime_secs: u64,
    pub success_rate: f64,
    pub average_duration_secs: f64,
}

pub struct CallManagerBuilder {
    config: Option<Config>,
    cancel_token: Option<CancellationToken>,
    signaling_client: Option<Arc<dyn SignalingClient>>,
    dtmf: Option<Arc<dyn DtmfProcessor>>,
    ivr: Option<Arc<dyn IvrEngine>>,
    hold_music: Option<Arc<dyn HoldMusicPlayer>>,
    messaging: Option<Arc<dyn MessagingService>>,
}

impl CallManagerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cancel_token: None,
            signaling_client: None,
            dtmf: None,
            ivr: None,
            hold_music: None,
            messaging: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = Some(token);
        self
    }

    pub fn with_signaling_client(mut self, client: Arc<dyn SignalingClient>) -> Self {
        self.signaling_client = Some(client);
        self
    }

    pub fn with_dtmf_processor(mut self, dtmf: Arc<dyn DtmfProcessor>) -> Self {
        self.dtmf = Some(dtmf);
        self
    }

    pub fn with_ivr_engine(mut self, ivr: Arc<dyn IvrEngine>) -> Self {
        self.ivr = Some(ivr);
        self
    }

    pub fn with_hold_music(mut self, hold_music: Arc<dyn HoldMusicPlayer>) -> Self {
        self.hold_music = Some(hold_music);
        self
    }

    pub fn with_messaging(mut self, messaging: Arc<dyn MessagingService>) -> Self {
        self.messaging = Some(messaging);
        self
    }

    pub fn build(self) -> CallManagerRef {
        let config = self.config.unwrap_or_default();
        let token = self.cancel_token.unwrap_or_default();
        let router = CallRouter::new(&config.routing);
        let client = self
            .signaling_client
            .unwrap_or_else(|| Arc::new(HttpSignalingClient::new(config.signaling.endpoint.clone())));
        let synchronizer = Arc::new(StateSynchronizer::new(
            client,
            Duration::from_secs(config.signaling.flush_interval_secs.max(1)),
        ));
        Arc::new(CallManager {
            config,
            token,
            router,
            synchronizer,
            table: Mutex::new(CallTable::default()),
            counters: CallCounters {
                total: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                started_at: Instant::now(),
            },
            events: EventHub::new(),
            dtmf: self.dtmf.unwrap_or_else(|| Arc::new(NoopDtmfProcessor)),
            ivr: self.ivr.unwrap_or_else(|| Arc::new(NoopIvrEngine)),
            hold_music: self
                .hold_music
                .unwrap_or_else(|| Arc::new(NoopHoldMusicPlayer)),
            messaging: self
                .messaging
                .unwrap_or_else(|| Arc::new(NoopMessagingService)),
        })
    }
}

/// Orchestration root: owns the active-call table, admission control,
/// routing, queues, the state synchronizer and event publication.
pub struct CallManager {
    pub config: Config,
    pub token: CancellationToken,
    router: CallRouter,
    synchronizer: Arc<StateSynchronizer>,
    table: Mutex<CallTable>,
    counters: CallCounters,
    events: EventHub,
    dtmf: Arc<dyn DtmfProcessor>,
    ivr: Arc<dyn IvrEngine>,
    hold_music: Arc<dyn HoldMusicPlayer>,
    messaging: Arc<dyn MessagingService>,
}

impl CallManager {
    /// Spawn the synchronizer worker and the queue sweep, start messaging.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.messaging.start().await?;
        let synchronizer = self.synchronizer.clone();
        let sync_token = self.token.child_token();
        tokio::spawn(async move { synchronizer.serve(sync_token).await });
        let manager = self.clone();
        tokio::spawn(async move { manager.sweep_queues().await });
        info!("call manager started");
        Ok(())
    }

    /// Cancel every still-active call, then stop owned subsystems.
    pub async fn stop(self: &Arc<Self>) {
        let active: Vec<String> = {
            let table = self.table.lock().await;
            table
                .sessions
                .values()
                .filter(|s| !s.state.is_terminal())
                .map(|s| s.call_id.clone())
                .collect()
        };
        for call_id in active {
            self.update_call_state(
                &call_id,
                CallState::Cancelled,
                Some(json!({ "reason": "system_shutdown" })),
            )
            .await;
        }
        if let Err(e) = self.messaging.stop().await {
            warn!("messaging stop failed: {}", e);
        }
        self.token.cancel();
        info!("call manager stopped");
    }

    pub fn subscribe(&self, kind: CallEventKind, handler: Arc<dyn CallEventHandler>) {
        self.events.subscribe(kind, handler);
    }

    pub async fn handle_incoming_call(self: &Arc<Self>, request: IncomingCall) -> CallDecision {
        match self.admit_and_route(request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!("incoming call handling failed: {}", e);
                CallDecision::Reject {
                    code: 500,
                    reason: "internal_error".to_string(),
                }
            }
        }
    }

    async fn admit_and_route(self: &Arc<Self>, request: IncomingCall) -> Result<CallDecision> {
        let mut caller = CallParticipant::new(request.caller.clone());
        caller.display_name = request.display_name.clone();
        caller.user_agent = request.user_agent.clone();
        caller.source_addr = request.source_addr.clone();
        let callee = CallParticipant::new(request.callee.clone());

        let mut session = CallSession::new(
            request.call_id.clone(),
            CallDirection::Inbound,
            caller,
            callee,
        );
        session.signaling_call_id = request.signaling_call_id.clone();
        session.priority = self.assign_priority(&request.caller, &request.headers, None);
        if !request.headers.is_empty() {
            session
                .custom_data
                .insert("headers".to_string(), json!(request.headers));
        }

        let mut table = self.table.lock().await;
        if self.call_id_in_use(&table, &session.call_id) {
            warn!(call_id = session.call_id, "duplicate call id");
            return Ok(CallDecision::Reject {
                code: 400,
                reason: "duplicate_call_id".to_string(),
            });
        }
        if let Some(reason) = self.admission_denied(&table, &session) {
            info!(
                call_id = session.call_id,
                caller = session.caller.number,
                "admission denied: {}",
                reason
            );
            return Ok(CallDecision::Reject { code: 486, reason });
        }

        match self.router.route(&session) {
            RouteDecision::Reject { code, reason } => {
                info!(
                    call_id = session.call_id,
                    caller = session.caller.number,
                    code,
                    "call rejected by routing: {}",
                    reason
                );
                Ok(CallDecision::Reject { code, reason })
            }
            RouteDecision::Queue { name, priority } => {
                if priority > session.priority {
                    session.priority = priority;
                }
                let call_id = session.call_id.clone();
                let queue_config = self.queue_config(&name);
                let estimated_handle_secs = queue_config.estimated_handle_secs;
                let queue = table
                    .queues
                    .entry(name.clone())
                    .or_insert_with(|| CallQueue::new(name.clone(), &queue_config));
                let snapshot = session.clone();
                if !queue.add(session) {
                    info!(call_id, queue_name = name, "queue full");
                    return Ok(CallDecision::Reject {
                        code: 503,
                        reason: "queue_full".to_string(),
                    });
                }
                let position = queue.position(&call_id).unwrap_or(queue.len());
                drop(table);
                self.events
                    .publish(
                        &snapshot,
                        &CallEvent::CallQueued {
                            call_id: call_id.clone(),
                            queue_name: name.clone(),
                            position,
                        },
                    )
                    .await;
                Ok(CallDecision::Queue {
                    queue_name: name,
                    position,
                    estimated_wait: position as u64 * estimated_handle_secs,
                })
            }
            RouteDecision::Forward { target, timeout } => {
                session.forward_target = Some(target.clone());
                let snapshot =
                    self.register_active(&mut table, session, CallState::Forwarding);
                drop(table);
                self.events
                    .publish(
                        &snapshot,
                        &CallEvent::CallForwarded {
                            call_id: snapshot.call_id.clone(),
                            target: target.clone(),
                        },
                    )
                    .await;
                self.events
                    .publish(
                        &snapshot,
                        &CallEvent::CallStateChanged {
                            call_id: snapshot.call_id.clone(),
                            old_state: CallState::Initializing,
                            new_state: CallState::Forwarding,
                        },
                    )
                    .await;
                Ok(CallDecision::Forward {
                    target,
                    timeout,
                    call_id: snapshot.call_id.clone(),
                })
            }
            RouteDecision::Accept { target } => {
                debug!(
                    call_id = session.call_id,
                    target, "call accepted by routing"
                );
                let snapshot = self.register_active(&mut table, session, CallState::Ringing);
                drop(table);
                let ringing_timeout = self.config.call.ring_timeout_secs;
                self.events
                    .publish(
                        &snapshot,
                        &CallEvent::CallAccepted {
                            call_id: snapshot.call_id.clone(),
                            ringing_timeout,
                        },
                    )
                    .await;
                self.events
                    .publish(
                        &snapshot,
                        &CallEvent::CallStateChanged {
                            call_id: snapshot.call_id.clone(),
                            old_state: CallState::Initializing,
                            new_state: CallState::Ringing,
                        },
                    )
                    .await;
                Ok(CallDecision::Accept {
                    call_id: snapshot.call_id.clone(),
                    session_id: snapshot.session_id.clone(),
                    ringing_timeout,
                })
            }
        }
    }

    /// Outbound legs skip routing: the application backend already chose
    /// the target. Admission control still applies.
    pub async fn initiate_outbound_call(&self, request: OutboundCall) -> CallDecision {
        let caller = CallParticipant::new(request.caller.clone());
        let callee = CallParticipant::new(request.callee.clone());
        let call_id = request
            .call_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut session =
            CallSession::new(call_id, CallDirection::Outbound, caller, callee);
        session.priority =
            self.assign_priority(&request.callee, &request.headers, request.priority);
        session.ai_session_id = request.ai_session_id.clone();
        if !request.headers.is_empty() {
            session
                .custom_data
                .insert("headers".to_string(), json!(request.headers));
        }

        let mut table = self.table.lock().await;
        if self.call_id_in_use(&table, &session.call_id) {
            warn!(call_id = session.call_id, "duplicate call id");
            return CallDecision::Reject {
                code: 400,
                reason: "duplicate_call_id".to_string(),
            };
        }
        if let Some(reason) = self.admission_denied(&table, &session) {
            info!(
                call_id = session.call_id,
                caller = session.caller.number,
                "outbound admission denied: {}",
                reason
            );
            return CallDecision::Reject { code: 486, reason };
        }
        let snapshot = self.register_active(&mut table, session, CallState::Initializing);
        CallDecision::Accept {
            call_id: snapshot.call_id.clone(),
            session_id: snapshot.session_id.clone(),
            ringing_timeout: self.config.call.ring_timeout_secs,
        }
    }

    /// Apply a state transition reported by the signaling layer or a
    /// collaborator. Unknown calls and illegal transitions return false
    /// without mutation. Hold, resume and transfer entry are refused
    /// here: they carry side effects (flag, hold music, target) owned by
    /// `hold_call`/`resume_call`/`transfer_call`. Accepted transitions
    /// notify the synchronizer before the lock is released and publish
    /// events after.
    pub async fn update_call_state(
        self: &Arc<Self>,
        call_id: &str,
        new_state: CallState,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let mut table = self.table.lock().await;
        let Some(session) = table.sessions.get_mut(call_id) else {
            warn!(call_id, ?new_state, "state update for unknown call");
            return false;
        };
        let old_state = session.state;
        if new_state == CallState::OnHold
            || (old_state == CallState::OnHold && new_state == CallState::Connected)
        {
            warn!(
                call_id,
                ?old_state,
                ?new_state,
                "hold changes go through hold_call/resume_call"
            );
            return false;
        }
        if new_state == CallState::Transferring {
            warn!(call_id, "transfers go through transfer_call");
            return false;
        }
        if !session.transition_to(new_state) {
            warn!(
                call_id,
                ?old_state,
                ?new_state,
                "illegal state transition"
            );
            return false;
        }
        if old_state == CallState::OnHold {
            // only teardown exits reach here; hold music is stopped by hangup
            session.on_hold = false;
        }
        if let Some(metadata) = &metadata {
            session.merge_metadata(metadata);
        }
        self.synchronizer.record_state(session, new_state);
        let snapshot = session.clone();
        let newly_terminal = new_state.is_terminal() && !old_state.is_terminal();
        let first_connect = new_state == CallState::Connected
            && matches!(
                old_state,
                CallState::Initializing
                    | CallState::Ringing
                    | CallState::Connecting
                    | CallState::Forwarding
            );
        if newly_terminal {
            self.finish_session(&mut table, &snapshot, new_state);
        }
        drop(table);

        if first_connect {
            self.ivr.start_session(call_id, None).await;
        }

        if old_state != new_state {
            self.events
                .publish(
                    &snapshot,
                    &CallEvent::CallStateChanged {
                        call_id: call_id.to_string(),
                        old_state,
                        new_state,
                    },
                )
                .await;
        }
        if newly_terminal {
            self.events
                .publish(
                    &snapshot,
                    &CallEvent::CallCompleted {
                        call_id: call_id.to_string(),
                        state: new_state,
                    },
                )
                .await;
            self.schedule_removal(call_id.to_string());
        }
        true
    }

    /// Hold is only legal from CONNECTED.
    pub async fn hold_call(&self, call_id: &str) -> bool {
        let snapshot = {
            let mut table = self.table.lock().await;
            let Some(session) = table.sessions.get_mut(call_id) else {
                warn!(call_id, "hold for unknown call");
                return false;
            };
            if session.state != CallState::Connected {
                warn!(call_id, state = ?session.state, "hold refused");
                return false;
            }
            session.transition_to(CallState::OnHold);
            session.on_hold = true;
            self.synchronizer.record_state(session, CallState::OnHold);
            session.clone()
        };
        self.hold_music.start(call_id, None).await;
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallStateChanged {
                    call_id: call_id.to_string(),
                    old_state: CallState::Connected,
                    new_state: CallState::OnHold,
                },
            )
            .await;
        true
    }

    /// Resume is only legal from ON_HOLD, back to CONNECTED.
    pub async fn resume_call(&self, call_id: &str) -> bool {
        let snapshot = {
            let mut table = self.table.lock().await;
            let Some(session) = table.sessions.get_mut(call_id) else {
                warn!(call_id, "resume for unknown call");
                return false;
            };
            if session.state != CallState::OnHold {
                warn!(call_id, state = ?session.state, "resume refused");
                return false;
            }
            session.transition_to(CallState::Connected);
            session.on_hold = false;
            self.synchronizer
                .record_state(session, CallState::Connected);
            session.clone()
        };
        self.hold_music.stop(call_id).await;
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallStateChanged {
                    call_id: call_id.to_string(),
                    old_state: CallState::OnHold,
                    new_state: CallState::Connected,
                },
            )
            .await;
        true
    }

    /// Record the transfer target and hand the leg to the signaling
    /// layer; the transfer outcome comes back as a later state update.
    pub async fn transfer_call(&self, call_id: &str, target: &str) -> bool {
        let snapshot = {
            let mut table = self.table.lock().await;
            let Some(session) = table.sessions.get_mut(call_id) else {
                warn!(call_id, "transfer for unknown call");
                return false;
            };
            if session.state != CallState::Connected {
                warn!(call_id, state = ?session.state, "transfer refused");
                return false;
            }
            session.transfer_target = Some(target.to_string());
            session.transition_to(CallState::Transferring);
            self.synchronizer
                .record_state(session, CallState::Transferring);
            session.clone()
        };
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallTransferring {
                    call_id: call_id.to_string(),
                    target: target.to_string(),
                },
            )
            .await;
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallStateChanged {
                    call_id: call_id.to_string(),
                    old_state: CallState::Connected,
                    new_state: CallState::Transferring,
                },
            )
            .await;
        true
    }

    /// Recording toggles a flag, never the lifecycle state.
    pub async fn start_recording(&self, call_id: &str, target: Option<String>) -> bool {
        let mut table = self.table.lock().await;
        let Some(session) = table.sessions.get_mut(call_id) else {
            warn!(call_id, "start recording for unknown call");
            return false;
        };
        if !matches!(session.state, CallState::Connected | CallState::OnHold) {
            warn!(call_id, state = ?session.state, "recording refused");
            return false;
        }
        if session.recording {
            return true;
        }
        session.recording = true;
        session.recording_target = target;
        info!(call_id, "recording started");
        true
    }

    pub async fn stop_recording(&self, call_id: &str) -> bool {
        let mut table = self.table.lock().await;
        let Some(session) = table.sessions.get_mut(call_id) else {
            warn!(call_id, "stop recording for unknown call");
            return false;
        };
        if !session.recording {
            return false;
        }
        session.recording = false;
        info!(call_id, "recording stopped");
        true
    }

    /// Tear down interactive features, then drive the session terminal:
    /// COMPLETED for a normal hangup, FAILED with the reason recorded
    /// otherwise.
    pub async fn hangup_call(self: &Arc<Self>, call_id: &str, reason: Option<&str>) -> bool {
        {
            let table = self.table.lock().await;
            match table.sessions.get(call_id) {
                Some(session) if !session.state.is_terminal() => {}
                Some(_) => {
                    debug!(call_id, "hangup for already-terminal call");
                    return false;
                }
                None => {
                    warn!(call_id, "hangup for unknown call");
                    return false;
                }
            }
        }
        self.dtmf.unsubscribe(call_id).await;
        self.ivr.end_session(call_id, reason.unwrap_or("normal")).await;
        self.hold_music.stop(call_id).await;
        match reason {
            None | Some("normal") => {
                self.update_call_state(call_id, CallState::Completed, None)
                    .await
            }
            Some(reason) => {
                self.update_call_state(
                    call_id,
                    CallState::Failed,
                    Some(json!({ "hangup_reason": reason })),
                )
                .await
            }
        }
    }

    /// Forward a detected digit to the DTMF collaborator and publish it.
    pub async fn process_dtmf(&self, call_id: &str, source: DtmfSource) -> Option<DtmfEvent> {
        let snapshot = {
            let table = self.table.lock().await;
            match table.sessions.get(call_id) {
                Some(session) => session.clone(),
                None => {
                    warn!(call_id, "dtmf for unknown call");
                    return None;
                }
            }
        };
        let event = self.dtmf.process_dtmf(call_id, source).await?;
        self.events
            .publish(
                &snapshot,
                &CallEvent::DtmfDetected {
                    call_id: call_id.to_string(),
                    digit: event.digit.clone(),
                    source: event.source,
                },
            )
            .await;
        Some(event)
    }

    /// Pop the next queued call and admit it as an active ringing leg.
    /// The call is put back when admission now fails.
    pub async fn dequeue_next(&self, queue_name: &str) -> Option<CallDecision> {
        let mut table = self.table.lock().await;
        let queued = table.queues.get_mut(queue_name)?.next()?;
        let session = queued.session;
        if let Some(reason) = self.admission_denied(&table, &session) {
            debug!(
                call_id = session.call_id,
                queue_name, "dequeue deferred: {}", reason
            );
            if let Some(queue) = table.queues.get_mut(queue_name) {
                queue.add(session);
            }
            return None;
        }
        let snapshot = self.register_active(&mut table, session, CallState::Ringing);
        drop(table);
        let ringing_timeout = self.config.call.ring_timeout_secs;
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallAccepted {
                    call_id: snapshot.call_id.clone(),
                    ringing_timeout,
                },
            )
            .await;
        self.events
            .publish(
                &snapshot,
                &CallEvent::CallStateChanged {
                    call_id: snapshot.call_id.clone(),
                    old_state: CallState::Initializing,
                    new_state: CallState::Ringing,
                },
            )
            .await;
        Some(CallDecision::Accept {
            call_id: snapshot.call_id.clone(),
            session_id: snapshot.session_id.clone(),
            ringing_timeout,
        })
    }

    pub async fn get_session(&self, call_id: &str) -> Option<CallSession> {
        let table = self.table.lock().await;
        table.sessions.get(call_id).cloned()
    }

    pub async fn queue_statistics(&self, queue_name: &str) -> Option<QueueStatistics> {
        let table = self.table.lock().await;
        table.queues.get(queue_name).map(|q| q.statistics())
    }

    pub async fn statistics(&self) -> CallStatistics {
        let table = self.table.lock().await;
        let active_calls = table
            .sessions
            .values()
            .filter(|s| !s.state.is_terminal())
            .count();
        let durations: Vec<i64> = table
            .sessions
            .values()
            .filter_map(|s| s.duration())
            .map(|d| d.num_seconds())
            .collect();
        drop(table);
        let total_calls = self.counters.total.load(Ordering::Relaxed);
        let completed_calls = self.counters.completed.load(Ordering::Relaxed);
        let failed_calls = self.counters.failed.load(Ordering::Relaxed);
        let success_rate = if total_calls == 0 {
            0.0
        } else {
            completed_calls as f64 / total_calls as f64
        };
        let average_duration_secs = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        };
        CallStatistics {
            total_calls,
            completed_calls,
            failed_calls,
            active_calls,
            uptime_secs: self.counters.started_at.elapsed().as_secs(),
            success_rate,
            average_duration_secs,
        }
    }

    /// Attach or refresh the application-backend linkage and push the
    /// updated correlation ids to the proxy.
    pub async fn attach_ai_session(
        &self,
        call_id: &str,
        ai_session_id: String,
        ai_context: Option<serde_json::Value>,
    ) -> bool {
        let mut table = self.table.lock().await;
        let Some(session) = table.sessions.get_mut(call_id) else {
            warn!(call_id, "ai session attach for unknown call");
            return false;
        };
        session.ai_session_id = Some(ai_session_id);
        session.ai_context = ai_context;
        self.synchronizer.record_created(session);
        true
    }

    fn call_id_in_use(&self, table: &CallTable, call_id: &str) -> bool {
        table.sessions.contains_key(call_id)
            || table
                .queues
                .values()
                .any(|q| q.position(call_id).is_some())
    }

    fn admission_denied(&self, table: &CallTable, session: &CallSession) -> Option<String> {
        let active = table
            .sessions
            .values()
            .filter(|s| !s.state.is_terminal())
            .count();
        if active >= self.config.call.max_concurrent_calls {
            return Some("max_concurrent_calls_reached".to_string());
        }
        let number = &session.caller.number;
        let limit = self
            .config
            .call
            .number_limits
            .get(number)
            .copied()
            .unwrap_or(self.config.call.max_calls_per_number);
        if limit > 0 {
            let current = table.caller_counts.get(number).copied().unwrap_or(0);
            if current >= limit {
                return Some("caller_limit_reached".to_string());
            }
        }
        None
    }

    /// Register a session into the active table. Must run with the table
    /// lock held so the admission check it follows stays atomic.
    fn register_active(
        &self,
        table: &mut CallTable,
        mut session: CallSession,
        initial: CallState,
    ) -> CallSession {
        *table
            .caller_counts
            .entry(session.caller.number.clone())
            .or_insert(0) += 1;
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        self.synchronizer.record_created(&session);
        if session.state != initial {
            session.transition_to(initial);
            self.synchronizer.record_state(&session, initial);
        }
        let snapshot = session.clone();
        table.sessions.insert(session.call_id.clone(), session);
        snapshot
    }

    /// Completion pipeline: statistics, per-number counter release (at
    /// most once, guarded by the positivity check) and proxy cleanup.
    fn finish_session(&self, table: &mut CallTable, session: &CallSession, state: CallState) {
        if state == CallState::Completed {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        let number = session.caller.number.clone();
        if let Some(count) = table.caller_counts.get_mut(&number) {
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 {
                table.caller_counts.remove(&number);
            }
        }
        self.synchronizer.record_completed(session);
        info!(
            call_id = session.call_id,
            ?state,
            duration_secs = session.duration().map(|d| d.num_seconds()).unwrap_or(0),
            "call finished"
        );
    }

    /// Terminal sessions stay queryable for the grace period, then drop
    /// out of the active table. Shutdown cancels the timer.
    fn schedule_removal(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let delay = Duration::from_secs(self.config.call.cleanup_delay_secs);
        let token = self.token.child_token();
        tokio::spawn(async move {
            select! {
                _ = token.cancelled() => {}
                _ = sleep(delay) => {
                    let mut table = manager.table.lock().await;
                    if table.sessions.remove(&call_id).is_some() {
                        debug!(call_id, "session removed after grace period");
                    }
                }
            }
        });
    }

    async fn sweep_queues(self: Arc<Self>) {
        let token = self.token.child_token();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.call.queue_sweep_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let expired: Vec<(String, QueuedCall)> = {
                        let mut table = self.table.lock().await;
                        let mut expired = Vec::new();
                        for (name, queue) in table.queues.iter_mut() {
                            for call in queue.expire(now) {
                                expired.push((name.clone(), call));
                            }
                        }
                        expired
                    };
                    for (queue_name, call) in expired {
                        let waited_secs = (now - call.queued_at).num_seconds().max(0) as u64;
                        warn!(
                            call_id = call.session.call_id,
                            queue_name,
                            waited_secs,
                            "queued call expired"
                        );
                        self.events
                            .publish(
                                &call.session,
                                &CallEvent::QueueExpired {
                                    call_id: call.session.call_id.clone(),
                                    queue_name,
                                    waited_secs,
                                },
                            )
                            .await;
                    }
                }
            }
        }
    }

    /// Emergency prefixes win over everything; an explicit priority or
    /// an X-Priority header applies otherwise.
    fn assign_priority(
        &self,
        number: &str,
        headers: &HashMap<String, String>,
        explicit: Option<CallPriority>,
    ) -> CallPriority {
        let digits = number.trim_start_matches('+');
        if self
            .config
            .call
            .emergency_prefixes
            .iter()
            .any(|p| digits.starts_with(p.as_str()) || number.starts_with(p.as_str()))
        {
            return CallPriority::Emergency;
        }
        if let Some(priority) = explicit {
            return priority;
        }
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("x-priority"))
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(CallPriority::Normal)
    }

    fn queue_config(&self, name: &str) -> QueueConfig {
        self.config.queues.get(name).cloned().unwrap_or_default()
    }
}
