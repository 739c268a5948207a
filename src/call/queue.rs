use super::session::CallSession;
use crate::config::QueueConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// A call parked in a queue, with its 1-based position recomputed on
/// every queue mutation.
#[derive(Debug, Clone)]
pub struct QueuedCall {
    pub session: CallSession,
    pub queued_at: DateTime<Utc>,
    pub position: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub size: usize,
    pub max_size: usize,
    pub average_wait_secs: f64,
    pub by_priority: HashMap<String, usize>,
}

/// A bounded waiting area for calls that a routing decision deferred.
/// Calls leave by priority, FIFO among equal priorities, or by expiry.
#[derive(Debug)]
pub struct CallQueue {
    name: String,
    max_size: usize,
    timeout: Duration,
    calls: Vec<QueuedCall>,
}

impl CallQueue {
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        Self {
            name: name.into(),
            max_size: config.max_size,
            timeout: Duration::from_secs(config.timeout_secs),
            calls: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Returns false without mutation when the queue is full.
    pub fn add(&mut self, session: CallSession) -> bool {
        if self.calls.len() >= self.max_size {
            return false;
        }
        self.calls.push(QueuedCall {
            session,
            queued_at: Utc::now(),
            position: 0,
        });
        self.recompute_positions();
        true
    }

    pub fn remove(&mut self, call_id: &str) -> Option<CallSession> {
        let index = self
            .calls
            .iter()
            .position(|c| c.session.call_id == call_id)?;
        let removed = self.calls.remove(index);
        self.recompute_positions();
        Some(removed.session)
    }

    /// Pop the next call: highest priority first, earliest created among
    /// equals (FIFO, never LIFO).
    pub fn next(&mut self) -> Option<QueuedCall> {
        if self.calls.is_empty() {
            return None;
        }
        let next = self.calls.remove(0);
        self.recompute_positions();
        Some(next)
    }

    /// Remove and return every call older than the queue timeout. The
    /// boundary is exclusive: a call exactly at the timeout stays.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<QueuedCall> {
        let timeout = chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::zero());
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .calls
            .drain(..)
            .partition(|c| now - c.queued_at > timeout);
        self.calls = kept;
        self.recompute_positions();
        expired
    }

    pub fn position(&self, call_id: &str) -> Option<usize> {
        self.calls
            .iter()
            .find(|c| c.session.call_id == call_id)
            .map(|c| c.position)
    }

    pub fn statistics(&self) -> QueueStatistics {
        let now = Utc::now();
        let total_wait: i64 = self
            .calls
            .iter()
            .map(|c| (now - c.queued_at).num_seconds().max(0))
            .sum();
        let average_wait_secs = if self.calls.is_empty() {
            0.0
        } else {
            total_wait as f64 / self.calls.len() as f64
        };
        let mut by_priority: HashMap<String, usize> = HashMap::new();
        for call in &self.calls {
            let key = format!("{:?}", call.session.priority).to_lowercase();
            *by_priority.entry(key).or_insert(0) += 1;
        }
        QueueStatistics {
            size: self.calls.len(),
            max_size: self.max_size,
            average_wait_secs,
            by_priority,
        }
    }

    /// Keep the backing vec sorted in dequeue order so position 1 is
    /// always the next call out.
    fn recompute_positions(&mut self) {
        self.calls.sort_by(|a, b| {
            b.session
                .priority
                .cmp(&a.session.priority)
                .then(a.session.created_at.cmp(&b.session.created_at))
        });
        for (index, call) in self.calls.iter_mut().enumerate() {
            call.position = index + 1;
        }
    }
}
