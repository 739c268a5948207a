use super::session::CallSession;
use super::CallPriority;
use crate::config::RoutingConfig;
use chrono::{Local, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Action attached to a routing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Accept,
    Reject {
        #[serde(default = "default_reject_code")]
        code: u16,
        reason: String,
    },
    Forward {
        target: String,
        #[serde(default = "default_forward_timeout")]
        timeout_secs: u64,
    },
    Queue {
        name: String,
        #[serde(default)]
        priority: CallPriority,
    },
}

fn default_reject_code() -> u16 {
    403
}

fn default_forward_timeout() -> u64 {
    30
}

/// Ordered policy unit. All present conditions must match for the rule
/// to apply. Time windows are "HH:MM" local time, inclusive on both ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub caller_pattern: Option<String>,
    #[serde(default)]
    pub callee_pattern: Option<String>,
    #[serde(default)]
    pub time_start: Option<String>,
    #[serde(default)]
    pub time_end: Option<String>,
    pub action: RuleAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Accept { target: String },
    Reject { code: u16, reason: String },
    Forward { target: String, timeout: u64 },
    Queue { name: String, priority: CallPriority },
}

struct CompiledRule {
    priority: i32,
    caller: Option<Regex>,
    callee: Option<Regex>,
    window: Option<(NaiveTime, NaiveTime)>,
    action: RuleAction,
}

impl CompiledRule {
    fn matches(&self, session: &CallSession, now: NaiveTime) -> bool {
        if let Some(caller) = &self.caller {
            if !caller.is_match(&session.caller.number) {
                return false;
            }
        }
        if let Some(callee) = &self.callee {
            if !callee.is_match(&session.callee.number) {
                return false;
            }
        }
        if let Some((start, end)) = self.window {
            let inside = if start <= end {
                now >= start && now <= end
            } else {
                // window wraps midnight
                now >= start || now <= end
            };
            if !inside {
                return false;
            }
        }
        true
    }
}

/// Stateless routing policy: blacklist, then whitelist, then rules in
/// descending priority order, then default accept. Never touches call
/// state.
pub struct CallRouter {
    blacklist: HashSet<String>,
    whitelist: HashSet<String>,
    rules: Vec<CompiledRule>,
}

impl CallRouter {
    pub fn new(config: &RoutingConfig) -> Self {
        let mut rules: Vec<CompiledRule> = config
            .rules
            .iter()
            .filter_map(compile_rule)
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            blacklist: config.blacklist.iter().cloned().collect(),
            whitelist: config.whitelist.iter().cloned().collect(),
            rules,
        }
    }

    pub fn route(&self, session: &CallSession) -> RouteDecision {
        self.route_at(session, Local::now().time())
    }

    pub(crate) fn route_at(&self, session: &CallSession, now: NaiveTime) -> RouteDecision {
        let caller = &session.caller.number;
        if self.blacklist.contains(caller) {
            return RouteDecision::Reject {
                code: 403,
                reason: "caller_blacklisted".to_string(),
            };
        }
        if !self.whitelist.is_empty() && !self.whitelist.contains(caller) {
            return RouteDecision::Reject {
                code: 403,
                reason: "caller_not_whitelisted".to_string(),
            };
        }
        for rule in &self.rules {
            if !rule.matches(session, now) {
                continue;
            }
            debug!(
                call_id = session.call_id,
                rule_priority = rule.priority,
                "routing rule matched"
            );
            return match &rule.action {
                RuleAction::Accept => RouteDecision::Accept {
                    target: session.callee.number.clone(),
                },
                RuleAction::Reject { code, reason } => RouteDecision::Reject {
                    code: *code,
                    reason: reason.clone(),
                },
                RuleAction::Forward {
                    target,
                    timeout_secs,
                } => RouteDecision::Forward {
                    target: target.clone(),
                    timeout: *timeout_secs,
                },
                RuleAction::Queue { name, priority } => RouteDecision::Queue {
                    name: name.clone(),
                    priority: *priority,
                },
            };
        }
        RouteDecision::Accept {
            target: session.callee.number.clone(),
        }
    }
}

fn compile_rule(rule: &RoutingRule) -> Option<CompiledRule> {
    let caller = match &rule.caller_pattern {
        Some(pattern) => match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern, "dropping rule with bad caller pattern: {}", e);
                return None;
            }
        },
        None => None,
    };
    let callee = match &rule.callee_pattern {
        Some(pattern) => match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!(pattern, "dropping rule with bad callee pattern: {}", e);
                return None;
            }
        },
        None => None,
    };
    let window = match (&rule.time_start, &rule.time_end) {
        (Some(start), Some(end)) => match (parse_time(start), parse_time(end)) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => {
                warn!(start, end, "dropping rule with bad time window");
                return None;
            }
        },
        (None, None) => None,
        _ => {
            warn!("dropping rule with half-open time window");
            return None;
        }
    };
    Some(CompiledRule {
        priority: rule.priority,
        caller,
        callee,
        window,
        action: rule.action.clone(),
    })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}
