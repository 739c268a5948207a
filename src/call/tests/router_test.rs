use super::common::make_session;
use crate::call::router::{CallRouter, RouteDecision, RoutingRule, RuleAction};
use crate::call::CallPriority;
use crate::config::RoutingConfig;
use chrono::NaiveTime;

fn noon() -> NaiveTime {
    NaiveTime::from_hms_opt(12, 0, 0).unwrap()
}

fn rule(priority: i32, action: RuleAction) -> RoutingRule {
    RoutingRule {
        priority,
        caller_pattern: None,
        callee_pattern: None,
        time_start: None,
        time_end: None,
        action,
    }
}

#[test]
fn defaults_to_accept_with_callee_target() {
    let router = CallRouter::new(&RoutingConfig::default());
    let session = make_session("c1", "+15550001", "+15559999");
    assert_eq!(
        router.route_at(&session, noon()),
        RouteDecision::Accept {
            target: "+15559999".to_string()
        }
    );
}

#[test]
fn blacklist_wins_over_everything() {
    let config = RoutingConfig {
        blacklist: vec!["+15550001".to_string()],
        whitelist: vec!["+15550001".to_string()],
        rules: vec![rule(100, RuleAction::Accept)],
    };
    let router = CallRouter::new(&config);
    let session = make_session("c1", "+15550001", "+15559999");
    assert_eq!(
        router.route_at(&session, noon()),
        RouteDecision::Reject {
            code: 403,
            reason: "caller_blacklisted".to_string()
        }
    );
}

#[test]
fn nonempty_whitelist_excludes_unknown_callers() {
    let config = RoutingConfig {
        whitelist: vec!["+15550002".to_string()],
        ..Default::default()
    };
    let router = CallRouter::new(&config);

    let outsider = make_session("c1", "+15550001", "+15559999");
    assert_eq!(
        router.route_at(&outsider, noon()),
        RouteDecision::Reject {
            code: 403,
            reason: "caller_not_whitelisted".to_string()
        }
    );

    let member = make_session("c2", "+15550002", "+15559999");
    assert!(matches!(
        router.route_at(&member, noon()),
        RouteDecision::Accept { .. }
    ));
}

#[test]
fn rules_apply_in_descending_priority_order() {
    let config = RoutingConfig {
        rules: vec![
            RoutingRule {
                caller_pattern: Some("^\\+1555.*".to_string()),
                ..rule(
                    10,
                    RuleAction::Reject {
                        code: 403,
                        reason: "low_priority_rule".to_string(),
                    },
                )
            },
            RoutingRule {
                caller_pattern: Some("^\\+1555.*".to_string()),
                ..rule(
                    100,
                    RuleAction::Queue {
                        name: "support".to_string(),
                        priority: CallPriority::High,
                    },
                )
            },
        ],
        ..Default::default()
    };
    let router = CallRouter::new(&config);
    let session = make_session("c1", "+15550001", "+15559999");
    assert_eq!(
        router.route_at(&session, noon()),
        RouteDecision::Queue {
            name: "support".to_string(),
            priority: CallPriority::High,
        }
    );
}

#[test]
fn all_conditions_must_match() {
    let config = RoutingConfig {
        rules: vec![RoutingRule {
            caller_pattern: Some("^\\+1555.*".to_string()),
            callee_pattern: Some("^\\+49.*".to_string()),
            ..rule(
                100,
                RuleAction::Forward {
                    target: "sip:berlin@example.com".to_string(),
                    timeout_secs: 20,
                },
            )
        }],
        ..Default::default()
    };
    let router = CallRouter::new(&config);

    // caller matches, callee does not
    let miss = make_session("c1", "+15550001", "+15559999");
    assert!(matches!(
        router.route_at(&miss, noon()),
        RouteDecision::Accept { .. }
    ));

    let hit = make_session("c2", "+15550001", "+4930123456");
    assert_eq!(
        router.route_at(&hit, noon()),
        RouteDecision::Forward {
            target: "sip:berlin@example.com".to_string(),
            timeout: 20,
        }
    );
}

#[test]
fn time_window_is_inclusive_and_may_wrap_midnight() {
    let config = RoutingConfig {
        rules: vec![RoutingRule {
            time_start: Some("09:00".to_string()),
            time_end: Some("17:00".to_string()),
            ..rule(
                100,
                RuleAction::Reject {
                    code: 403,
                    reason: "office_hours".to_string(),
                },
            )
        }],
        ..Default::default()
    };
    let router = CallRouter::new(&config);
    let session = make_session("c1", "+15550001", "+15559999");

    for hhmm in [(9, 0), (12, 30), (17, 0)] {
        let t = NaiveTime::from_hms_opt(hhmm.0, hhmm.1, 0).unwrap();
        assert!(
            matches!(router.route_at(&session, t), RouteDecision::Reject { .. }),
            "{:?} should be inside the window",
            hhmm
        );
    }
    let evening = NaiveTime::from_hms_opt(17, 0, 1).unwrap();
    assert!(matches!(
        router.route_at(&session, evening),
        RouteDecision::Accept { .. }
    ));

    let night_config = RoutingConfig {
        rules: vec![RoutingRule {
            time_start: Some("22:00".to_string()),
            time_end: Some("06:00".to_string()),
            ..rule(
                100,
                RuleAction::Queue {
                    name: "night".to_string(),
                    priority: CallPriority::Normal,
                },
            )
        }],
        ..Default::default()
    };
    let night_router = CallRouter::new(&night_config);
    let midnight = NaiveTime::from_hms_opt(0, 30, 0).unwrap();
    assert!(matches!(
        night_router.route_at(&session, midnight),
        RouteDecision::Queue { .. }
    ));
    assert!(matches!(
        night_router.route_at(&session, noon()),
        RouteDecision::Accept { .. }
    ));
}

#[test]
fn bad_patterns_drop_the_rule_not_the_router() {
    let config = RoutingConfig {
        rules: vec![RoutingRule {
            caller_pattern: Some("([".to_string()),
            ..rule(
                100,
                RuleAction::Reject {
                    code: 403,
                    reason: "never".to_string(),
                },
            )
        }],
        ..Default::default()
    };
    let router = CallRouter::new(&config);
    let session = make_session("c1", "+15550001", "+15559999");
    assert!(matches!(
        router.route_at(&session, noon()),
        RouteDecision::Accept { .. }
    ));
}
