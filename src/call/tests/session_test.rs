use super::common::make_session;
use crate::call::session::CallState;
use serde_json::json;

#[test]
fn lifecycle_follows_legal_edges() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    assert_eq!(session.state, CallState::Initializing);

    assert!(session.transition_to(CallState::Ringing));
    assert!(session.transition_to(CallState::Connected));
    assert!(session.transition_to(CallState::OnHold));
    assert!(session.transition_to(CallState::Connected));
    assert!(session.transition_to(CallState::Completed));
    assert!(session.state.is_terminal());
}

#[test]
fn illegal_edges_are_refused_without_mutation() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    // hold before answer
    assert!(!session.transition_to(CallState::OnHold));
    assert_eq!(session.state, CallState::Initializing);

    session.transition_to(CallState::Ringing);
    assert!(!session.transition_to(CallState::Transferring));
    assert_eq!(session.state, CallState::Ringing);
}

#[test]
fn terminal_states_are_final() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    session.transition_to(CallState::Ringing);
    session.transition_to(CallState::Cancelled);

    for next in [
        CallState::Ringing,
        CallState::Connected,
        CallState::Completed,
        CallState::Failed,
    ] {
        assert!(!session.transition_to(next), "{:?} after cancel", next);
    }
    assert_eq!(session.state, CallState::Cancelled);
}

#[test]
fn timestamps_are_stamped_once_in_order() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    assert!(session.ring_start.is_none());

    session.transition_to(CallState::Ringing);
    let ring_start = session.ring_start.expect("ring_start set");

    session.transition_to(CallState::Connected);
    let connect_time = session.connect_time.expect("connect_time set");
    assert!(ring_start <= connect_time);

    // repeated transition to the same state is a no-op on timestamps
    assert!(session.transition_to(CallState::Connected));
    assert_eq!(session.connect_time, Some(connect_time));

    session.transition_to(CallState::Completed);
    let end_time = session.end_time.expect("end_time set");
    assert!(connect_time <= end_time);
}

#[test]
fn hold_cycle_preserves_connect_time() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    session.transition_to(CallState::Ringing);
    session.transition_to(CallState::Connected);
    let connect_time = session.connect_time;

    session.transition_to(CallState::OnHold);
    session.transition_to(CallState::Connected);
    assert_eq!(session.connect_time, connect_time);
}

#[test]
fn duration_is_undefined_before_answer() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    assert!(session.duration().is_none());
    session.transition_to(CallState::Ringing);
    assert!(session.duration().is_none());
    assert!(session.ring_duration().is_some());

    session.transition_to(CallState::Connected);
    assert!(session.duration().is_some());
    session.transition_to(CallState::Completed);
    let fixed = session.duration().expect("duration fixed after end");
    assert!(fixed.num_seconds() >= 0);
}

#[test]
fn metadata_merge_overwrites_top_level_keys() {
    let mut session = make_session("c1", "+15550001", "+15559999");
    session.merge_metadata(&json!({ "campaign": "a", "attempt": 1 }));
    session.merge_metadata(&json!({ "campaign": "b" }));
    // non-objects contribute nothing
    session.merge_metadata(&json!("ignored"));

    assert_eq!(session.custom_data["campaign"], json!("b"));
    assert_eq!(session.custom_data["attempt"], json!(1));
    assert_eq!(session.custom_data.len(), 2);
}
