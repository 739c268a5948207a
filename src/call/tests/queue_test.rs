use super::common::make_session;
use crate::call::queue::CallQueue;
use crate::call::CallPriority;
use crate::config::QueueConfig;
use chrono::{Duration, Utc};

fn queue(max_size: usize, timeout_secs: u64) -> CallQueue {
    CallQueue::new(
        "support",
        &QueueConfig {
            max_size,
            timeout_secs,
            estimated_handle_secs: 30,
        },
    )
}

#[test]
fn add_is_bounded_at_max_size() {
    let mut q = queue(2, 300);
    assert!(q.add(make_session("c1", "+1", "+9")));
    assert!(q.add(make_session("c2", "+2", "+9")));
    assert!(!q.add(make_session("c3", "+3", "+9")));
    assert_eq!(q.len(), 2);
    assert!(q.position("c3").is_none());
}

#[test]
fn next_prefers_priority_then_fifo() {
    let mut q = queue(10, 300);
    let base = Utc::now();

    let mut first = make_session("old-normal", "+1", "+9");
    first.created_at = base - Duration::seconds(30);
    let mut second = make_session("new-normal", "+2", "+9");
    second.created_at = base - Duration::seconds(10);
    let mut urgent = make_session("late-high", "+3", "+9");
    urgent.created_at = base;
    urgent.priority = CallPriority::High;

    q.add(second.clone());
    q.add(first.clone());
    q.add(urgent.clone());

    assert_eq!(q.next().unwrap().session.call_id, "late-high");
    // equal priority drains oldest first, never LIFO
    assert_eq!(q.next().unwrap().session.call_id, "old-normal");
    assert_eq!(q.next().unwrap().session.call_id, "new-normal");
    assert!(q.next().is_none());
}

#[test]
fn positions_stay_contiguous_after_mutations() {
    let mut q = queue(10, 300);
    let base = Utc::now();
    for (i, id) in ["c1", "c2", "c3", "c4"].iter().enumerate() {
        let mut s = make_session(id, "+1", "+9");
        s.created_at = base + Duration::seconds(i as i64);
        q.add(s);
    }
    assert!(q.remove("c2").is_some());
    assert!(q.remove("c2").is_none());

    let positions: Vec<usize> = ["c1", "c3", "c4"]
        .iter()
        .map(|id| q.position(id).unwrap())
        .collect();
    assert_eq!(positions, vec![1, 2, 3]);
}

#[test]
fn expire_boundary_is_exclusive() {
    let before_add = Utc::now();
    let mut q = queue(10, 10);
    q.add(make_session("c1", "+1", "+9"));
    let after_add = Utc::now();

    // age <= timeout: stays
    let at_boundary = before_add + Duration::seconds(10);
    assert!(q.expire(at_boundary).is_empty());
    assert_eq!(q.len(), 1);

    // age > timeout: removed
    let past_boundary = after_add + Duration::seconds(11);
    let expired = q.expire(past_boundary);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].session.call_id, "c1");
    assert!(q.is_empty());
}

#[test]
fn statistics_break_down_by_priority() {
    let mut q = queue(10, 300);
    q.add(make_session("c1", "+1", "+9"));
    let mut high = make_session("c2", "+2", "+9");
    high.priority = CallPriority::High;
    q.add(high);

    let stats = q.statistics();
    assert_eq!(stats.size, 2);
    assert_eq!(stats.max_size, 10);
    assert_eq!(stats.by_priority.get("normal"), Some(&1));
    assert_eq!(stats.by_priority.get("high"), Some(&1));
    assert!(stats.average_wait_secs >= 0.0);
}
