use std::time::Duration;
use tether_types::Timestamp;

#[test]
fn now_is_after_epoch() {
    assert!(Timestamp::now().as_millis() > 0);
}

#[test]
fn saturating_add_moves_forward() {
    let t = Timestamp::from_millis(1_000);
    assert_eq!(t.saturating_add(Duration::from_millis(250)).as_millis(), 1_250);
    let max = Timestamp::from_millis(u64::MAX);
    assert_eq!(max.saturating_add(Duration::from_secs(1)).as_millis(), u64::MAX);
}

#[test]
fn millis_since_saturates() {
    let early = Timestamp::from_millis(100);
    let late = Timestamp::from_millis(400);
    assert_eq!(late.millis_since(early), 300);
    assert_eq!(early.millis_since(late), 0);
}

#[test]
fn has_passed_is_inclusive() {
    let deadline = Timestamp::from_millis(500);
    assert!(!deadline.has_passed(Timestamp::from_millis(499)));
    assert!(deadline.has_passed(Timestamp::from_millis(500)));
    assert!(deadline.has_passed(Timestamp::from_millis(501)));
}

#[test]
fn ordering_follows_millis() {
    assert!(Timestamp::from_millis(1) < Timestamp::from_millis(2));
}
