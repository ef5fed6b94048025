use super::*;

#[test]
fn reconnect_backoff_sequence_doubles_to_cap() {
    let policy = RetryPolicy::reconnect();
    let delays: Vec<u64> = (1..=6).map(|n| policy.delay_for(n).as_millis() as u64).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
}

#[test]
fn sender_backoff_sequence_caps_at_two_seconds() {
    let policy = RetryPolicy::sender();
    assert_eq!(policy.delay_for(1), Duration::from_millis(200));
    assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    assert_eq!(policy.delay_for(5), Duration::from_millis(2000));
}

#[test]
fn delay_saturates_instead_of_overflowing() {
    let policy = RetryPolicy::reconnect();
    assert_eq!(policy.delay_for(64), Duration::from_millis(30_000));
    assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(30_000));
}

#[test]
fn delay_for_attempt_zero_equals_base() {
    let policy = RetryPolicy::sender();
    assert_eq!(policy.delay_for(0), Duration::from_millis(200));
}

#[test]
fn allows_retry_respects_max_attempts() {
    let policy = RetryPolicy::sender();
    assert!(policy.allows_retry(1));
    assert!(policy.allows_retry(2));
    assert!(!policy.allows_retry(3));

    assert!(RetryPolicy::reconnect().allows_retry(1_000_000));
}
