//! Ordering and firing properties of the timer wheel under arbitrary
//! add / re-add / delete / advance sequences.

use std::collections::HashMap;

use proptest::prelude::*;

use bioc::config::WheelConfig;
use bioc::runtime::timing::{Duration, ManualClock, TimerId, TimerWheel};

const TIMERS: usize = 8;

#[derive(Debug, Clone)]
enum Op {
    Add(usize, u64),
    ReAdd(usize),
    Delete(usize),
    Advance(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..TIMERS, 0u64..100).prop_map(|(t, d)| Op::Add(t, d)),
        1 => (0..TIMERS).prop_map(Op::ReAdd),
        1 => (0..TIMERS).prop_map(Op::Delete),
        2 => (0u64..120).prop_map(Op::Advance),
    ]
}

fn setup(repeat: bool) -> (TimerWheel<usize>, ManualClock, Vec<TimerId>) {
    let clock = ManualClock::starting_at(10_000);
    let mut wheel = TimerWheel::with_clock(WheelConfig::millisecond(), clock.clone());
    let ids = (0..TIMERS)
        .map(|i| wheel.create(i, repeat && i % 2 == 0).unwrap())
        .collect();
    (wheel, clock, ids)
}

fn assert_sorted_and_pending(wheel: &TimerWheel<usize>) {
    let now = wheel.now();
    let armed: Vec<_> = wheel.iter_armed().collect();
    assert_eq!(armed.len(), wheel.armed());
    for pair in armed.windows(2) {
        assert!(pair[0].1 <= pair[1].1, "out of order: {armed:?}");
    }
    for (id, expire) in &armed {
        assert!(*expire > now, "{id} due at {} still armed at {}", expire.as_u64(), now.as_u64());
    }
}

proptest! {
    #[test]
    fn process_leaves_only_future_timers_in_order(ops in prop::collection::vec(op(), 1..60)) {
        let (mut wheel, clock, ids) = setup(true);
        for op in ops {
            match op {
                Op::Add(t, delay) => {
                    wheel.delete(ids[t]);
                    wheel.add(ids[t], delay);
                }
                Op::ReAdd(t) => {
                    wheel.delete(ids[t]);
                    wheel.re_add(ids[t]);
                }
                Op::Delete(t) => wheel.delete(ids[t]),
                Op::Advance(ms) => {
                    clock.advance(Duration::from_millis(ms));
                    wheel.time_update();
                    wheel.process(|_, _, _| {});
                    assert_sorted_and_pending(&wheel);
                }
            }
        }
        wheel.time_update();
        wheel.process(|_, _, _| {});
        assert_sorted_and_pending(&wheel);
    }

    #[test]
    fn nothing_fires_before_its_expiry(ops in prop::collection::vec(op(), 1..60)) {
        let (mut wheel, clock, ids) = setup(false);
        let mut expiries: HashMap<usize, u64> = HashMap::new();
        for op in ops {
            match op {
                Op::Add(t, delay) => {
                    wheel.delete(ids[t]);
                    wheel.add(ids[t], delay);
                    expiries.insert(t, wheel.now().as_u64() + delay);
                }
                Op::ReAdd(_) => {}
                Op::Delete(t) => {
                    wheel.delete(ids[t]);
                    expiries.remove(&t);
                }
                Op::Advance(ms) => {
                    let timeout = wheel.next_timeout();
                    clock.advance(Duration::from_millis(ms));
                    wheel.time_update();
                    let now = wheel.now().as_u64();
                    let mut fired = Vec::new();
                    wheel.process(|_, _, t| fired.push(t));
                    if let (Some(timeout), false) = (timeout, fired.is_empty()) {
                        assert!(ms >= timeout.as_u64());
                    }
                    for t in fired {
                        let expire = expiries.remove(&t).expect("fired timer was armed");
                        assert!(expire <= now, "timer {t} fired at {now}, due {expire}");
                    }
                }
            }
        }
        for (t, expire) in expiries {
            assert!(wheel.is_running(ids[t]));
            assert_eq!(
                wheel.time_to_expire(ids[t]).as_u64(),
                expire.saturating_sub(wheel.now().as_u64())
            );
        }
    }
}

#[test]
fn equal_expiries_fire_in_insertion_order() {
    let (mut wheel, clock, ids) = setup(false);
    for &t in &[3, 1, 2, 0] {
        wheel.add(ids[t], 50);
    }
    clock.advance(Duration::from_millis(50));
    wheel.time_update();
    let mut fired = Vec::new();
    wheel.process(|_, _, t| fired.push(t));
    assert_eq!(fired, vec![3, 1, 2, 0]);
}
