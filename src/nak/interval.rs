use std::sync::Arc;
use std::time::Duration;

/// A sequence of retransmission timeouts, in milliseconds.
///
/// The sequence is consumed through an [IntervalCursor]; once the listed delays are exhausted,
///  the final value repeats forever. A sequence built with [Interval::with_infinite_tail]
///  instead stops yielding after the last listed delay: the entry stays registered as missing,
///  but no further retransmit requests are sent for it.
///
/// The interval itself is immutable and cheap to clone; every retransmit entry gets its own
///  cursor.
#[derive(Clone, Debug)]
pub struct Interval {
    delays: Arc<[Duration]>,
    infinite_tail: bool,
}

impl Interval {
    pub fn new(delays_millis: &[u64]) -> Interval {
        assert!(!delays_millis.is_empty(), "an interval needs at least one delay");
        Interval {
            delays: delays_millis.iter()
                .map(|&millis| Duration::from_millis(millis))
                .collect(),
            infinite_tail: false,
        }
    }

    pub fn with_infinite_tail(delays_millis: &[u64]) -> Interval {
        Interval {
            infinite_tail: true,
            ..Interval::new(delays_millis)
        }
    }

    pub fn cursor(&self) -> IntervalCursor {
        IntervalCursor {
            interval: self.clone(),
            pos: 0,
        }
    }
}

impl Default for Interval {
    /// the regular retransmit schedule: escalate, then give up asking (the sender will be
    ///  suspected through other channels if the gap never fills)
    fn default() -> Interval {
        Interval::with_infinite_tail(&[600, 1200, 2400, 4800])
    }
}

pub struct IntervalCursor {
    interval: Interval,
    pos: usize,
}

impl IntervalCursor {
    /// the next delay, or `None` once an infinite tail is reached
    pub fn next(&mut self) -> Option<Duration> {
        let delays = &self.interval.delays;
        if self.pos < delays.len() {
            let delay = delays[self.pos];
            self.pos += 1;
            return Some(delay);
        }

        if self.interval.infinite_tail {
            None
        }
        else {
            Some(*delays.last().expect("delay sequence is never empty"))
        }
    }
}
