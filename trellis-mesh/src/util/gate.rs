/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Boolean rate limiter: fires at most once per interval.
///
/// The interval is a runtime value because per-peer timers (probe cadence in
/// particular) are reconfigured as peers come and go. Time is a monotonic
/// millisecond tick supplied by the caller.
pub struct IntervalGate {
    interval: i64,
    last: i64,
}

impl IntervalGate {
    #[inline(always)]
    pub fn new(interval: i64) -> Self {
        Self { interval, last: 0 }
    }

    /// Forget the last firing so the gate opens on the next call.
    #[inline(always)]
    pub fn reset(&mut self) {
        self.last = 0;
    }

    #[inline(always)]
    pub fn gate(&mut self, time: i64) -> bool {
        if (time - self.last) >= self.interval {
            self.last = time;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_fires_once_per_interval() {
        let mut g = IntervalGate::new(1000);
        assert!(g.gate(1000));
        assert!(!g.gate(1500));
        assert!(!g.gate(1999));
        assert!(g.gate(2000));
        g.reset();
        assert!(g.gate(2001));
    }
}
