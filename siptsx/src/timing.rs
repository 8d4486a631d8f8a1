//! RFC 3261 timer bases and the durations derived from them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The timer bases of RFC 3261 §17 plus the local auto-100 delay.
///
/// The value is immutable once a transaction is created with it. Every
/// derived timer recomputes from the effective bases, so overriding T1
/// alone rescales A/B/E/F/G/H/J/L/M in one move. The `with_*` setters
/// ignore a zero duration, keeping the default for that base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Round-trip time estimate. Default 500 ms.
    pub t1: Duration,
    /// Retransmission interval cap. Default 4 s.
    pub t2: Duration,
    /// Maximum lifetime a message spends in the network. Default 5 s.
    pub t4: Duration,
    /// Wait time in Completed for an unreliable INVITE client. Default 32 s.
    pub time_d: Duration,
    /// Delay before a server INVITE transaction answers 100 on its own.
    /// Default 200 ms.
    pub time_100: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            time_d: Duration::from_secs(32),
            time_100: Duration::from_millis(200),
        }
    }
}

impl TimingConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Override T1. A zero duration keeps the default.
    pub fn with_t1(mut self, t1: Duration) -> Self {
        if !t1.is_zero() {
            self.t1 = t1;
        }
        self
    }

    /// Override T2. A zero duration keeps the default.
    pub fn with_t2(mut self, t2: Duration) -> Self {
        if !t2.is_zero() {
            self.t2 = t2;
        }
        self
    }

    /// Override T4. A zero duration keeps the default.
    pub fn with_t4(mut self, t4: Duration) -> Self {
        if !t4.is_zero() {
            self.t4 = t4;
        }
        self
    }

    /// Override the Timer D wait. A zero duration keeps the default.
    pub fn with_time_d(mut self, time_d: Duration) -> Self {
        if !time_d.is_zero() {
            self.time_d = time_d;
        }
        self
    }

    /// Override the auto-100 delay. A zero duration keeps the default.
    pub fn with_time_100(mut self, time_100: Duration) -> Self {
        if !time_100.is_zero() {
            self.time_100 = time_100;
        }
        self
    }

    /// 64·T1, the shared protocol timeout span of Timers B/F/H/J/L/M.
    pub fn t1x64(&self) -> Duration {
        self.t1 * 64
    }

    /// Timer A initial interval (INVITE client retransmission).
    pub fn timer_a(&self) -> Duration {
        self.t1
    }

    /// Timer B (INVITE client timeout).
    pub fn timer_b(&self) -> Duration {
        self.t1x64()
    }

    /// Timer D (INVITE client Completed wait); zero on reliable transports.
    pub fn timer_d(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.time_d
        }
    }

    /// Timer E initial interval (non-INVITE client retransmission).
    pub fn timer_e(&self) -> Duration {
        self.t1
    }

    /// Timer F (non-INVITE client timeout).
    pub fn timer_f(&self) -> Duration {
        self.t1x64()
    }

    /// Timer G initial interval (INVITE server final retransmission).
    pub fn timer_g(&self) -> Duration {
        self.t1
    }

    /// Timer H (wait for ACK).
    pub fn timer_h(&self) -> Duration {
        self.t1x64()
    }

    /// Timer I (Confirmed wait); zero on reliable transports.
    pub fn timer_i(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    /// Timer J (non-INVITE server Completed wait); zero on reliable
    /// transports.
    pub fn timer_j(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t1x64()
        }
    }

    /// Timer K (non-INVITE client Completed wait); zero on reliable
    /// transports.
    pub fn timer_k(&self, reliable: bool) -> Duration {
        if reliable {
            Duration::ZERO
        } else {
            self.t4
        }
    }

    /// Timer L (INVITE server Accepted wait).
    pub fn timer_l(&self) -> Duration {
        self.t1x64()
    }

    /// Timer M (INVITE client Accepted wait).
    pub fn timer_m(&self) -> Duration {
        self.t1x64()
    }

    /// The auto-100 delay of a server INVITE transaction.
    pub fn time_100(&self) -> Duration {
        self.time_100
    }

    /// The next retransmission interval after `current`: doubled, capped
    /// at T2.
    pub fn backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.t2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let timing = TimingConfig::new();
        assert_eq!(timing.timer_a(), Duration::from_millis(500));
        assert_eq!(timing.timer_b(), Duration::from_secs(32));
        assert_eq!(timing.timer_d(false), Duration::from_secs(32));
        assert_eq!(timing.time_100(), Duration::from_millis(200));
    }

    #[test]
    fn test_zero_override_keeps_default() {
        let timing = TimingConfig::new()
            .with_t1(Duration::from_millis(20))
            .with_t2(Duration::ZERO);
        assert_eq!(timing.t1, Duration::from_millis(20));
        assert_eq!(timing.t2, Duration::from_secs(4));
        // Derived timers recompute from the effective base.
        assert_eq!(timing.timer_b(), Duration::from_millis(20 * 64));
    }

    #[test]
    fn test_reliable_zeroes() {
        let timing = TimingConfig::new();
        assert_eq!(timing.timer_k(true), Duration::ZERO);
        assert_eq!(timing.timer_i(true), Duration::ZERO);
        assert_eq!(timing.timer_j(true), Duration::ZERO);
        assert_eq!(timing.timer_k(false), timing.t4);
        assert_eq!(timing.timer_i(false), timing.t4);
        assert_eq!(timing.timer_j(false), timing.t1x64());
    }

    #[test]
    fn test_backoff_caps_at_t2() {
        let timing = TimingConfig::new();
        let mut interval = timing.timer_a();
        let mut seen = vec![interval];
        for _ in 0..5 {
            interval = timing.backoff(interval);
            seen.push(interval);
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );
    }
}
