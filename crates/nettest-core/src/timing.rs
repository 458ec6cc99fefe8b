//! Quantization of generation policies onto the global time slice.

use crate::model::{Burst, Generation};
use crate::units::{Nanosecs, Ticks};

/// `2^32`, the scale of Bernoulli thresholds.
const THRESHOLD_SCALE: f64 = 4_294_967_296.0;

/// When a source emits packets, in ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Schedule {
    /// Exactly one packet every `ticks` ticks.
    Interval { ticks: u32 },
    /// One Bernoulli trial per tick, succeeding with probability `threshold / 2^32`, optionally
    /// gated by a burst window.
    Bernoulli {
        threshold: u32,
        burst: Option<BurstWindow>,
    },
}

impl Schedule {
    /// The expected number of packets over `ticks` ticks of an ungated source.
    pub fn expected_packets(&self, ticks: u64) -> f64 {
        match *self {
            Schedule::Interval { ticks: interval } => (ticks / interval as u64) as f64,
            Schedule::Bernoulli { threshold, burst } => {
                let p = threshold as f64 / THRESHOLD_SCALE;
                let duty = burst.map_or(1.0, |b| b.duty as f64 / b.period as f64);
                p * duty * ticks as f64
            }
        }
    }
}

/// A burst window quantized to ticks. A packet may be emitted at tick `t` only when
/// `(t + phase) % period < duty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BurstWindow {
    pub period: u32,
    pub duty: u32,
    pub phase: u32,
}

impl BurstWindow {
    pub fn is_open(&self, tick: u64) -> bool {
        (tick + u64::from(self.phase)) % u64::from(self.period) < u64::from(self.duty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QuantizeError {
    /// The time slice is too coarse to represent the rate.
    TooHigh,
    /// The rate would round to no packets at all, or the interval overflows.
    TooLow,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Quantizer {
    timestep: Nanosecs,
}

impl Quantizer {
    pub(crate) fn new(timestep: Nanosecs) -> Self {
        debug_assert!(timestep > Nanosecs::ZERO);
        Self { timestep }
    }

    /// Expected packets per tick at `rate` packets per second.
    fn per_tick(&self, rate: f64) -> f64 {
        rate * self.timestep.into_f64() / 1e9
    }

    pub(crate) fn schedule(&self, generation: &Generation) -> Result<Schedule, QuantizeError> {
        match generation {
            Generation::Periodic { rate } => {
                let ticks = (1.0 / self.per_tick(*rate)).round();
                if ticks < 1.0 {
                    return Err(QuantizeError::TooHigh);
                }
                if ticks > u32::MAX as f64 {
                    return Err(QuantizeError::TooLow);
                }
                Ok(Schedule::Interval {
                    ticks: ticks as u32,
                })
            }
            Generation::Poisson { rate } => Ok(Schedule::Bernoulli {
                threshold: self.threshold(*rate)?,
                burst: None,
            }),
            Generation::Bursty { rate, burst } => Ok(Schedule::Bernoulli {
                threshold: self.threshold(*rate)?,
                burst: Some(self.burst(burst)?),
            }),
        }
    }

    fn threshold(&self, rate: f64) -> Result<u32, QuantizeError> {
        let p = self.per_tick(rate);
        if p > 1.0 {
            return Err(QuantizeError::TooHigh);
        }
        let scaled = (p * THRESHOLD_SCALE).round();
        let threshold = if scaled >= u32::MAX as f64 {
            u32::MAX
        } else {
            scaled as u32
        };
        if threshold == 0 {
            return Err(QuantizeError::TooLow);
        }
        Ok(threshold)
    }

    fn burst(&self, burst: &Burst) -> Result<BurstWindow, QuantizeError> {
        let period = burst.period.into_f64();
        let step = self.timestep.into_f64();
        let ticks = |ns: f64| -> Result<u32, QuantizeError> {
            let t = (ns / step).round();
            if t > u32::MAX as f64 {
                Err(QuantizeError::TooLow)
            } else {
                Ok(t as u32)
            }
        };
        let window = BurstWindow {
            period: ticks(period)?,
            duty: ticks(period * burst.duty)?,
            phase: ticks(period * burst.phase)?,
        };
        if window.period == 0 {
            return Err(QuantizeError::TooHigh);
        }
        Ok(window)
    }

    /// Rounds a time to the nearest tick.
    pub(crate) fn round(&self, t: Nanosecs) -> Ticks {
        let step = self.timestep.into_u64();
        Ticks::new((t.into_u64() + step / 2) / step)
    }

    /// Rounds a time up to the next tick boundary.
    pub(crate) fn ceil(&self, t: Nanosecs) -> Ticks {
        let step = self.timestep.into_u64();
        Ticks::new(t.into_u64().div_ceil(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(ns: u64) -> Quantizer {
        Quantizer::new(Nanosecs::new(ns))
    }

    #[test]
    fn periodic_rounds_interval() {
        // 1000 pkt/s at 1 us ticks is one packet every 1000 ticks
        assert_eq!(
            q(1_000).schedule(&Generation::Periodic { rate: 1000.0 }),
            Ok(Schedule::Interval { ticks: 1000 })
        );
        assert_eq!(
            q(1_000).schedule(&Generation::Periodic { rate: 3000.0 }),
            Ok(Schedule::Interval { ticks: 333 })
        );
    }

    #[test]
    fn periodic_faster_than_a_tick_is_too_high() {
        assert_eq!(
            q(1_000).schedule(&Generation::Periodic { rate: 5e6 }),
            Err(QuantizeError::TooHigh)
        );
    }

    #[test]
    fn periodic_overflowing_interval_is_too_low() {
        assert_eq!(
            q(1).schedule(&Generation::Periodic { rate: 1e-3 }),
            Err(QuantizeError::TooLow)
        );
    }

    #[test]
    fn poisson_threshold_scales_probability() {
        // p = 0.5
        assert_eq!(
            q(1_000).schedule(&Generation::Poisson { rate: 5e5 }),
            Ok(Schedule::Bernoulli {
                threshold: 1 << 31,
                burst: None
            })
        );
        // p = 1 saturates
        assert_eq!(
            q(1_000).schedule(&Generation::Poisson { rate: 1e6 }),
            Ok(Schedule::Bernoulli {
                threshold: u32::MAX,
                burst: None
            })
        );
        assert_eq!(
            q(1_000).schedule(&Generation::Poisson { rate: 2e6 }),
            Err(QuantizeError::TooHigh)
        );
        assert_eq!(
            q(1).schedule(&Generation::Poisson { rate: 1e-3 }),
            Err(QuantizeError::TooLow)
        );
    }

    #[test]
    fn burst_window_in_ticks() {
        let generation = Generation::Bursty {
            rate: 1e8,
            burst: Burst {
                period: Nanosecs::new(1_000),
                duty: 0.1,
                phase: 0.1,
            },
        };
        let Ok(Schedule::Bernoulli { burst, .. }) = q(1).schedule(&generation) else {
            panic!("expected a Bernoulli schedule");
        };
        assert_eq!(
            burst,
            Some(BurstWindow {
                period: 1000,
                duty: 100,
                phase: 100
            })
        );
    }

    #[test]
    fn burst_shorter_than_a_tick_is_too_high() {
        let generation = Generation::Bursty {
            rate: 10.0,
            burst: Burst {
                period: Nanosecs::new(100),
                duty: 0.5,
                phase: 0.0,
            },
        };
        assert_eq!(q(1_000).schedule(&generation), Err(QuantizeError::TooHigh));
    }

    #[test]
    fn window_opens_with_phase() {
        let w = BurstWindow {
            period: 10,
            duty: 3,
            phase: 8,
        };
        let open = (0..10).filter(|&t| w.is_open(t)).collect::<Vec<_>>();
        assert_eq!(open, vec![2, 3, 4]);
    }

    #[test]
    fn start_rounding() {
        let q = q(1_000);
        assert_eq!(q.round(Nanosecs::new(1_499)), Ticks::new(1));
        assert_eq!(q.round(Nanosecs::new(1_500)), Ticks::new(2));
        assert_eq!(q.ceil(Nanosecs::new(1_001)), Ticks::new(2));
        assert_eq!(q.ceil(Nanosecs::new(2_000)), Ticks::new(2));
    }
}
