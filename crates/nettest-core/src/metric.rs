//! The quantities a core can be asked to count.

use std::fmt;

/// Diagnostic counters maintained by a core's router, independent of any flow. The discriminant
/// is the counter's bit position in the `RECORD` command mask.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RouterCounter {
    LocalMulticast = 0,
    ExternalMulticast = 1,
    LocalP2p = 2,
    ExternalP2p = 3,
    LocalNearestNeighbour = 4,
    ExternalNearestNeighbour = 5,
    LocalFixedRoute = 6,
    ExternalFixedRoute = 7,
    DroppedMulticast = 8,
    DroppedP2p = 9,
    DroppedNearestNeighbour = 10,
    DroppedFixedRoute = 11,
}

impl RouterCounter {
    pub const ALL: [RouterCounter; 12] = [
        RouterCounter::LocalMulticast,
        RouterCounter::ExternalMulticast,
        RouterCounter::LocalP2p,
        RouterCounter::ExternalP2p,
        RouterCounter::LocalNearestNeighbour,
        RouterCounter::ExternalNearestNeighbour,
        RouterCounter::LocalFixedRoute,
        RouterCounter::ExternalFixedRoute,
        RouterCounter::DroppedMulticast,
        RouterCounter::DroppedP2p,
        RouterCounter::DroppedNearestNeighbour,
        RouterCounter::DroppedFixedRoute,
    ];

    pub fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }
}

/// A set of router counters, stored as the `RECORD` bit mask.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(from = "Vec<RouterCounter>", into = "Vec<RouterCounter>")]
pub struct RouterCounters(u32);

impl RouterCounters {
    pub const NONE: RouterCounters = RouterCounters(0);

    pub fn all() -> Self {
        RouterCounter::ALL.into_iter().collect()
    }

    /// Returns `None` if `mask` has bits set that do not name a counter.
    pub fn from_bits(mask: u32) -> Option<Self> {
        (mask & !Self::all().0 == 0).then_some(Self(mask))
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn with(self, counter: RouterCounter) -> Self {
        Self(self.0 | counter.bit())
    }

    pub fn contains(self, counter: RouterCounter) -> bool {
        self.0 & counter.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates over the counters in bit order.
    pub fn iter(self) -> impl Iterator<Item = RouterCounter> {
        RouterCounter::ALL
            .into_iter()
            .filter(move |&c| self.contains(c))
    }
}

impl FromIterator<RouterCounter> for RouterCounters {
    fn from_iter<I: IntoIterator<Item = RouterCounter>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, Self::with)
    }
}

impl From<Vec<RouterCounter>> for RouterCounters {
    fn from(counters: Vec<RouterCounter>) -> Self {
        counters.into_iter().collect()
    }
}

impl From<RouterCounters> for Vec<RouterCounter> {
    fn from(counters: RouterCounters) -> Self {
        counters.iter().collect()
    }
}

/// What a single counter slot holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Packets a source emitted.
    Sent,
    /// Packets a source could not emit because the router was busy.
    Blocked,
    /// Packets a sink accepted.
    Received,
    /// Sum of timestamp deltas over received packets, in ticks.
    LatencySum,
    /// Sum of squared timestamp deltas.
    LatencySumSq,
    /// A router diagnostic counter.
    Router(RouterCounter),
}

const ROUTER_CODE_BASE: u16 = 0x100;

impl Metric {
    /// The code the on-chip runtime uses for this metric in `COUNTER` commands.
    pub fn code(self) -> u16 {
        match self {
            Metric::Sent => 1,
            Metric::Blocked => 2,
            Metric::Received => 3,
            Metric::LatencySum => 4,
            Metric::LatencySumSq => 5,
            Metric::Router(c) => ROUTER_CODE_BASE + c as u16,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(Metric::Sent),
            2 => Some(Metric::Blocked),
            3 => Some(Metric::Received),
            4 => Some(Metric::LatencySum),
            5 => Some(Metric::LatencySumSq),
            c if c >= ROUTER_CODE_BASE => u8::try_from(c - ROUTER_CODE_BASE)
                .ok()
                .and_then(RouterCounter::from_index)
                .map(Metric::Router),
            _ => None,
        }
    }

    pub fn is_source_metric(self) -> bool {
        matches!(self, Metric::Sent | Metric::Blocked)
    }

    pub fn is_sink_metric(self) -> bool {
        matches!(
            self,
            Metric::Received | Metric::LatencySum | Metric::LatencySumSq
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Sent => write!(f, "sent"),
            Metric::Blocked => write!(f, "blocked"),
            Metric::Received => write!(f, "received"),
            Metric::LatencySum => write!(f, "latency_sum"),
            Metric::LatencySumSq => write!(f, "latency_sum_sq"),
            Metric::Router(c) => write!(f, "router.{c:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_codes_round_trip() {
        let metrics = [
            Metric::Sent,
            Metric::Blocked,
            Metric::Received,
            Metric::LatencySum,
            Metric::LatencySumSq,
        ]
        .into_iter()
        .chain(RouterCounter::ALL.into_iter().map(Metric::Router));
        for m in metrics {
            assert_eq!(Metric::from_code(m.code()), Some(m));
        }
        assert_eq!(Metric::from_code(0), None);
        assert_eq!(Metric::from_code(0x100 + 12), None);
    }

    #[test]
    fn record_mask_matches_bit_positions() {
        let set = RouterCounters::NONE
            .with(RouterCounter::LocalMulticast)
            .with(RouterCounter::DroppedMulticast);
        assert_eq!(set.bits(), (1 << 0) | (1 << 8));
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec![RouterCounter::LocalMulticast, RouterCounter::DroppedMulticast]
        );
    }

    #[test]
    fn unknown_record_bits_are_rejected() {
        assert_eq!(RouterCounters::from_bits(1 << 12), None);
        assert_eq!(RouterCounters::from_bits(0xFFF), Some(RouterCounters::all()));
    }
}
