use crate::units::Nanosecs;

identifier!(FlowId, u32);
identifier!(EndpointId, u32);
identifier!(CoreId, u32);
identifier!(RegionId, u32);
identifier!(GroupId, u32);

/// One source-to-many-sink multicast traffic pattern.
#[derive(Debug, Clone, PartialEq, typed_builder::TypedBuilder, serde::Serialize, serde::Deserialize)]
pub struct Flow {
    pub id: FlowId,
    /// The logical endpoint generating the traffic.
    pub source: EndpointId,
    /// The logical endpoints receiving the traffic, in declaration order.
    pub sinks: Vec<EndpointId>,
    pub generation: Generation,
    #[builder(default)]
    #[serde(default)]
    pub payload: PayloadClass,
    /// Requested start offset from the beginning of the run.
    #[builder(default)]
    #[serde(default)]
    pub start: Nanosecs,
    /// Flows in the same group start on the same time-slice boundary.
    #[builder(default, setter(strip_option))]
    #[serde(default)]
    pub group: Option<GroupId>,
}

/// How a source decides when to emit a packet. Rates are in packets per second.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Generation {
    /// One packet every `1 / rate` seconds.
    Periodic { rate: f64 },
    /// Independent per-time-slice Bernoulli trials with mean rate `rate`.
    Poisson { rate: f64 },
    /// Bernoulli trials at `rate`, but only inside the on-part of a repeating burst window.
    Bursty { rate: f64, burst: Burst },
}

impl Generation {
    pub fn rate(&self) -> f64 {
        match *self {
            Generation::Periodic { rate }
            | Generation::Poisson { rate }
            | Generation::Bursty { rate, .. } => rate,
        }
    }

    pub fn burst(&self) -> Option<&Burst> {
        match self {
            Generation::Bursty { burst, .. } => Some(burst),
            _ => None,
        }
    }
}

/// A repeating on/off window.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Burst {
    /// Length of one full cycle.
    pub period: Nanosecs,
    /// Fraction of the cycle during which packets may be generated.
    pub duty: f64,
    /// Fraction of the cycle the generator starts at.
    #[serde(default)]
    pub phase: f64,
}

/// Multicast packets either carry a bare key or a key plus a 32-bit payload. Only packets with a
/// payload carry the timestamp sinks need for latency measurements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadClass {
    #[default]
    KeyOnly,
    WithPayload,
}

impl PayloadClass {
    pub fn has_payload(self) -> bool {
        matches!(self, PayloadClass::WithPayload)
    }
}
