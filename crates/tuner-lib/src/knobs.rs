//! Control-vector to broker-knob codec
//!
//! Maps the agent's normalized action vector onto concrete Mosquitto
//! configuration directives through a declarative descriptor table. Adding a
//! knob is a table change, not a code change. The mapping is deterministic
//! and side-effect free.

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Control vector dimension
pub const ACTION_DIM: usize = 11;

/// Inputs below half this value map to the unlimited/disabled sentinel.
/// Chosen so the broker default of 20 inflight messages (20/2000 = 0.01)
/// is not swallowed by the sentinel bucket.
const ZERO_EPS: f32 = 0.01;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// How one knob's input component scales to a directive value
#[derive(Debug, Clone, Copy)]
pub enum Scale {
    /// Linear over `0..=max`, quantized to `step` to damp action noise.
    /// The lowest input bucket maps to 0, which the broker reads as
    /// unlimited (or disabled). `floor` is the smallest legal non-zero
    /// value, 0 when unconstrained.
    Bounded { max: u64, step: u64, floor: u64 },
    /// Boolean directive, thresholded at 0.5
    Switch,
}

/// One tunable broker parameter
#[derive(Debug, Clone, Copy)]
pub struct KnobDescriptor {
    pub name: &'static str,
    pub scale: Scale,
    /// Mosquitto's documented default for this directive
    pub default: KnobValue,
}

/// The tunable configuration surface, in control-vector order.
/// Ranges follow the Mosquitto documentation.
pub const KNOB_TABLE: [KnobDescriptor; ACTION_DIM] = [
    KnobDescriptor {
        name: "max_inflight_messages",
        scale: Scale::Bounded { max: 2000, step: 10, floor: 0 },
        default: KnobValue::Limit(20),
    },
    KnobDescriptor {
        name: "max_inflight_bytes",
        scale: Scale::Bounded { max: 64 * MIB, step: 256 * KIB, floor: 0 },
        default: KnobValue::Unlimited,
    },
    KnobDescriptor {
        name: "max_queued_messages",
        scale: Scale::Bounded { max: 20_000, step: 100, floor: 0 },
        default: KnobValue::Limit(1000),
    },
    KnobDescriptor {
        name: "max_queued_bytes",
        scale: Scale::Bounded { max: 128 * MIB, step: MIB, floor: 0 },
        default: KnobValue::Unlimited,
    },
    KnobDescriptor {
        name: "queue_qos0_messages",
        scale: Scale::Switch,
        default: KnobValue::Flag(false),
    },
    KnobDescriptor {
        name: "memory_limit",
        scale: Scale::Bounded { max: 4 * GIB, step: 64 * MIB, floor: 0 },
        default: KnobValue::Unlimited,
    },
    KnobDescriptor {
        name: "persistence",
        scale: Scale::Switch,
        default: KnobValue::Flag(false),
    },
    KnobDescriptor {
        name: "autosave_interval",
        scale: Scale::Bounded { max: 3600, step: 60, floor: 0 },
        default: KnobValue::Limit(1800),
    },
    KnobDescriptor {
        name: "set_tcp_nodelay",
        scale: Scale::Switch,
        default: KnobValue::Flag(false),
    },
    KnobDescriptor {
        // MQTT packets are at least 20 bytes; a smaller non-zero limit
        // would reject every packet
        name: "max_packet_size",
        scale: Scale::Bounded { max: 10 * MIB, step: KIB, floor: 20 },
        default: KnobValue::Unlimited,
    },
    KnobDescriptor {
        name: "message_size_limit",
        scale: Scale::Bounded { max: 10 * MIB, step: KIB, floor: 0 },
        default: KnobValue::Unlimited,
    },
];

/// A decoded value for one knob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnobValue {
    /// The broker's "0 = no limit / disabled" sentinel
    Unlimited,
    /// A bounded numeric directive value
    Limit(u64),
    /// A boolean directive
    Flag(bool),
}

impl KnobValue {
    /// Directive text as written into the broker configuration file
    pub fn render(&self) -> String {
        match self {
            KnobValue::Unlimited => "0".to_string(),
            KnobValue::Limit(v) => v.to_string(),
            KnobValue::Flag(b) => if *b { "true" } else { "false" }.to_string(),
        }
    }
}

impl Serialize for KnobValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            KnobValue::Unlimited => serializer.serialize_u64(0),
            KnobValue::Limit(v) => serializer.serialize_u64(*v),
            KnobValue::Flag(b) => serializer.serialize_bool(*b),
        }
    }
}

impl<'de> Deserialize<'de> for KnobValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Flag(bool),
            Number(u64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Flag(b) => KnobValue::Flag(b),
            Raw::Number(0) => KnobValue::Unlimited,
            Raw::Number(n) => KnobValue::Limit(n),
        })
    }
}

/// An ordered, immutable set of decoded knob values, aligned with
/// [`KNOB_TABLE`]. Produced fresh on every decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnobSet {
    values: Vec<KnobValue>,
}

impl Default for KnobSet {
    /// The broker's documented default configuration
    fn default() -> Self {
        Self {
            values: KNOB_TABLE.iter().map(|d| d.default).collect(),
        }
    }
}

impl KnobSet {
    pub fn get(&self, name: &str) -> Option<KnobValue> {
        KNOB_TABLE
            .iter()
            .position(|d| d.name == name)
            .map(|i| self.values[i])
    }

    /// Iterate `(directive name, value)` in control-vector order
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, KnobValue)> + '_ {
        KNOB_TABLE
            .iter()
            .zip(self.values.iter())
            .map(|(d, v)| (d.name, *v))
    }
}

impl Serialize for KnobSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(ACTION_DIM))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, &value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KnobSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let named: HashMap<String, KnobValue> = HashMap::deserialize(deserializer)?;
        Ok(Self {
            values: KNOB_TABLE
                .iter()
                .map(|d| named.get(d.name).copied().unwrap_or(d.default))
                .collect(),
        })
    }
}

/// Decode a normalized control vector into a knob set.
///
/// Each element is clamped to [0, 1]; non-finite elements are replaced with
/// the parameter midpoint before scaling so NaN/Inf never propagate into a
/// directive value.
pub fn decode(action: &[f32; ACTION_DIM]) -> KnobSet {
    let values = KNOB_TABLE
        .iter()
        .zip(action.iter())
        .map(|(descriptor, &raw)| decode_component(descriptor, raw))
        .collect();
    KnobSet { values }
}

fn decode_component(descriptor: &KnobDescriptor, raw: f32) -> KnobValue {
    let v = if raw.is_finite() { raw.clamp(0.0, 1.0) } else { 0.5 };

    match descriptor.scale {
        Scale::Switch => KnobValue::Flag(v >= 0.5),
        Scale::Bounded { max, step, floor } => {
            if v < ZERO_EPS / 2.0 {
                return KnobValue::Unlimited;
            }
            let scaled = (f64::from(v) * max as f64).round() as u64;
            KnobValue::Limit(quantize(scaled, step, floor, max))
        }
    }
}

/// Snap a non-zero value onto the step grid, respecting the floor and max.
/// Values that quantize to zero are promoted to one step so the sentinel
/// bucket stays the only path to "unlimited".
fn quantize(value: u64, step: u64, floor: u64, max: u64) -> u64 {
    let mut q = if step > 1 {
        let snapped = ((value as f64 / step as f64).round() as u64) * step;
        if snapped == 0 {
            step
        } else {
            snapped
        }
    } else {
        value.max(1)
    };
    if q < floor {
        q = floor;
    }
    q.min(max)
}

/// Encode a knob set back into a normalized control vector. Inverse of
/// [`decode`] for values on the quantization grid; the unlimited sentinel
/// lands in the reserved low bucket.
pub fn encode(knobs: &KnobSet) -> [f32; ACTION_DIM] {
    let mut action = [0.0f32; ACTION_DIM];
    for (i, (descriptor, value)) in KNOB_TABLE.iter().zip(knobs.values.iter()).enumerate() {
        action[i] = match (descriptor.scale, value) {
            (Scale::Switch, KnobValue::Flag(b)) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            (Scale::Bounded { .. }, KnobValue::Unlimited) => 0.0,
            (Scale::Bounded { max, .. }, KnobValue::Limit(v)) => {
                ((*v as f64 / max as f64) as f32).clamp(ZERO_EPS, 1.0)
            }
            // Mismatched value kinds cannot be produced by decode; fall
            // back to the sentinel bucket rather than panic
            _ => 0.0,
        };
    }
    action
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_all_zeros_is_minimum_configuration() {
        let knobs = decode(&[0.0; ACTION_DIM]);
        for (descriptor, (name, value)) in KNOB_TABLE.iter().zip(knobs.iter()) {
            match descriptor.scale {
                Scale::Bounded { .. } => {
                    assert_eq!(value, KnobValue::Unlimited, "{} should be unlimited", name)
                }
                Scale::Switch => {
                    assert_eq!(value, KnobValue::Flag(false), "{} should be off", name)
                }
            }
        }
    }

    #[test]
    fn test_decode_all_ones_is_maximum_configuration() {
        let knobs = decode(&[1.0; ACTION_DIM]);
        assert_eq!(knobs.get("max_inflight_messages"), Some(KnobValue::Limit(2000)));
        assert_eq!(knobs.get("max_inflight_bytes"), Some(KnobValue::Limit(64 * MIB)));
        assert_eq!(knobs.get("max_queued_messages"), Some(KnobValue::Limit(20_000)));
        assert_eq!(knobs.get("max_queued_bytes"), Some(KnobValue::Limit(128 * MIB)));
        assert_eq!(knobs.get("queue_qos0_messages"), Some(KnobValue::Flag(true)));
        assert_eq!(knobs.get("memory_limit"), Some(KnobValue::Limit(4 * GIB)));
        assert_eq!(knobs.get("persistence"), Some(KnobValue::Flag(true)));
        assert_eq!(knobs.get("autosave_interval"), Some(KnobValue::Limit(3600)));
        assert_eq!(knobs.get("set_tcp_nodelay"), Some(KnobValue::Flag(true)));
        assert_eq!(knobs.get("max_packet_size"), Some(KnobValue::Limit(10 * MIB)));
        assert_eq!(knobs.get("message_size_limit"), Some(KnobValue::Limit(10 * MIB)));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let action = [0.3; ACTION_DIM];
        assert_eq!(decode(&action), decode(&action));
    }

    #[test]
    fn test_decoded_values_stay_in_range() {
        for i in 0..=20 {
            let v = i as f32 / 20.0;
            let knobs = decode(&[v; ACTION_DIM]);
            for (descriptor, (name, value)) in KNOB_TABLE.iter().zip(knobs.iter()) {
                if let Scale::Bounded { max, floor, .. } = descriptor.scale {
                    match value {
                        KnobValue::Unlimited => {}
                        KnobValue::Limit(n) => {
                            assert!(n <= max, "{} exceeded max: {}", name, n);
                            assert!(floor == 0 || n >= floor, "{} below floor: {}", name, n);
                        }
                        KnobValue::Flag(_) => panic!("{} decoded to a flag", name),
                    }
                }
            }
        }
    }

    #[test]
    fn test_out_of_range_input_is_clamped() {
        let mut action = [0.5; ACTION_DIM];
        action[0] = 7.0;
        action[2] = -3.0;
        let knobs = decode(&action);
        assert_eq!(knobs.get("max_inflight_messages"), Some(KnobValue::Limit(2000)));
        assert_eq!(knobs.get("max_queued_messages"), Some(KnobValue::Unlimited));
    }

    #[test]
    fn test_non_finite_input_maps_to_midpoint() {
        let mut action = [0.0; ACTION_DIM];
        action[0] = f32::NAN;
        action[7] = f32::INFINITY;
        let knobs = decode(&action);
        // Midpoint of 0..=2000, on the step-10 grid
        assert_eq!(knobs.get("max_inflight_messages"), Some(KnobValue::Limit(1000)));
        assert_eq!(knobs.get("autosave_interval"), Some(KnobValue::Limit(1800)));
    }

    #[test]
    fn test_boolean_threshold() {
        let mut action = [0.0; ACTION_DIM];
        action[4] = 0.49;
        action[6] = 0.5;
        let knobs = decode(&action);
        assert_eq!(knobs.get("queue_qos0_messages"), Some(KnobValue::Flag(false)));
        assert_eq!(knobs.get("persistence"), Some(KnobValue::Flag(true)));
    }

    #[test]
    fn test_packet_size_floor() {
        // Smallest non-zero bucket for max_packet_size quantizes to one
        // step (1024), well above the 20-byte floor; force a sub-floor
        // value through the quantizer directly.
        assert_eq!(quantize(5, 1, 20, 10 * MIB), 20);
        assert_eq!(quantize(3, 1024, 20, 10 * MIB), 1024);
    }

    #[test]
    fn test_default_knobs_round_trip_through_codec() {
        let defaults = KnobSet::default();
        let action = encode(&defaults);
        assert_eq!(decode(&action), defaults);
    }

    #[test]
    fn test_boundary_round_trips() {
        for action in [[0.0; ACTION_DIM], [1.0; ACTION_DIM]] {
            let knobs = decode(&action);
            assert_eq!(decode(&encode(&knobs)), knobs);
        }
    }

    #[test]
    fn test_knob_set_serializes_as_named_map() {
        let defaults = KnobSet::default();
        let json = serde_json::to_value(&defaults).unwrap();
        assert_eq!(json["max_inflight_messages"], 20);
        assert_eq!(json["max_inflight_bytes"], 0);
        assert_eq!(json["persistence"], false);

        let back: KnobSet = serde_json::from_value(json).unwrap();
        assert_eq!(back, defaults);
    }
}
