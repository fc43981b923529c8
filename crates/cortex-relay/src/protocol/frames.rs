//! Inbound data frames and the outgoing sample packet.
//!
//! The Cortex service pushes stream data as JSON objects tagged by a
//! data-kind key. An `eeg` frame carries a sequence marker and a reserved
//! slot ahead of the channel values, so channel extraction works on fixed
//! indices relative to that offset. `dev` and `eq` frames are retained as
//! opaque blobs and attached to each outgoing packet.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::constants::{EPOC_X_CHANNELS, SSVEP_CHANNEL_INDICES};

/// Leading non-channel slots in an `eeg` array: sequence marker + reserved.
const LEADING_NON_CHANNEL_SLOTS: usize = 2;

#[allow(clippy::cast_possible_truncation)]
fn f64_to_f32(value: f64) -> Option<f32> {
    value.is_finite().then_some(value as f32)
}

/// An inbound data frame from a subscribed stream.
#[derive(Debug, Clone)]
pub enum DataFrame {
    Eeg(EegFrame),
    Dev(DevFrame),
    Eq(EqFrame),
}

/// Raw EEG frame: `[SEQUENCE, RESERVED, ch1, .., chN, ...]`.
#[derive(Debug, Clone)]
pub struct EegFrame {
    /// Timestamp (Unix seconds as f64, from Cortex).
    pub time: f64,
    /// Heterogeneous value array; see [`ChannelSelection::extract`].
    pub eeg: Vec<Value>,
}

/// Device status frame (battery, signal, contact quality). Opaque.
#[derive(Debug, Clone)]
pub struct DevFrame {
    pub time: f64,
    pub dev: Value,
}

/// EEG quality frame. Opaque.
#[derive(Debug, Clone)]
pub struct EqFrame {
    pub time: f64,
    pub eq: Value,
}

impl DataFrame {
    /// Recognize a data frame by its data-kind key. Returns `None` for
    /// anything that is not a well-formed `eeg`/`dev`/`eq` frame.
    pub fn from_value(value: &Value) -> Option<Self> {
        let time = value.get("time")?.as_f64()?;

        if let Some(eeg) = value.get("eeg").and_then(Value::as_array) {
            return Some(Self::Eeg(EegFrame {
                time,
                eeg: eeg.clone(),
            }));
        }
        if let Some(dev) = value.get("dev") {
            return Some(Self::Dev(DevFrame {
                time,
                dev: dev.clone(),
            }));
        }
        if let Some(eq) = value.get("eq") {
            return Some(Self::Eq(EqFrame {
                time,
                eq: eq.clone(),
            }));
        }
        None
    }
}

/// Latest device/quality metadata, attached to outgoing packets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataBlob {
    pub timestamp: f64,
    pub data: Value,
}

// ─── Channel selection ──────────────────────────────────────────────────

/// Which EEG channels to route into outgoing packets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelSelection {
    /// Only the occipital/parietal electrodes relevant for SSVEP
    /// (P7, O1, O2, P8).
    #[default]
    Ssvep,
    /// All EEG channels the frame carries.
    All,
}

impl ChannelSelection {
    /// Extract channel values and matching electrode names from a raw
    /// `eeg` array, skipping the leading sequence/reserved slots.
    ///
    /// Returns `None` when the array is too short or carries no usable
    /// channel values.
    pub fn extract(self, eeg: &[Value]) -> Option<(Vec<f32>, Vec<String>)> {
        if eeg.len() <= LEADING_NON_CHANNEL_SLOTS {
            return None;
        }
        let channels = &eeg[LEADING_NON_CHANNEL_SLOTS..];

        let (values, names) = match self {
            Self::Ssvep => {
                let mut values = Vec::with_capacity(SSVEP_CHANNEL_INDICES.len());
                let mut names = Vec::with_capacity(SSVEP_CHANNEL_INDICES.len());
                for &idx in &SSVEP_CHANNEL_INDICES {
                    if let Some(v) = channels.get(idx).and_then(Value::as_f64).and_then(f64_to_f32)
                    {
                        values.push(v);
                        names.push(EPOC_X_CHANNELS[idx].to_string());
                    }
                }
                (values, names)
            }
            Self::All => {
                // Channel values run until the first non-numeric element
                // (trailing metadata arrays), capped at the electrode count.
                let mut values = Vec::new();
                let mut names = Vec::new();
                for (idx, value) in channels.iter().take(EPOC_X_CHANNELS.len()).enumerate() {
                    let Some(v) = value.as_f64().and_then(f64_to_f32) else {
                        break;
                    };
                    values.push(v);
                    names.push(EPOC_X_CHANNELS[idx].to_string());
                }
                (values, names)
            }
        };

        if values.is_empty() {
            return None;
        }
        Some((values, names))
    }
}

// ─── Sample packet ──────────────────────────────────────────────────────

/// One accepted sample, as delivered to every downstream consumer.
///
/// Serialized as `{time, values, deviceData, qualityData, channelNames}` —
/// the downstream broadcast wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SamplePacket {
    /// Device timestamp of the frame this packet was decoded from.
    pub time: f64,
    /// Conditioned (or raw) channel values, in electrode order.
    pub values: Vec<f32>,
    /// Latest device status blob, if any has arrived.
    pub device_data: Option<MetadataBlob>,
    /// Latest EEG quality blob, if any has arrived.
    pub quality_data: Option<MetadataBlob>,
    /// Electrode names matching `values`, in order.
    pub channel_names: Vec<String>,
}
