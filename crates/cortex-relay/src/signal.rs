//! Signal-processing collaborator contracts.
//!
//! The relay does not interpret sample content. Conditioning (band-pass +
//! notch) and SSVEP classification are external collaborators, specified
//! here only at their seams so implementations can be plugged in without
//! touching the acquisition side.

use serde::{Deserialize, Serialize};

use crate::error::RelayResult;
use crate::protocol::frames::SamplePacket;

/// Filter design parameters a conditioner derives its coefficients from,
/// once, at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Band-pass low cutoff in Hz.
    #[serde(default = "default_low_cut")]
    pub low_cut_hz: f64,

    /// Band-pass high cutoff in Hz.
    #[serde(default = "default_high_cut")]
    pub high_cut_hz: f64,

    /// Mains notch frequency in Hz.
    #[serde(default = "default_notch")]
    pub notch_hz: f64,

    /// Band-pass filter order.
    #[serde(default = "default_order")]
    pub order: u32,

    /// Notch quality factor.
    #[serde(default = "default_notch_q")]
    pub notch_q: f64,
}

fn default_low_cut() -> f64 {
    2.0
}

fn default_high_cut() -> f64 {
    100.0
}

fn default_notch() -> f64 {
    50.0
}

fn default_order() -> u32 {
    5
}

fn default_notch_q() -> f64 {
    30.0
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            low_cut_hz: default_low_cut(),
            high_cut_hz: default_high_cut(),
            notch_hz: default_notch(),
            order: default_order(),
            notch_q: default_notch_q(),
        }
    }
}

/// Conditions one raw sample vector. Pure: same input, same output, no
/// state beyond the coefficients precomputed from a [`FilterSpec`].
pub trait SignalConditioner: Send + Sync {
    /// Return the filtered sample vector for one raw sample.
    fn condition(&self, samples: &[f32], sampling_rate_hz: f64) -> Vec<f32>;
}

/// The identity conditioner — used whenever filtering is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl SignalConditioner for Passthrough {
    fn condition(&self, samples: &[f32], _sampling_rate_hz: f64) -> Vec<f32> {
        samples.to_vec()
    }
}

/// Outcome of one classifier invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Index into the candidate stimulus frequency list.
    Selected(usize),
    /// No stimulus frequency detected.
    Idle,
}

/// Detects which candidate stimulus frequency (if any) a fixed-length
/// multi-channel window responds to. Stateless per invocation.
pub trait FrequencyClassifier: Send + Sync {
    /// `window` is one `Vec<f32>` per sample, each in electrode order.
    fn classify(&self, window: &[Vec<f32>], stimulus_hz: &[f64]) -> Detection;
}

/// A synchronous, poll-based sample source — the alternate device API.
/// Produces one raw sample per call and takes no part in the session
/// negotiation protocol.
pub trait PolledSampleSource {
    /// Acquire the next raw sample.
    fn next_sample(&mut self) -> RelayResult<SamplePacket>;
}
