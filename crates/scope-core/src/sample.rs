use serde::{Deserialize, Serialize};

use crate::geometry::Point;

/// A single channel reading: a scalar (height, phase) or a spectrum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Scalar(f64),
    Spectrum(Vec<f64>),
}

impl Value {
    /// Number of feature-matrix columns this value contributes.
    pub fn width(&self) -> usize {
        match self {
            Value::Scalar(_) => 1,
            Value::Spectrum(v) => v.len(),
        }
    }

    pub fn as_slice(&self) -> &[f64] {
        match self {
            Value::Scalar(v) => std::slice::from_ref(v),
            Value::Spectrum(v) => v,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }
}

/// What the peer adapter hands back: a value at a position on a channel,
/// not yet owned by any session.
#[derive(Clone, Debug, PartialEq)]
pub struct Reading {
    pub position: Point,
    pub channel: String,
    pub value: Value,
}

impl Reading {
    pub fn new(position: Point, channel: impl Into<String>, value: Value) -> Self {
        Self {
            position,
            channel: channel.into(),
            value,
        }
    }
}

/// A reading stamped by the session. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Sample {
    site: usize,
    position: Point,
    channel: String,
    value: Value,
    epoch: u64,
}

impl Sample {
    pub(crate) fn stamp(reading: Reading, site: usize, epoch: u64) -> Self {
        Self {
            site,
            position: reading.position,
            channel: reading.channel,
            value: reading.value,
            epoch,
        }
    }

    /// Feature-row identity: readings at one position within one batch.
    pub fn site(&self) -> usize {
        self.site
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
