use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{AFM_DEFAULT_CHANNEL, STEM_DEFAULT_CHANNEL};

/// The instrument families the orchestrator drives. Session, pipeline and
/// trajectory logic is shared; only the peer-side acquisition differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstrumentKind {
    #[serde(rename = "STEM")]
    Stem,
    #[serde(rename = "AFM")]
    Afm,
}

impl InstrumentKind {
    /// Case-insensitive parse. `None` for anything unsupported.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STEM" => Some(InstrumentKind::Stem),
            "AFM" => Some(InstrumentKind::Afm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstrumentKind::Stem => "STEM",
            InstrumentKind::Afm => "AFM",
        }
    }

    pub fn default_channel(self) -> &'static str {
        match self {
            InstrumentKind::Stem => STEM_DEFAULT_CHANNEL,
            InstrumentKind::Afm => AFM_DEFAULT_CHANNEL,
        }
    }
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
    Faulted,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connected => "Connected",
            ConnectionState::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}
