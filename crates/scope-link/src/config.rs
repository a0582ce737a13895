//! Runtime configuration, loaded from TOML. Every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use scope_core::constants::{KMEANS_MAX_ITER, KMEANS_N_INIT, KMEANS_TOLERANCE};
use scope_core::{DEFAULT_SEED, InstrumentKind, KMeansConfig};

use crate::error::ConfigError;

pub const CONFIG_ENV: &str = "SCOPE_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScopeConfig {
    pub peers: PeerAddresses,
    pub peer: PeerSettings,
    pub analysis: AnalysisSettings,
}

/// Default peer address per instrument kind.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerAddresses {
    pub stem: String,
    pub afm: String,
}

impl Default for PeerAddresses {
    fn default() -> Self {
        Self {
            stem: "127.0.0.1:9091".to_string(),
            afm: "127.0.0.1:9092".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerSettings {
    /// Connect, read and write timeout for every peer call.
    pub timeout_ms: u64,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisSettings {
    pub seed: u64,
    pub n_init: usize,
    pub max_iter: usize,
    pub tolerance: f64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            n_init: KMEANS_N_INIT,
            max_iter: KMEANS_MAX_ITER,
            tolerance: KMEANS_TOLERANCE,
        }
    }
}

impl ScopeConfig {
    /// Explicit path wins, then `$SCOPE_CONFIG`, then built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve_path(path) {
            Some(p) => Self::from_file(&p),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.timeout_ms == 0 {
            return Err(ConfigError::Invalid("peer.timeout_ms must be positive".into()));
        }
        if self.analysis.n_init == 0 || self.analysis.max_iter == 0 {
            return Err(ConfigError::Invalid(
                "analysis.n_init and analysis.max_iter must be at least 1".into(),
            ));
        }
        if !(self.analysis.tolerance.is_finite() && self.analysis.tolerance >= 0.0) {
            return Err(ConfigError::Invalid(
                "analysis.tolerance must be a non-negative number".into(),
            ));
        }
        for (kind, addr) in [("stem", &self.peers.stem), ("afm", &self.peers.afm)] {
            if addr.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("peers.{kind} is empty")));
            }
        }
        Ok(())
    }

    pub fn address_for(&self, kind: InstrumentKind) -> &str {
        match kind {
            InstrumentKind::Stem => &self.peers.stem,
            InstrumentKind::Afm => &self.peers.afm,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.peer.timeout_ms)
    }

    pub fn kmeans(&self) -> KMeansConfig {
        KMeansConfig {
            seed: self.analysis.seed,
            n_init: self.analysis.n_init,
            max_iter: self.analysis.max_iter,
            tolerance: self.analysis.tolerance,
        }
    }
}

fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(p.to_path_buf());
    }
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
