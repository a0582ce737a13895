pub mod client;
pub mod config;
pub mod error;
pub mod sim;
pub mod wire;

pub use client::{Connection, FrameRequest, InstrumentHandle};
pub use config::ScopeConfig;
pub use error::{ConfigError, PeerError, Result};
pub use sim::{SimHandle, SimOptions, SimServer};
pub use wire::Modification;
