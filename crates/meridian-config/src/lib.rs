//! Configuration for the Meridian replication server.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line. Every section tolerates missing fields so older files keep
//! loading as new settings are added.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{CONFIG_FILE, Config, DebugConfig, NetworkConfig, SessionConfig, WorldConfig};
pub use error::ConfigError;
