//! Configuration for the Waggle runtime
//!
//! Loading hierarchy: environment > file > defaults. The schema mirrors the
//! runtime's tunable surface — swarm timing, admission caps, queue sizing,
//! router cache and fallback, task defaults.

pub mod config;
pub mod env;
pub mod schema;

pub use config::{load_config, load_from_path, load_from_str, validate_config};
pub use schema::*;
