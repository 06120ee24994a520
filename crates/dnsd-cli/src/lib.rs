//! Configuration and remote control layers of the `dnsd` binary.
//!
//! Exposed as a library so the configuration parser can be fuzzed and
//! exercised from integration tests.

pub mod config;
pub mod control;

pub use config::Config;
pub use control::{Command, ControlConfig, ControlSocket, ControlState};
