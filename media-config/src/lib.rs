//! Typed configuration for the media server core: one struct per
//! configuration group named in the core's operational surface, loaded from
//! TOML with environment-variable override and sane defaults.

pub mod config;
pub mod loader;

pub use config::{CleanupConfig, CoreConfig, ScanConfig, ThrottleConfig, TranscodeConfig};
pub use loader::{load, load_from_file, ConfigLoadError, ConfigSource};
