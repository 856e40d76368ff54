//! Library scanning and playback transcoding orchestration core.
//!
//! This crate owns the Scan Engine, Playback Decision Engine, Transcode
//! Orchestrator and Cleanup Service described in the workspace's design
//! documents. It depends only on [`media_model`] and [`media_contracts`] —
//! no HTTP, no database dialect, no plug-in sandbox. Those are composed in
//! by `media-server`.
#![allow(missing_docs)]

pub mod cleanup;
pub mod decision;
pub mod enrich;
pub mod memory;
pub mod registry;
pub mod scan;
pub mod session;
pub mod throttle;
pub mod walker;

pub use cleanup::{CleanupReport, CleanupService};
pub use decision::{decide, Decision, MediaInfo, PlaybackMethod};
pub use enrich::EnricherPool;
pub use memory::InMemoryRepository;
pub use registry::{NoCapableProvider, ProviderRegistry};
pub use scan::{ProgressSnapshot, ScanEngine};
pub use session::TranscodeOrchestrator;
pub use throttle::{AdaptiveThrottle, Budget, ThrottleSample};
pub use walker::{FileEntry, WalkFilter, Walker};
