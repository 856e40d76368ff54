//! Data model shared across the media server's core, config and server crates.
#![allow(missing_docs)]

pub mod device_profile;
pub mod error;
pub mod events;
pub mod ids;
pub mod interaction;
pub mod library;
pub mod media_file;
pub mod scan_job;
pub mod transcode;

pub use device_profile::DeviceProfile;
pub use error::{ModelError, Result as ModelResult};
pub use events::{Event, EventKind};
pub use ids::{LibraryId, MediaFileId, ScanJobId, SessionId};
pub use interaction::{Interaction, InteractionKind};
pub use library::{LibraryKind, MediaLibrary};
pub use media_file::{MediaFile, MediaType, StreamInfo, StreamKind};
pub use scan_job::{LibraryStats, ScanCheckpoint, ScanJob, ScanStatus};
pub use transcode::{
    content_hash, parse_session_directory_name, session_directory_name, TranscodeProgress,
    TranscodeRequest, TranscodeResult, TranscodeSession, TranscodeStatus,
};
