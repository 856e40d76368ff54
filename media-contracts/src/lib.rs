//! Trait surfaces at the system's boundaries: persistence (the repository
//! port), event emission, and the provider/enricher plug-in contracts.
//!
//! Nothing in this crate depends on a concrete transport, database dialect,
//! or plug-in sandbox — those are composed in by `media-server`.
#![allow(missing_docs)]

pub mod enricher;
pub mod error;
pub mod events;
pub mod provider;
pub mod repository;

pub use enricher::{Enricher, EnricherHealth, EnricherMatch};
pub use error::{CoreError, CoreErrorWithContext, Result};
pub use events::{EventPublisher, NullEventPublisher};
pub use provider::{HardwareAccelerator, Provider, ProviderHandle, ProviderInfo};
pub use repository::{
    DeviceProfileRepository, InteractionRepository, LibraryRepository, MediaFileFilter,
    MediaFilesReadPort, MediaFilesWritePort, Page, Repository, ScanJobRepository, SortDirection,
    TranscodeSessionRepository, UpsertOutcome,
};
