use async_trait::async_trait;
use media_model::{SessionId, TranscodeProgress, TranscodeRequest};
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareAccelerator {
    Vaapi,
    Nvenc,
    Qsv,
    VideoToolbox,
    Amf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInfo {
    pub id: String,
    pub priority: i32,
    pub supported_formats: Vec<String>,
    pub hardware_accelerators: Vec<HardwareAccelerator>,
}

/// Opaque handle to a dispatched transcode; only meaningful back to the
/// provider that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProviderHandle(pub String);

/// The narrow contract the Transcode Orchestrator consumes. Providers are
/// plug-ins; the sandbox/RPC transport that loads them is out of scope here
/// — this trait is the boundary a provider, wherever it runs, must satisfy.
///
/// Providers must honor cancellation within 5 seconds of `cancel` being
/// called.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn start(
        &self,
        session_id: SessionId,
        request: &TranscodeRequest,
        output_dir: &Path,
    ) -> Result<ProviderHandle>;

    async fn progress(&self, handle: &ProviderHandle) -> Result<TranscodeProgress>;

    async fn cancel(&self, handle: &ProviderHandle) -> Result<()>;
}
