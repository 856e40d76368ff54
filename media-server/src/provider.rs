//! Built-in software transcoding provider.
//!
//! The spec deliberately leaves the transcoder binary unspecified — only the
//! [`Provider`] contract it must satisfy. This is the one concrete provider
//! the composition root registers by default: it shells out to `ffmpeg`
//! (configurable path) to produce an HLS rendition, tracks progress by
//! parsing `-progress` key/value lines off its stdout, and cancels by
//! signalling the process group so no grandchild ffmpeg helper is left
//! behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use media_contracts::{CoreError, HardwareAccelerator, Provider, ProviderHandle, ProviderInfo, Result};
use media_model::{SessionId, TranscodeProgress, TranscodeRequest};
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Canonical id for the built-in provider; also the fixture id used across
/// `media-core`'s own tests for the directory-name grammar.
pub const SOFTWARE_PROVIDER_ID: &str = "dash_ffmpeg_software";

struct RunningJob {
    child: Mutex<Option<Child>>,
    progress: Arc<Mutex<TranscodeProgress>>,
}

/// Software (CPU) encoding via an external `ffmpeg` binary. No hardware
/// accelerators are advertised; the registry only prefers this provider
/// when nothing more specialized is registered for the requested
/// container.
pub struct SoftwareProvider {
    ffmpeg_path: String,
    supported_formats: Vec<String>,
    jobs: Mutex<HashMap<String, Arc<RunningJob>>>,
}

impl SoftwareProvider {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            supported_formats: vec!["mp4".to_string(), "webm".to_string(), "mpegts".to_string()],
            jobs: Mutex::new(HashMap::new()),
        }
    }

    fn build_command(&self, request: &TranscodeRequest, output_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-y")
            .arg("-i")
            .arg(&request.media_id)
            .arg("-c:v")
            .arg(&request.video_codec)
            .arg("-c:a")
            .arg(&request.audio_codec);

        if let Some((w, h)) = request.resolution {
            cmd.arg("-vf").arg(format!("scale={w}:{h}"));
        }
        if let Some(vb) = request.video_bitrate_kbps {
            cmd.arg("-b:v").arg(format!("{vb}k"));
        }
        if let Some(ab) = request.audio_bitrate_kbps {
            cmd.arg("-b:a").arg(format!("{ab}k"));
        }

        cmd.arg("-progress").arg("pipe:1").arg("-nostats");
        cmd.arg(output_dir.join(format!("output.{}", request.container)));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // New process group so cancellation/reaping can signal the
            // whole group rather than racing a single pid.
            unsafe {
                cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
            }
        }
        cmd
    }
}

#[async_trait]
impl Provider for SoftwareProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: SOFTWARE_PROVIDER_ID.to_string(),
            priority: 1,
            supported_formats: self.supported_formats.clone(),
            hardware_accelerators: Vec::<HardwareAccelerator>::new(),
        }
    }

    async fn start(
        &self,
        session_id: SessionId,
        request: &TranscodeRequest,
        output_dir: &Path,
    ) -> Result<ProviderHandle> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(CoreError::from)?;

        let mut cmd = self.build_command(request, output_dir);
        let mut child = cmd
            .spawn()
            .map_err(|err| CoreError::Unavailable(format!("failed to spawn ffmpeg: {err}")))?;

        let progress = Arc::new(Mutex::new(TranscodeProgress::default()));
        if let Some(stdout) = child.stdout.take() {
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut out_time_ms: Option<f64> = None;
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(value) = line.strip_prefix("out_time_ms=") {
                        out_time_ms = value.trim().parse::<f64>().ok();
                    }
                    if line.starts_with("progress=") {
                        let mut p = progress.lock();
                        if let Some(ms) = out_time_ms {
                            // Without a known source duration this is a
                            // monotonically increasing proxy, not a true
                            // percentage; callers treat 100.0 as "done".
                            p.percent = (p.percent).max((ms / 1_000.0).min(99.0));
                        }
                        p.segments_ready += 1;
                    }
                }
            });
        }

        let handle = ProviderHandle(format!("{session_id}"));
        self.jobs.lock().insert(
            handle.0.clone(),
            Arc::new(RunningJob {
                child: Mutex::new(Some(child)),
                progress,
            }),
        );
        Ok(handle)
    }

    async fn progress(&self, handle: &ProviderHandle) -> Result<TranscodeProgress> {
        let job = self
            .jobs
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("provider job {}", handle.0)))?;
        Ok(job.progress.lock().clone())
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<()> {
        let job = self.jobs.lock().remove(&handle.0);
        let Some(job) = job else {
            return Ok(());
        };
        if let Some(mut child) = job.child.lock().take() {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    let pid = nix::unistd::Pid::from_raw(pid as i32);
                    let _ = nix::sys::signal::killpg(pid, nix::sys::signal::Signal::SIGTERM);
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
            match tokio::time::timeout(std::time::Duration::from_secs(5), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("ffmpeg did not exit within grace period, forcing kill");
                    let _ = child.start_kill();
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SoftwareProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareProvider")
            .field("ffmpeg_path", &self.ffmpeg_path)
            .finish()
    }
}

pub fn build_output_path(dir_root: &Path, name: &str) -> PathBuf {
    dir_root.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertises_the_canonical_id() {
        let provider = SoftwareProvider::new("ffmpeg");
        assert_eq!(provider.info().id, SOFTWARE_PROVIDER_ID);
        assert!(provider.info().hardware_accelerators.is_empty());
    }

    #[tokio::test]
    async fn progress_before_start_is_not_found() {
        let provider = SoftwareProvider::new("ffmpeg");
        let err = provider
            .progress(&ProviderHandle("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
