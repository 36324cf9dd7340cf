//! Frame sources for the camera rig

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::process::Command;

/// One JPEG frame from whatever sensor is attached
#[async_trait::async_trait]
pub trait FrameSource: Send + Sync {
    /// Capture a single JPEG frame
    async fn capture_jpeg(&self) -> Result<Vec<u8>>;

    /// Cheap liveness check (device node present, sensor answering)
    async fn probe(&self) -> bool;
}

/// V4L2 camera read through ffmpeg
///
/// One ffmpeg invocation per frame keeps the sensor free between
/// captures so the rig lock stays meaningful.
pub struct V4l2Camera {
    device: String,
    capture_timeout: Duration,
}

/// ffmpeg single-frame timeout (seconds)
const CAPTURE_TIMEOUT_SECS: u64 = 5;

impl V4l2Camera {
    pub fn new(device: String) -> Self {
        Self {
            device,
            capture_timeout: Duration::from_secs(CAPTURE_TIMEOUT_SECS),
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for V4l2Camera {
    /// Capture one frame from the V4L2 device using ffmpeg
    ///
    /// Uses kill_on_drop(true) so a timeout drops the Child and SIGKILLs
    /// the ffmpeg process instead of leaving it holding the sensor.
    async fn capture_jpeg(&self) -> Result<Vec<u8>> {
        use std::process::Stdio;

        let child = Command::new("ffmpeg")
            .args([
                "-f", "v4l2",
                "-i", &self.device,
                "-frames:v", "1",
                "-f", "image2pipe",
                "-vcodec", "mjpeg",
                "-loglevel", "error",
                "-y",
                "-",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("ffmpeg spawn failed: {}", e)))?;

        match tokio::time::timeout(self.capture_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(Error::Internal(format!(
                        "ffmpeg capture failed: {}",
                        stderr.trim()
                    )));
                }

                if output.stdout.is_empty() {
                    return Err(Error::Internal("ffmpeg returned empty frame".to_string()));
                }

                Ok(output.stdout)
            }
            Ok(Err(e)) => Err(Error::Internal(format!("ffmpeg execution failed: {}", e))),
            Err(_) => {
                tracing::warn!(
                    device = %self.device,
                    timeout_sec = self.capture_timeout.as_secs(),
                    "ffmpeg capture timeout, process killed via kill_on_drop"
                );
                Err(Error::Internal(format!(
                    "camera capture timeout ({}s)",
                    self.capture_timeout.as_secs()
                )))
            }
        }
    }

    async fn probe(&self) -> bool {
        tokio::fs::metadata(&self.device).await.is_ok()
    }
}
