//! Status LED behind an optional sysfs brightness path

use crate::error::Result;
use std::path::PathBuf;

/// Status LED. Without a configured path every write is a no-op, so
/// the led_on flag still tracks for headless development boxes.
pub struct StatusLed {
    path: Option<PathBuf>,
}

impl StatusLed {
    pub fn new(path: Option<PathBuf>) -> Self {
        if let Some(ref p) = path {
            tracing::info!(path = %p.display(), "Status LED attached");
        }
        Self { path }
    }

    /// Drive the LED. Errors surface to the caller so the command can
    /// report failure instead of lying about the LED state.
    pub async fn set(&self, on: bool) -> Result<()> {
        if let Some(ref path) = self.path {
            tokio::fs::write(path, if on { "1" } else { "0" }).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_headless_led_is_noop() {
        let led = StatusLed::new(None);
        led.set(true).await.unwrap();
        led.set(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_led_writes_brightness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brightness");
        tokio::fs::write(&path, "0").await.unwrap();

        let led = StatusLed::new(Some(path.clone()));
        led.set(true).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "1");

        led.set(false).await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "0");
    }
}
