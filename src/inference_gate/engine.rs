//! Detection engine seam and the HTTP sidecar implementation

use crate::error::{Error, Result};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

fn default_label() -> String {
    "strawberry".to_string()
}

/// One detection as the engine reports it, before thresholding
#[derive(Debug, Clone, Deserialize)]
pub struct RawDetection {
    #[serde(default = "default_label")]
    pub label: String,
    pub score: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// Object detector backing the gate
#[async_trait::async_trait]
pub trait DetectionEngine: Send + Sync {
    /// Load (or switch to) a model. Fails if the engine rejects it.
    async fn load(&self, model_ref: &str) -> Result<()>;

    /// Drop the loaded model
    async fn unload(&self) -> Result<()>;

    /// Run the loaded model over one JPEG frame
    async fn detect(&self, jpeg: Vec<u8>) -> Result<Vec<RawDetection>>;

    /// Engine reachable and answering
    async fn health(&self) -> bool;
}

/// Local inference sidecar spoken to over HTTP
pub struct HttpEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEngine {
    /// Create new engine client
    pub fn new(base_url: String) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create new engine client with custom timeout
    pub fn with_timeout(base_url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("Failed to create HTTP client");

        Self { client, base_url }
    }

    /// Get base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait::async_trait]
impl DetectionEngine for HttpEngine {
    async fn load(&self, model_ref: &str) -> Result<()> {
        let url = format!("{}/v1/models/load", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "model": model_ref }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "model load rejected: {} - {}",
                status,
                body.trim()
            )));
        }

        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        let url = format!("{}/v1/models/unload", self.base_url);
        let resp = self.client.post(&url).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Inference(format!(
                "model unload failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    async fn detect(&self, jpeg: Vec<u8>) -> Result<Vec<RawDetection>> {
        let url = format!("{}/v1/detect", self.base_url);

        let form = Form::new().part(
            "frame",
            Part::bytes(jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "detect failed: {} - {}",
                status,
                body.trim()
            )));
        }

        let result: DetectResponse = resp.json().await?;
        Ok(result.detections)
    }

    async fn health(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
