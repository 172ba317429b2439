//! Classifier capability: a batch of texts in, one positive-class score per
//! text out.

use std::time::Duration;

use async_trait::async_trait;
use imagenome_common::config::ClassifierConfig;
use imagenome_common::{CapabilityError, ModelVersion};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Score every text; the output is parallel to the input.
    async fn classify(&self, texts: &[String]) -> Result<Vec<f64>, CapabilityError>;
    fn model_version(&self) -> &ModelVersion;
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct ClassifyResponse {
    scores: Vec<f64>,
}

/// Remote text classifier: `POST {"texts": [...]}` → `{"scores": [...]}`.
pub struct HttpClassifier {
    endpoint: String,
    model_version: ModelVersion,
    client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>, model_version: ModelVersion, timeout: Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        Ok(Self { endpoint: endpoint.into(), model_version, client })
    }

    pub fn from_config(cfg: &ClassifierConfig) -> Result<Self, CapabilityError> {
        Self::new(
            cfg.endpoint.clone(),
            ModelVersion::new(cfg.model_version.clone()),
            Duration::from_secs(cfg.timeout_secs),
        )
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, texts: &[String]) -> Result<Vec<f64>, CapabilityError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&ClassifyRequest { texts })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CapabilityError::from_status(status.as_u16(), body));
        }

        let body: ClassifyResponse = resp.json().await?;
        debug!(texts = texts.len(), "Classifier responded");
        if body.scores.len() != texts.len() {
            return Err(CapabilityError::OutputMismatch { expected: texts.len(), actual: body.scores.len() });
        }
        Ok(body.scores)
    }

    fn model_version(&self) -> &ModelVersion {
        &self.model_version
    }
}
