//! Annotator capability: a batch of texts in, one raw span list per text out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use imagenome_common::config::{AnnotatorBackend, AnnotatorConfig};
use imagenome_common::{CapabilityError, ModelVersion};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::lexicon::LexiconAnnotator;

/// A span as emitted by a tagger, before label normalisation and merging.
/// Offsets are byte offsets into the submitted text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSpan {
    pub start: usize,
    pub end: usize,
    pub label: String,
    #[serde(default = "default_score")]
    pub score: f32,
}

fn default_score() -> f32 {
    1.0
}

impl RawSpan {
    pub fn new(start: usize, end: usize, label: impl Into<String>, score: f32) -> Self {
        Self { start, end, label: label.into(), score }
    }
}

#[async_trait]
pub trait Annotator: Send + Sync {
    /// Tag every text; the output is parallel to the input.
    async fn annotate(&self, texts: &[String]) -> Result<Vec<Vec<RawSpan>>, CapabilityError>;
    fn model_version(&self) -> &ModelVersion;
}

// ── HTTP backend ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct AnnotateResponse {
    entities: Vec<Vec<RawSpan>>,
}

/// Remote tagger: `POST {"texts": [...]}` → `{"entities": [[...], ...]}`.
pub struct HttpAnnotator {
    endpoint: String,
    model_version: ModelVersion,
    client: reqwest::Client,
}

impl HttpAnnotator {
    pub fn new(endpoint: impl Into<String>, model_version: ModelVersion, timeout: Duration) -> Result<Self, CapabilityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapabilityError::Unavailable(e.to_string()))?;
        Ok(Self { endpoint: endpoint.into(), model_version, client })
    }

    pub fn from_config(cfg: &AnnotatorConfig) -> Result<Self, CapabilityError> {
        Self::new(
            cfg.endpoint.clone(),
            ModelVersion::new(cfg.model_version.clone()),
            Duration::from_secs(cfg.timeout_secs),
        )
    }
}

#[async_trait]
impl Annotator for HttpAnnotator {
    async fn annotate(&self, texts: &[String]) -> Result<Vec<Vec<RawSpan>>, CapabilityError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&AnnotateRequest { texts })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CapabilityError::from_status(status.as_u16(), body));
        }

        let body: AnnotateResponse = resp.json().await?;
        debug!(texts = texts.len(), "Annotator responded");
        if body.entities.len() != texts.len() {
            return Err(CapabilityError::OutputMismatch { expected: texts.len(), actual: body.entities.len() });
        }
        Ok(body.entities)
    }

    fn model_version(&self) -> &ModelVersion {
        &self.model_version
    }
}

/// Build the configured annotator backend.
pub fn annotator_from_config(cfg: &AnnotatorConfig) -> anyhow::Result<Arc<dyn Annotator>> {
    let version = ModelVersion::new(cfg.model_version.clone());
    match cfg.backend {
        AnnotatorBackend::Http => Ok(Arc::new(HttpAnnotator::from_config(cfg)?)),
        AnnotatorBackend::Lexicon => {
            let path = cfg
                .lexicon_path
                .as_deref()
                .context("annotator.lexicon_path is required for the lexicon backend")?;
            let lexicon = LexiconAnnotator::load(path, version)
                .with_context(|| format!("loading lexicon {}", path.display()))?;
            Ok(Arc::new(lexicon))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_shape() {
        let body: AnnotateResponse = serde_json::from_str(
            r#"{"entities": [[{"start": 0, "end": 3, "label": "GGP", "score": 0.7}], [{"start": 1, "end": 2, "label": "DNA"}]]}"#,
        )
        .unwrap();
        assert_eq!(body.entities[0][0], RawSpan::new(0, 3, "GGP", 0.7));
        assert_eq!(body.entities[1][0].score, 1.0);
    }
}
