//! HTTP client for the inference endpoint of a running container

use crate::error::{NimError, NimResult};
use crate::lifecycle::NimManager;
use crate::model::ModelIdentity;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Highest step count the distilled model accepts
pub const MAX_DISTILLED_STEPS: u32 = 4;

/// Caller-facing generation parameters
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompt: String,
    pub width: u32,
    pub height: u32,
    pub cfg_scale: f32,
    /// 0 lets the server pick a random seed
    pub seed: u64,
    pub steps: u32,
    /// PNG conditioning image, required by canny and depth variants
    pub image_png: Option<Vec<u8>>,
}

impl Default for GenerateRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            width: 1024,
            height: 1024,
            cfg_scale: 5.0,
            seed: 0,
            steps: 50,
            image_png: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPrompt {
    pub text: String,
}

/// JSON body of `POST /v1/infer`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferPayload {
    pub width: u32,
    pub height: u32,
    pub text_prompts: Vec<TextPrompt>,
    pub mode: String,
    pub cfg_scale: f32,
    pub seed: u64,
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InferResponse {
    pub artifacts: Vec<Artifact>,
}

/// One generated image
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Artifact {
    pub base64: String,
    #[serde(rename = "finishReason")]
    pub finish_reason: String,
}

impl Artifact {
    /// Decoded image bytes
    pub fn decode(&self) -> NimResult<Vec<u8>> {
        STANDARD
            .decode(self.base64.as_bytes())
            .map_err(|e| NimError::Inference(format!("Invalid base64 artifact: {}", e)))
    }
}

/// Build the request body for `model`, applying per-model constraints
pub fn build_payload(model: ModelIdentity, request: &GenerateRequest) -> NimResult<InferPayload> {
    let variant = model.variant();
    let mut cfg_scale = request.cfg_scale;

    if model.is_distilled() {
        if request.steps == 0 || request.steps > MAX_DISTILLED_STEPS {
            return Err(NimError::InvalidRequest(format!(
                "{} step value must be between 1-{} steps",
                model, MAX_DISTILLED_STEPS
            )));
        }
        cfg_scale = 0.0;
    }

    let image = match (&request.image_png, variant.requires_image()) {
        (Some(png), true) => Some(format!("data:image/png;base64,{}", STANDARD.encode(png))),
        (None, true) => {
            return Err(NimError::InvalidRequest(format!(
                "{} mode requires an input image",
                variant
            )));
        }
        (_, false) => None,
    };

    Ok(InferPayload {
        width: request.width,
        height: request.height,
        text_prompts: vec![TextPrompt {
            text: request.prompt.clone(),
        }],
        mode: variant.as_str().to_string(),
        cfg_scale,
        seed: request.seed,
        steps: request.steps,
        image,
    })
}

/// Client for containers published on the local host
#[derive(Debug, Clone)]
pub struct InferenceClient {
    http: reqwest::Client,
    host: String,
}

impl InferenceClient {
    pub fn new(timeout: Duration) -> NimResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NimError::Inference(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            host: "localhost".to_string(),
        })
    }

    /// Generate an image with the container serving `model`
    pub async fn generate(
        &self,
        manager: &NimManager,
        model: ModelIdentity,
        request: &GenerateRequest,
    ) -> NimResult<Artifact> {
        let port = manager.get_port(model).await?;
        self.generate_at(port, model, request).await
    }

    /// Generate an image against a known port
    pub async fn generate_at(
        &self,
        port: u16,
        model: ModelIdentity,
        request: &GenerateRequest,
    ) -> NimResult<Artifact> {
        let payload = build_payload(model, request)?;
        let url = format!("http://{}:{}/v1/infer", self.host, port);

        tracing::debug!(
            model = %model,
            url = %url,
            mode = %payload.mode,
            steps = payload.steps,
            "Sending inference request"
        );

        let response = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    NimError::Inference(format!("Unable to connect to NIM API at {}", url))
                } else {
                    NimError::Inference(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NimError::Inference(format!(
                "NIM API returned {}: {}",
                status, body
            )));
        }

        let body: InferResponse = response
            .json()
            .await
            .map_err(|e| NimError::Inference(format!("Invalid response body: {}", e)))?;

        let artifact = body
            .artifacts
            .into_iter()
            .next()
            .ok_or_else(|| NimError::Inference("Response contained no artifacts".to_string()))?;

        tracing::info!(model = %model, finish_reason = %artifact.finish_reason, "Inference finished");
        Ok(artifact)
    }

    /// Whether the container on `port` reports ready
    pub async fn is_ready(&self, port: u16) -> bool {
        let url = format!("http://{}:{}/v1/health/ready", self.host, port);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
