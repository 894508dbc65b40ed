use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use super::{Generation, Generator};
use crate::config::ModelConfig;
use crate::embeddings::Embedder;
use crate::error::{PipelineError, Result, Service};
use crate::types::TokenUsage;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    usage_metadata: Option<GoogleUsage>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    content: Option<GoogleContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
struct GooglePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: u64,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    #[serde(default)]
    embeddings: Vec<EmbeddingValues>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

/// Google Gemini client covering both generation and embeddings.
pub struct GeminiClient {
    client: Client,
    api_key: String,
    endpoint: String,
    generation_model: String,
    embedding_model: String,
    temperature: f32,
}

impl GeminiClient {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("GEMINI_API_KEY is not set".into()))?;

        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(300))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(
            generation_model = %config.generation_model,
            embedding_model = %config.embedding_model,
            "Initialized Gemini client"
        );

        Ok(Self {
            client,
            api_key,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            generation_model: config.generation_model.clone(),
            embedding_model: config.embedding_model.clone(),
            temperature: config.temperature,
        })
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.endpoint, model, method)
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        service: Service,
        url: &str,
        body: &JsonValue,
    ) -> Result<T> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                let transient = e.is_timeout() || e.is_connect() || e.is_request();
                PipelineError::external(service, format!("request to {} failed: {}", url, e), transient)
            })?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            let preview: String = error.chars().take(300).collect();
            return Err(PipelineError::external(
                service,
                format!("Google API error ({}): {}", status, preview),
                is_transient_status(status),
            ));
        }

        parse_json_response(service, response, url).await
    }
}

/// Rate limiting and server-side failures are worth retrying; other
/// client errors are not.
fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

async fn parse_json_response<T: serde::de::DeserializeOwned>(
    service: Service,
    response: reqwest::Response,
    endpoint: &str,
) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(|e| {
        PipelineError::external(
            service,
            format!("Failed to read response body from {}: {}", endpoint, e),
            true,
        )
    })?;

    // Proxies sometimes return 200 with an HTML page
    let trimmed = body.trim_start();
    if trimmed.starts_with('<') {
        let preview: String = trimmed.chars().take(200).collect();
        return Err(PipelineError::external(
            service,
            format!(
                "Endpoint {} returned HTML instead of JSON (HTTP {}): {}",
                endpoint, status, preview
            ),
            true,
        ));
    }

    serde_json::from_str::<T>(&body).map_err(|e| {
        let preview: String = body.chars().take(300).collect();
        PipelineError::external(
            service,
            format!(
                "Failed to parse JSON from {} (HTTP {}): {}. Response body: {}",
                endpoint, status, e, preview
            ),
            false,
        )
    })
}

fn generation_request(prompt: &str, schema: Option<&JsonValue>, temperature: f32) -> JsonValue {
    let mut generation_config = json!({ "temperature": temperature });
    if let Some(schema) = schema {
        generation_config["responseMimeType"] = json!("application/json");
        generation_config["responseSchema"] = schema.clone();
    }
    json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "generationConfig": generation_config,
    })
}

#[async_trait]
impl Generator for GeminiClient {
    async fn generate(&self, prompt: &str, schema: Option<&JsonValue>) -> Result<Generation> {
        let url = self.model_url(&self.generation_model, "generateContent");
        let request = generation_request(prompt, schema, self.temperature);
        let result: GoogleResponse = self.post(Service::Generation, &url, &request).await?;

        let text = result
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect::<String>())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                PipelineError::external(Service::Generation, "No response from Google Gemini", false)
            })?;

        let usage = result
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            })
            .unwrap_or_default();

        Ok(Generation { text, usage })
    }

    fn model_id(&self) -> &str {
        &self.generation_model
    }
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = self.model_url(&self.embedding_model, "embedContent");
        let request = json!({
            "model": format!("models/{}", self.embedding_model),
            "content": { "parts": [{ "text": text }] },
            "taskType": "RETRIEVAL_QUERY",
        });
        let result: EmbedResponse = self.post(Service::Embedding, &url, &request).await?;
        Ok(result.embedding.values)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.model_url(&self.embedding_model, "batchEmbedContents");
        let model = format!("models/{}", self.embedding_model);
        let requests: Vec<JsonValue> = texts
            .iter()
            .map(|t| {
                json!({
                    "model": model,
                    "content": { "parts": [{ "text": t }] },
                    "taskType": "RETRIEVAL_DOCUMENT",
                })
            })
            .collect();
        let result: BatchEmbedResponse = self
            .post(Service::Embedding, &url, &json!({ "requests": requests }))
            .await?;

        if result.embeddings.len() != texts.len() {
            return Err(PipelineError::external(
                Service::Embedding,
                format!(
                    "expected {} embeddings, received {}",
                    texts.len(),
                    result.embeddings.len()
                ),
                false,
            ));
        }
        Ok(result.embeddings.into_iter().map(|e| e.values).collect())
    }

    fn model_id(&self) -> &str {
        &self.embedding_model
    }
}
