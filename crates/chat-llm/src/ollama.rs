use async_trait::async_trait;
use chat_core::{ChatRequest, Config};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::transport::{ByteStream, ChatTransport, Result};

/// HTTP transport for an Ollama-compatible server
pub struct OllamaTransport {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    name: &'a str,
}

impl OllamaTransport {
    /// `base_url` is the API root, e.g. `http://localhost:11434/api`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.base_url())
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ChatTransport for OllamaTransport {
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream> {
        let url = format!("{}/chat", self.base_url);
        log::debug!(
            "POST {} model '{}' with {} messages",
            url,
            request.model,
            request.messages.len()
        );

        let response = self.client.post(&url).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(TransportError::Api(format!("HTTP {}: {}", status, text)));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| TransportError::Stream(e.to_string())));

        Ok(Box::pin(stream))
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/tags", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(TransportError::Api(format!("HTTP {}: {}", status, text)));
        }

        let tags: TagsResponse = serde_json::from_slice(&response.bytes().await?)?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn delete_model(&self, name: &str) -> Result<()> {
        let url = format!("{}/delete", self.base_url);
        log::info!("DELETE {} model '{}'", url, name);

        let response = self
            .client
            .delete(&url)
            .json(&DeleteRequest { name })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            return Err(TransportError::Api(format!("HTTP {}: {}", status, text)));
        }
        Ok(())
    }
}
