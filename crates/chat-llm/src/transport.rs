use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chat_core::ChatRequest;
use futures::Stream;

use crate::error::TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Raw response body, chunked as the network delivers it
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue a chat request and return the streamed response body
    ///
    /// The stream ends when the server closes the response; dropping it
    /// abandons the request.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream>;

    /// List models available on the server
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![])
    }

    /// Remove a model from the server
    async fn delete_model(&self, name: &str) -> Result<()> {
        Err(TransportError::Api(format!(
            "deleting model '{}' is not supported by this transport",
            name
        )))
    }
}
