use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    Api(String),
}

/// A response segment that is not a JSON object
#[derive(Error, Debug)]
#[error("invalid record {segment:?}: {source}")]
pub struct DecodeError {
    pub segment: String,
    #[source]
    pub source: serde_json::Error,
}
