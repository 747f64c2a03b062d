pub mod error;
pub mod ndjson;
pub mod ollama;
pub mod transport;

pub use error::{DecodeError, TransportError};
pub use ndjson::{FrameDecoder, Frames};
pub use ollama::OllamaTransport;
pub use transport::{ByteStream, ChatTransport, Result};
