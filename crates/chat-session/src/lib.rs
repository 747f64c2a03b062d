//! # Chat Session
//!
//! Turns prompts into chat requests, folds the streamed reply into the
//! conversation, persists finished exchanges and drives auto-answer chaining
//! between two models.

pub mod aggregator;
pub mod error;
pub mod events;
pub mod exchange;
pub mod runner;
pub mod session;

pub use aggregator::{Applied, ReplyAggregator, ReplySlot};
pub use error::{Result, SessionError};
pub use events::{FollowUp, SessionEvent, SessionSnapshot};
pub use exchange::{ExchangeId, OutboundExchange};
pub use runner::{spawn_session, SessionHandle, SessionOptions};
pub use session::ChatSession;
