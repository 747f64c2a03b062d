use std::fmt;

use chat_core::{ChatId, ChatRequest};
use chat_llm::FrameDecoder;

use crate::aggregator::ReplyAggregator;

/// Identity of one request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A request the transport should issue for a freshly started exchange
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundExchange {
    pub id: ExchangeId,
    pub request: ChatRequest,
}

/// An in-flight reply
#[derive(Debug)]
pub(crate) struct Exchange {
    pub id: ExchangeId,
    /// Chat the reply is persisted into
    pub chat_id: ChatId,
    /// Model handed to `send_prompt`, carried into follow-ups
    pub model: String,
    pub auto_chained: bool,
    pub decoder: FrameDecoder,
    pub replies: ReplyAggregator,
}

impl Exchange {
    pub fn new(id: ExchangeId, chat_id: ChatId, model: String, auto_chained: bool) -> Self {
        Self {
            id,
            chat_id,
            model,
            auto_chained,
            decoder: FrameDecoder::new(),
            replies: ReplyAggregator::new(),
        }
    }
}
