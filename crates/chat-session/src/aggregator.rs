//! Reply aggregation: merges streamed content fragments into one growing
//! message per role.
//!
//! Messages that are part of the conversation log are referenced by index,
//! so a fragment appended here is the same text the log shows.

use chat_core::{ChatRecord, Message, MessageId};

#[derive(Debug, Clone, PartialEq)]
pub enum ReplySlot {
    /// Index into the conversation log
    Logged(usize),
    /// Held outside the log
    Detached(Message),
}

/// Outcome of [`ReplyAggregator::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// No content, nothing changed
    Ignored,
    Appended {
        role: String,
        /// The record opened a new message for its role
        created: bool,
        /// The changed message is part of the conversation log
        logged: bool,
    },
}

impl Applied {
    pub fn changed_log(&self) -> bool {
        matches!(self, Applied::Appended { logged: true, .. })
    }
}

#[derive(Debug, Default)]
pub struct ReplyAggregator {
    slots: Vec<(String, ReplySlot)>,
}

impl ReplyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `record` into the message for its role.
    ///
    /// Records with empty content are ignored. A role seen for the first
    /// time gets a new message, pushed onto `log` when `attach_new` is set
    /// and held detached otherwise.
    pub fn apply(&mut self, record: &ChatRecord, log: &mut Vec<Message>, attach_new: bool) -> Applied {
        if !record.has_content() {
            return Applied::Ignored;
        }

        let role = record.role();
        let (position, created) = match self.position(role) {
            Some(position) => (position, false),
            None => {
                let message = Message::new(role, record.model.as_str());
                let slot = if attach_new {
                    log.push(message);
                    ReplySlot::Logged(log.len() - 1)
                } else {
                    ReplySlot::Detached(message)
                };
                self.slots.push((role.to_string(), slot));
                (self.slots.len() - 1, true)
            }
        };

        let (message, logged) = match &mut self.slots[position].1 {
            ReplySlot::Logged(index) => (log.get_mut(*index), true),
            ReplySlot::Detached(message) => (Some(message), false),
        };
        let Some(message) = message else {
            log::warn!("Reply for role '{}' lost its place in the conversation", role);
            return Applied::Ignored;
        };

        message.content.push_str(record.content());
        Applied::Appended {
            role: role.to_string(),
            created,
            logged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Roles in the order their first fragment arrived
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|(role, _)| role.as_str())
    }

    pub fn slot(&self, role: &str) -> Option<&ReplySlot> {
        self.position(role).map(|position| &self.slots[position].1)
    }

    pub fn message<'a>(&'a self, role: &str, log: &'a [Message]) -> Option<&'a Message> {
        match self.slot(role)? {
            ReplySlot::Logged(index) => log.get(*index),
            ReplySlot::Detached(message) => Some(message),
        }
    }

    /// Record the durable id the store assigned to the reply for `role`
    pub fn set_id(&mut self, role: &str, id: MessageId, log: &mut [Message]) {
        let Some(position) = self.position(role) else {
            return;
        };
        match &mut self.slots[position].1 {
            ReplySlot::Logged(index) => {
                if let Some(message) = log.get_mut(*index) {
                    message.id = Some(id);
                }
            }
            ReplySlot::Detached(message) => message.id = Some(id),
        }
    }

    /// Take private copies of logged replies before `log` is replaced
    pub fn detach(&mut self, log: &[Message]) {
        for (_, slot) in &mut self.slots {
            if let ReplySlot::Logged(index) = slot {
                if let Some(message) = log.get(*index) {
                    *slot = ReplySlot::Detached(message.clone());
                }
            }
        }
    }

    /// Append detached replies to `log` and track them there again
    pub fn attach(&mut self, log: &mut Vec<Message>) {
        for (_, slot) in &mut self.slots {
            if let ReplySlot::Detached(message) = slot {
                log.push(message.clone());
                *slot = ReplySlot::Logged(log.len() - 1);
            }
        }
    }

    fn position(&self, role: &str) -> Option<usize> {
        self.slots.iter().position(|(r, _)| r == role)
    }
}
