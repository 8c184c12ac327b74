//! Core domain types, wire envelopes, and history paging rules.

pub mod event;
pub mod history;
pub mod model;

pub use event::{
    ClientEnvelope, EnvelopeError, PresenceStatus, PresenceUpdate, SendRequest, ServerEvent,
};
pub use history::{normalize_limit, page_newest_first, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT};
pub use model::{Conversation, Group, Message, MessageKind, MessageParent, User};
