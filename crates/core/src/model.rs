use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public view of an account. The password hash never leaves storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One-to-one conversation between two distinct users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    pub created_at: DateTime<Utc>,
    /// Creation time of the most recent message, or `created_at` when empty.
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Order a participant pair so lookups by unordered pair hit a single key.
    pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    pub fn includes(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub created_by: Uuid,
    pub members: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.members.contains(&user_id)
    }

    pub fn is_creator(&self, user_id: Uuid) -> bool {
        self.created_by == user_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Conversation,
    Group,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Conversation => "conversation",
            MessageKind::Group => "group",
        }
    }
}

/// The owning conversation or group of a message.
///
/// Serialized flat into the message as `kind` plus exactly one of
/// `conversation_id` / `group_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageParent {
    Conversation { conversation_id: Uuid },
    Group { group_id: Uuid },
}

impl MessageParent {
    pub fn conversation(conversation_id: Uuid) -> Self {
        MessageParent::Conversation { conversation_id }
    }

    pub fn group(group_id: Uuid) -> Self {
        MessageParent::Group { group_id }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageParent::Conversation { .. } => MessageKind::Conversation,
            MessageParent::Group { .. } => MessageKind::Group,
        }
    }

    pub fn id(&self) -> Uuid {
        match *self {
            MessageParent::Conversation { conversation_id } => conversation_id,
            MessageParent::Group { group_id } => group_id,
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        match *self {
            MessageParent::Conversation { conversation_id } => Some(conversation_id),
            MessageParent::Group { .. } => None,
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match *self {
            MessageParent::Group { group_id } => Some(group_id),
            MessageParent::Conversation { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: Uuid,
    #[serde(flatten)]
    pub parent: MessageParent,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        sender_id: Uuid,
        parent: MessageParent,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender_id,
            parent,
            content: content.into(),
            created_at,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.parent.kind()
    }
}
