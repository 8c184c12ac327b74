//! Membership predicates. These are the only gates the messaging and group
//! paths consult before touching a conversation or group on a caller's behalf.

use anyhow::Result;
use uuid::Uuid;

use crate::store::{ConversationStore, GroupStore};

pub async fn is_conversation_participant(
    conversations: &dyn ConversationStore,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<bool> {
    conversations
        .is_conversation_participant(conversation_id, user_id)
        .await
}

pub async fn is_group_member(groups: &dyn GroupStore, group_id: Uuid, user_id: Uuid) -> Result<bool> {
    groups.is_group_member(group_id, user_id).await
}

pub async fn is_group_creator(
    groups: &dyn GroupStore,
    group_id: Uuid,
    user_id: Uuid,
) -> Result<bool> {
    groups.is_group_creator(group_id, user_id).await
}
