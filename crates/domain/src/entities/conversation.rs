//! 会话实体定义
//!
//! 会话由恰好两个不同的参与者组成，同一对参与者至多存在一个会话。
//! 参与者按 ID 排序存放，`participant_one` 总是较小的一方。

use serde::{Deserialize, Serialize};

use crate::entities::message::Message;
use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_one: UserId,
    pub participant_two: UserId,
    pub last_message: Option<MessageId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        a: UserId,
        b: UserId,
        now: Timestamp,
    ) -> DomainResult<Self> {
        let (participant_one, participant_two) = Self::pair_key(a, b)?;
        Ok(Self {
            id,
            participant_one,
            participant_two,
            last_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// 无序参与者对的规范化键
    pub fn pair_key(a: UserId, b: UserId) -> DomainResult<(UserId, UserId)> {
        if a == b {
            return Err(DomainError::validation_error(
                "participants",
                "会话参与者必须是两个不同的用户",
            ));
        }
        Ok(if a < b { (a, b) } else { (b, a) })
    }

    pub fn participants(&self) -> [UserId; 2] {
        [self.participant_one, self.participant_two]
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant_one == user_id || self.participant_two == user_id
    }

    /// 对方参与者；非参与者返回 None
    pub fn other_participant(&self, user_id: UserId) -> Option<UserId> {
        if self.participant_one == user_id {
            Some(self.participant_two)
        } else if self.participant_two == user_id {
            Some(self.participant_one)
        } else {
            None
        }
    }

    pub fn ensure_participant(&self, user_id: UserId) -> DomainResult<()> {
        if self.is_participant(user_id) {
            Ok(())
        } else {
            Err(DomainError::permission_denied("not a participant of this conversation"))
        }
    }

    pub fn record_message(&mut self, message_id: MessageId, at: Timestamp) {
        self.last_message = Some(message_id);
        self.updated_at = at;
    }
}

/// 某个查看者视角下的会话概要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub last_message: Option<Message>,
    pub unread_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_pair_key_is_order_independent() {
        let a = UserId::generate();
        let b = UserId::generate();
        assert_eq!(
            Conversation::pair_key(a, b).unwrap(),
            Conversation::pair_key(b, a).unwrap()
        );
    }

    #[test]
    fn test_conversation_rejects_self_pair() {
        let a = UserId::generate();
        let result = Conversation::new(ConversationId::generate(), a, a, Utc::now());
        assert!(matches!(result, Err(DomainError::ValidationError { .. })));
    }

    #[test]
    fn test_participant_helpers() {
        let a = UserId::generate();
        let b = UserId::generate();
        let outsider = UserId::generate();
        let conversation = Conversation::new(ConversationId::generate(), a, b, Utc::now()).unwrap();

        assert!(conversation.participant_one < conversation.participant_two);
        assert!(conversation.is_participant(a));
        assert_eq!(conversation.other_participant(a), Some(b));
        assert_eq!(conversation.other_participant(b), Some(a));
        assert_eq!(conversation.other_participant(outsider), None);
        assert!(conversation.ensure_participant(outsider).is_err());
    }

    #[test]
    fn test_record_message_updates_last_message() {
        let now = Utc::now();
        let mut conversation =
            Conversation::new(ConversationId::generate(), UserId::generate(), UserId::generate(), now)
                .unwrap();
        let message_id = MessageId::generate();
        let later = now + chrono::Duration::seconds(1);
        conversation.record_message(message_id, later);
        assert_eq!(conversation.last_message, Some(message_id));
        assert_eq!(conversation.updated_at, later);
    }
}
