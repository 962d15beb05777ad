//! 聊天相关的领域事件
//!
//! 由外部协作方（好友服务、会话 HTTP 接口）或在线状态注册表产生，
//! 经事件总线分发给已注册的处理器。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Conversation, PresenceStatus};
use crate::value_objects::{Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// 用户在线状态发生变化
    PresenceChanged {
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    },

    /// 新会话被创建
    ConversationCreated {
        conversation: Conversation,
        initiator: UserId,
    },

    /// 收到好友请求，好友关系载荷由好友服务定义
    FriendRequestReceived {
        recipient_id: UserId,
        sender_id: UserId,
        friendship: Value,
    },

    /// 好友关系变化
    FriendshipChanged {
        user_a: UserId,
        user_b: UserId,
        friends: bool,
    },
}

impl DomainEvent {
    pub fn presence_changed(user_id: UserId, status: PresenceStatus, at: Timestamp) -> Self {
        DomainEvent::PresenceChanged {
            user_id,
            status,
            at,
        }
    }

    pub fn conversation_created(conversation: Conversation, initiator: UserId) -> Self {
        DomainEvent::ConversationCreated {
            conversation,
            initiator,
        }
    }

    pub fn friend_request_received(recipient_id: UserId, sender_id: UserId, friendship: Value) -> Self {
        DomainEvent::FriendRequestReceived {
            recipient_id,
            sender_id,
            friendship,
        }
    }

    pub fn friendship_changed(user_a: UserId, user_b: UserId, friends: bool) -> Self {
        DomainEvent::FriendshipChanged {
            user_a,
            user_b,
            friends,
        }
    }

    /// 事件名称，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::PresenceChanged { .. } => "presence_changed",
            DomainEvent::ConversationCreated { .. } => "conversation_created",
            DomainEvent::FriendRequestReceived { .. } => "friend_request_received",
            DomainEvent::FriendshipChanged { .. } => "friendship_changed",
        }
    }
}
