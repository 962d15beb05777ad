//! 连接上的 JSON 帧协议
//!
//! 每一帧都是 `{"event": <名称>, "data": <载荷>}`，载荷字段使用 camelCase。

use domain::{
    Conversation, ConversationId, Message, PresenceStatus, Timestamp, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApplicationError;

/// 客户端发往服务器的命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default)]
        temp_id: Option<String>,
    },
    NotifyMessagesRead {
        conversation_id: ConversationId,
    },
    NotifyConversationTyping {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    #[serde(rename = "user:status")]
    SetStatus { status: PresenceStatus },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinConversation { .. } => "join_conversation",
            ClientCommand::LeaveConversation { .. } => "leave_conversation",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::NotifyMessagesRead { .. } => "notify_messages_read",
            ClientCommand::NotifyConversationTyping { .. } => "notify_conversation_typing",
            ClientCommand::SetStatus { .. } => "user:status",
        }
    }
}

/// 无法解析的客户端帧，尽量保留可以用来回复错误的字段
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedCommand {
    pub event: Option<String>,
    pub temp_id: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub reason: String,
}

impl MalformedCommand {
    /// 只有带临时 ID 的 send_message 才值得回复错误
    pub fn error_reply(&self) -> Option<ServerEvent> {
        if self.event.as_deref() != Some("send_message") {
            return None;
        }
        let temp_id = self.temp_id.clone()?;
        Some(ServerEvent::SendMessageError {
            temp_id: Some(temp_id),
            conversation_id: self.conversation_id,
            message: format!("malformed send_message: {}", self.reason),
            code: crate::error::ErrorKind::Validation.as_str().to_string(),
        })
    }
}

pub fn parse_command(text: &str) -> Result<ClientCommand, MalformedCommand> {
    match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => Ok(command),
        Err(err) => {
            let value = serde_json::from_str::<Value>(text).unwrap_or(Value::Null);
            let data = value.get("data");
            let field = |key: &str| {
                data.and_then(|data| data.get(key))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            Err(MalformedCommand {
                event: value.get("event").and_then(Value::as_str).map(str::to_string),
                temp_id: field("tempId"),
                conversation_id: field("conversationId").and_then(|id| id.parse().ok()),
                reason: err.to_string(),
            })
        }
    }
}

/// 服务器推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewMessage {
        #[serde(flatten)]
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    SendMessageError {
        temp_id: Option<String>,
        conversation_id: Option<ConversationId>,
        message: String,
        code: String,
    },
    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: Timestamp,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    #[serde(rename = "user:statusChanged")]
    StatusChanged {
        user_id: UserId,
        status: PresenceStatus,
    },
    ConversationCreated {
        conversation: Conversation,
    },
    #[serde(rename = "friend:requestReceived")]
    FriendRequestReceived {
        sender_id: UserId,
        friendship: Value,
    },
}

impl ServerEvent {
    pub fn new_message(message: Message, temp_id: Option<String>) -> Self {
        ServerEvent::NewMessage { message, temp_id }
    }

    pub fn send_error(
        temp_id: Option<String>,
        conversation_id: ConversationId,
        error: &ApplicationError,
    ) -> Self {
        ServerEvent::SendMessageError {
            temp_id,
            conversation_id: Some(conversation_id),
            message: error.client_message(),
            code: error.kind().as_str().to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage { .. } => "new_message",
            ServerEvent::SendMessageError { .. } => "send_message_error",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::StatusChanged { .. } => "user:statusChanged",
            ServerEvent::ConversationCreated { .. } => "conversation_created",
            ServerEvent::FriendRequestReceived { .. } => "friend:requestReceived",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
