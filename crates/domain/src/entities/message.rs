//! 消息实体定义
//!
//! 消息创建后不可修改，只有已读集合会单调增长。

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 消息内容最大字符数
pub const MAX_CONTENT_CHARS: usize = 10_000;

/// 经过验证的消息内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContent(String);

impl MessageContent {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::validation_error("content", "消息内容不能为空"));
        }
        if value.chars().count() > MAX_CONTENT_CHARS {
            return Err(DomainError::validation_error(
                "content",
                format!("消息内容不能超过{MAX_CONTENT_CHARS}个字符"),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// 已读回执，每个用户在一条消息上至多一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(rename = "user")]
    pub user_id: UserId,
    pub read_at: Timestamp,
}

/// 消息实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    #[serde(rename = "sender")]
    pub sender_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
    pub read_by: Vec<ReadReceipt>,
}

impl Message {
    /// 创建新消息，发送者视为已读
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content: content.into_inner(),
            created_at,
            read_by: vec![ReadReceipt {
                user_id: sender_id,
                read_at: created_at,
            }],
        }
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|receipt| receipt.user_id == user_id)
    }

    pub fn read_at(&self, user_id: UserId) -> Option<Timestamp> {
        self.read_by
            .iter()
            .find(|receipt| receipt.user_id == user_id)
            .map(|receipt| receipt.read_at)
    }

    /// 标记为已读，返回是否产生了变化
    pub fn mark_read_by(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if self.is_read_by(user_id) {
            return false;
        }
        self.read_by.push(ReadReceipt {
            user_id,
            read_at: at,
        });
        true
    }
}

/// 分页结果，消息按创建时间倒序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub next_cursor: Option<MessageId>,
}

impl MessagePage {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            has_more: false,
            next_cursor: None,
        }
    }

    /// 从多取一条的结果构建分页
    pub fn from_overfetch(mut messages: Vec<Message>, limit: usize) -> Self {
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        let next_cursor = if has_more {
            messages.last().map(|message| message.id)
        } else {
            None
        };
        Self {
            messages,
            has_more,
            next_cursor,
        }
    }
}
