//! 会话与消息存储契约
//!
//! 存储是持久状态的唯一裁决者。所有方法都是挂起点，调用方不能假设
//! 不同请求之间的调用顺序。

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationSummary, Message, MessageContent, MessageId,
    MessagePage, PresenceStatus, RepositoryError, Timestamp, UserId,
};

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    /// 原子的查找或创建。返回会话以及本次调用是否新建了它。
    /// 对 (a, b) 与 (b, a) 的并发调用必须收敛到同一个会话。
    async fn find_or_create(
        &self,
        a: UserId,
        b: UserId,
        now: Timestamp,
    ) -> Result<(Conversation, bool), RepositoryError>;

    async fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>, RepositoryError>;

    /// 用户参与的全部会话概要，最近活跃的在前
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, RepositoryError>;

    /// 删除会话并级联删除其消息
    async fn delete(&self, id: ConversationId) -> Result<(), RepositoryError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 追加消息，已读集合只包含发送者，同时更新会话的 last_message
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError>;

    /// 按创建时间倒序分页，`before` 为上一页返回的游标
    async fn list_page(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagePage, RepositoryError>;

    /// 把会话中该用户未读的消息全部标记为已读，返回发生变化的消息数
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;

    async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u64, RepositoryError>;
}

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    /// 记录用户最近一次在线状态变化
    async fn record_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> Result<(), RepositoryError>;
}
