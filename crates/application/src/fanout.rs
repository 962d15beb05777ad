//! 扇出引擎
//!
//! 把消息、已读回执、输入状态、在线状态等事件映射到目标连接。
//! 会话成员组不保存，每次事件都由在线注册表和频道路由现算。
//! 所有写操作先持久化再投递，持久化失败不会有任何投递。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    ConnectionId, Conversation, ConversationId, ConversationSummary, DomainError, DomainEvent,
    Message, MessageContent, MessageId, MessagePage, PresenceStatus, Timestamp, UserId,
};
use serde_json::Value;

use crate::{
    channels::ChannelRouter,
    clock::Clock,
    error::{ApplicationError, ErrorKind},
    event_bus::EventHandler,
    presence::PresenceRegistry,
    protocol::ServerEvent,
    repository::{ConversationRepository, MessageRepository, PresenceRepository},
    social::SocialGraph,
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub temp_id: Option<String>,
    pub origin: Option<ConnectionId>, // 发起连接，HTTP 调用时为空
}

pub struct FanoutDependencies {
    pub conversation_repository: Arc<dyn ConversationRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub presence_repository: Arc<dyn PresenceRepository>,
    pub social_graph: Arc<dyn SocialGraph>,
    pub presence: Arc<PresenceRegistry>,
    pub router: Arc<ChannelRouter>,
    pub clock: Arc<dyn Clock>,
}

pub struct FanoutEngine {
    deps: FanoutDependencies,
}

impl FanoutEngine {
    pub fn new(deps: FanoutDependencies) -> Self {
        Self { deps }
    }

    /// 会话存在且用户是参与者时返回会话
    pub async fn participant_conversation(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Conversation, ApplicationError> {
        let conversation = self
            .deps
            .conversation_repository
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(|| DomainError::conversation_not_found(conversation_id))?;
        conversation.ensure_participant(user_id)?;
        Ok(conversation)
    }

    /// 当前加入了会话频道的全部连接（双方所有设备）
    pub fn membership_group(&self, conversation: &Conversation) -> HashSet<ConnectionId> {
        conversation
            .participants()
            .into_iter()
            .flat_map(|participant| self.deps.presence.connections_for(participant))
            .filter(|connection_id| self.deps.router.is_joined(*connection_id, conversation.id))
            .collect()
    }

    /// 投递到用户私有频道，即该用户的所有在线连接
    pub fn send_to_user(&self, user_id: UserId, event: &ServerEvent) -> usize {
        self.deps
            .presence
            .connections_for(user_id)
            .into_iter()
            .filter(|connection_id| self.deps.router.send(*connection_id, event.clone()))
            .count()
    }

    pub async fn send_message(&self, request: SendMessageRequest) -> Result<Message, ApplicationError> {
        match self.persist_message(&request).await {
            Ok((conversation, message)) => {
                self.deliver_message(&conversation, &message, request.origin, request.temp_id);
                Ok(message)
            }
            Err(err) => {
                if err.kind() == ErrorKind::Internal {
                    tracing::error!(
                        conversation_id = %request.conversation_id,
                        sender_id = %request.sender_id,
                        error = %err,
                        "消息持久化失败"
                    );
                } else {
                    tracing::debug!(
                        conversation_id = %request.conversation_id,
                        sender_id = %request.sender_id,
                        error = %err,
                        "拒绝发送消息"
                    );
                }
                // 错误只回给发起连接
                if let Some(origin) = request.origin {
                    self.deps.router.send(
                        origin,
                        ServerEvent::send_error(request.temp_id.clone(), request.conversation_id, &err),
                    );
                }
                Err(err)
            }
        }
    }

    async fn persist_message(
        &self,
        request: &SendMessageRequest,
    ) -> Result<(Conversation, Message), ApplicationError> {
        let content = MessageContent::new(request.content.clone())?;
        let conversation = self
            .participant_conversation(request.conversation_id, request.sender_id)
            .await?;
        let recipient = conversation
            .other_participant(request.sender_id)
            .ok_or_else(|| ApplicationError::forbidden("not a participant of this conversation"))?;

        // 每次发送都重新检查，屏蔽随时可能发生
        if !self
            .deps
            .social_graph
            .can_message(request.sender_id, recipient)
            .await?
        {
            return Err(ApplicationError::forbidden("cannot message this user"));
        }

        let now = self.deps.clock.now();
        let message = self
            .deps
            .message_repository
            .append(conversation.id, request.sender_id, content, now)
            .await?;
        Ok((conversation, message))
    }

    fn deliver_message(
        &self,
        conversation: &Conversation,
        message: &Message,
        origin: Option<ConnectionId>,
        temp_id: Option<String>,
    ) {
        let mut targets = self.membership_group(conversation);
        if let Some(origin) = origin {
            targets.insert(origin);
        }

        let mut delivered = 0;
        for connection_id in targets {
            let event = if Some(connection_id) == origin {
                ServerEvent::new_message(message.clone(), temp_id.clone())
            } else {
                ServerEvent::new_message(message.clone(), None)
            };
            if self.deps.router.send(connection_id, event) {
                delivered += 1;
            }
        }
        tracing::debug!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            delivered,
            "消息已投递"
        );
    }

    /// 标记会话已读。有消息状态变化时广播一次回执并返回已读时间。
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Timestamp>, ApplicationError> {
        let conversation = self.participant_conversation(conversation_id, user_id).await?;
        let now = self.deps.clock.now();
        let changed = self
            .deps
            .message_repository
            .mark_read(conversation_id, user_id, now)
            .await?;

        if changed == 0 {
            tracing::debug!(conversation_id = %conversation_id, user_id = %user_id, "没有新的已读消息");
            return Ok(None);
        }

        let event = ServerEvent::MessagesRead {
            conversation_id,
            user_id,
            read_at: now,
        };
        for connection_id in self.membership_group(&conversation) {
            self.deps.router.send(connection_id, event.clone());
        }
        tracing::debug!(conversation_id = %conversation_id, user_id = %user_id, changed, "已读回执已广播");
        Ok(Some(now))
    }

    /// 转发输入状态给会话中除发送者之外的连接。发起连接必须已加入会话频道。
    pub async fn typing(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        origin: ConnectionId,
        is_typing: bool,
    ) -> Result<usize, ApplicationError> {
        if !self.deps.router.is_joined(origin, conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                connection_id = %origin,
                "未加入会话频道，忽略输入状态"
            );
            return Ok(0);
        }
        let conversation = self.participant_conversation(conversation_id, user_id).await?;
        let own = self.deps.presence.connections_for(user_id);

        let event = ServerEvent::UserTyping {
            conversation_id,
            user_id,
            is_typing,
        };
        Ok(self
            .membership_group(&conversation)
            .into_iter()
            .filter(|connection_id| !own.contains(connection_id))
            .filter(|connection_id| self.deps.router.send(*connection_id, event.clone()))
            .count())
    }

    /// 在线状态变化：记录到存储，并通知好友和本人的其他连接。
    /// 查询好友期间状态可能又变了，投递前再与注册表核对，过期的变化不再发送。
    pub async fn broadcast_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> Result<usize, ApplicationError> {
        let friends = self.deps.social_graph.friends_of(user_id).await?;
        let event = ServerEvent::StatusChanged { user_id, status };

        let recipients = std::iter::once(user_id).chain(friends);
        let delivered = self
            .deps
            .presence
            .deliver_if_current(user_id, status, recipients, |connection_id| {
                self.deps.router.send(connection_id, event.clone())
            });
        let Some(delivered) = delivered else {
            tracing::debug!(user_id = %user_id, status = %status, "在线状态已过期，跳过广播");
            return Ok(0);
        };

        if let Err(err) = self
            .deps
            .presence_repository
            .record_presence(user_id, status, at)
            .await
        {
            tracing::warn!(user_id = %user_id, error = %err, "记录在线状态失败");
        }
        tracing::debug!(user_id = %user_id, status = %status, delivered, "在线状态已广播");
        Ok(delivered)
    }

    /// 打开与另一用户的会话，返回会话以及是否新建。
    /// 新建时由调用方发布 `ConversationCreated` 事件通知对方。
    pub async fn open_conversation(
        &self,
        initiator: UserId,
        peer: UserId,
    ) -> Result<(Conversation, bool), ApplicationError> {
        if initiator == peer {
            return Err(DomainError::validation_error("peerId", "cannot open a conversation with yourself").into());
        }
        if !self.deps.social_graph.can_message(initiator, peer).await? {
            return Err(ApplicationError::forbidden("cannot message this user"));
        }

        let now = self.deps.clock.now();
        let (conversation, created) = self
            .deps
            .conversation_repository
            .find_or_create(initiator, peer, now)
            .await?;

        if created {
            tracing::info!(
                conversation_id = %conversation.id,
                initiator = %initiator,
                peer = %peer,
                "会话已创建"
            );
        }
        Ok((conversation, created))
    }

    fn notify_conversation_created(&self, conversation: &Conversation, initiator: UserId) {
        let Some(peer) = conversation.other_participant(initiator) else {
            return;
        };
        self.send_to_user(
            peer,
            &ServerEvent::ConversationCreated {
                conversation: conversation.clone(),
            },
        );
    }

    pub async fn delete_conversation(
        &self,
        requester: UserId,
        conversation_id: ConversationId,
    ) -> Result<(), ApplicationError> {
        self.participant_conversation(conversation_id, requester).await?;
        self.deps.conversation_repository.delete(conversation_id).await?;
        let cleared = self.deps.router.close_conversation(conversation_id);
        tracing::info!(
            conversation_id = %conversation_id,
            requester = %requester,
            cleared,
            "会话已删除"
        );
        Ok(())
    }

    pub async fn list_conversations(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, ApplicationError> {
        Ok(self.deps.conversation_repository.list_for_user(user_id).await?)
    }

    pub async fn list_messages(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> Result<MessagePage, ApplicationError> {
        self.participant_conversation(conversation_id, user_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        Ok(self
            .deps
            .message_repository
            .list_page(conversation_id, before, limit)
            .await?)
    }

    pub async fn unread_count(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64, ApplicationError> {
        self.participant_conversation(conversation_id, user_id).await?;
        Ok(self
            .deps
            .message_repository
            .unread_count(conversation_id, user_id)
            .await?)
    }

    pub fn notify_friend_request(&self, recipient_id: UserId, sender_id: UserId, friendship: Value) -> usize {
        self.send_to_user(
            recipient_id,
            &ServerEvent::FriendRequestReceived {
                sender_id,
                friendship,
            },
        )
    }

    /// 成为好友后互相告知当前在线状态
    pub fn friendship_changed(&self, user_a: UserId, user_b: UserId, friends: bool) {
        if !friends {
            return;
        }
        for (to, about) in [(user_a, user_b), (user_b, user_a)] {
            self.send_to_user(
                to,
                &ServerEvent::StatusChanged {
                    user_id: about,
                    status: self.deps.presence.status_of(about),
                },
            );
        }
    }
}

#[async_trait]
impl EventHandler for FanoutEngine {
    async fn handle(&self, event: &DomainEvent) -> Result<(), ApplicationError> {
        match event {
            DomainEvent::PresenceChanged { user_id, status, at } => {
                self.broadcast_presence(*user_id, *status, *at).await?;
            }
            DomainEvent::ConversationCreated {
                conversation,
                initiator,
            } => self.notify_conversation_created(conversation, *initiator),
            DomainEvent::FriendRequestReceived {
                recipient_id,
                sender_id,
                friendship,
            } => {
                self.notify_friend_request(*recipient_id, *sender_id, friendship.clone());
            }
            DomainEvent::FriendshipChanged {
                user_a,
                user_b,
                friends,
            } => self.friendship_changed(*user_a, *user_b, *friends),
        }
        Ok(())
    }

    fn can_handle(&self, event_type: &str) -> bool {
        matches!(
            event_type,
            "presence_changed" | "conversation_created" | "friend_request_received" | "friendship_changed"
        )
    }
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
