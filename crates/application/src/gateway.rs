//! 连接网关
//!
//! 负责握手认证、连接登记，以及把客户端命令交给扇出引擎。
//! 每条连接对应一个 [`ConnectionSession`]，它保证注销只发生一次：
//! 显式调用 `disconnect` 或者被丢弃时都会执行清理。

use std::sync::Arc;

use domain::{ConnectionId, DomainEvent, UserId};

use crate::{
    channels::{ChannelRouter, OutboundReceiver},
    clock::Clock,
    error::ApplicationError,
    event_bus::EventBus,
    fanout::{FanoutEngine, SendMessageRequest},
    identity::IdentityVerifier,
    presence::{PresenceRegistry, PresenceTransition},
    protocol::{parse_command, ClientCommand},
};

pub struct GatewayDependencies {
    pub verifier: Arc<dyn IdentityVerifier>,
    pub presence: Arc<PresenceRegistry>,
    pub router: Arc<ChannelRouter>,
    pub engine: Arc<FanoutEngine>,
    pub events: Arc<dyn EventBus>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct ConnectionGateway {
    deps: Arc<GatewayDependencies>,
}

impl ConnectionGateway {
    pub fn new(deps: GatewayDependencies) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    /// 校验握手凭证，缺失或无效时返回认证错误
    pub async fn authenticate(&self, token: Option<&str>) -> Result<UserId, ApplicationError> {
        let token = token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(ApplicationError::Authentication)?;
        self.deps.verifier.verify(token).await
    }

    pub async fn connect(&self, token: Option<&str>) -> Result<ConnectionSession, ApplicationError> {
        let user_id = self.authenticate(token).await?;
        Ok(self.open_session(user_id).await)
    }

    /// 登记连接并绑定私有频道。登记完成之后会话才存在，
    /// 所以加入会话频道一定发生在登记之后。
    pub async fn open_session(&self, user_id: UserId) -> ConnectionSession {
        let connection_id = ConnectionId::generate();
        let outbound = self.deps.router.attach(connection_id, user_id);
        let transition = self.deps.presence.register(user_id, connection_id);
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "连接已建立");

        if let Some(transition) = transition {
            self.publish_transition(transition).await;
        }

        ConnectionSession {
            id: connection_id,
            user_id,
            gateway: self.clone(),
            outbound: Some(outbound),
            closed: false,
        }
    }

    async fn publish_transition(&self, transition: PresenceTransition) {
        self.deps
            .events
            .publish(DomainEvent::presence_changed(
                transition.user_id,
                transition.current,
                self.deps.clock.now(),
            ))
            .await;
    }

    fn release(&self, user_id: UserId, connection_id: ConnectionId) -> Option<PresenceTransition> {
        self.deps.router.detach(connection_id);
        let transition = self.deps.presence.unregister(user_id, connection_id);
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "连接已断开");
        transition
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.deps.presence
    }
}

pub struct ConnectionSession {
    id: ConnectionId,
    user_id: UserId,
    gateway: ConnectionGateway,
    outbound: Option<OutboundReceiver>,
    closed: bool,
}

impl ConnectionSession {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 取走出站队列，只能取一次
    pub fn take_outbound(&mut self) -> Option<OutboundReceiver> {
        self.outbound.take()
    }

    /// 处理一帧文本。格式错误的帧记录后忽略，能识别出临时 ID 的
    /// send_message 会收到错误回执。
    pub async fn handle_text(&self, text: &str) -> Result<(), ApplicationError> {
        match parse_command(text) {
            Ok(command) => self.handle(command).await,
            Err(malformed) => {
                tracing::debug!(
                    connection_id = %self.id,
                    event = ?malformed.event,
                    reason = %malformed.reason,
                    "忽略无法解析的客户端帧"
                );
                if let Some(reply) = malformed.error_reply() {
                    self.gateway.deps.router.send(self.id, reply);
                }
                Ok(())
            }
        }
    }

    pub async fn handle(&self, command: ClientCommand) -> Result<(), ApplicationError> {
        tracing::debug!(connection_id = %self.id, user_id = %self.user_id, command = command.name(), "收到客户端命令");
        let deps = &self.gateway.deps;

        match command {
            ClientCommand::JoinConversation { conversation_id } => {
                match deps
                    .engine
                    .participant_conversation(conversation_id, self.user_id)
                    .await
                {
                    Ok(_) => {
                        deps.router.join(self.id, conversation_id);
                    }
                    Err(err) => {
                        tracing::debug!(
                            connection_id = %self.id,
                            conversation_id = %conversation_id,
                            error = %err,
                            "拒绝加入会话频道"
                        );
                    }
                }
                Ok(())
            }
            ClientCommand::LeaveConversation { conversation_id } => {
                deps.router.leave(self.id, conversation_id);
                Ok(())
            }
            ClientCommand::SendMessage {
                conversation_id,
                content,
                temp_id,
            } => {
                let request = SendMessageRequest {
                    conversation_id,
                    sender_id: self.user_id,
                    content,
                    temp_id,
                    origin: Some(self.id),
                };
                // 放到独立任务里执行，连接中途断开也不会打断持久化
                let engine = deps.engine.clone();
                tokio::spawn(async move { engine.send_message(request).await })
                    .await
                    .map_err(|err| ApplicationError::infrastructure_with_source("send task aborted", err))?
                    .map(|_| ())
            }
            ClientCommand::NotifyMessagesRead { conversation_id } => deps
                .engine
                .mark_read(conversation_id, self.user_id)
                .await
                .map(|_| ()),
            ClientCommand::NotifyConversationTyping {
                conversation_id,
                is_typing,
            } => deps
                .engine
                .typing(conversation_id, self.user_id, self.id, is_typing)
                .await
                .map(|_| ()),
            ClientCommand::SetStatus { status } => {
                if let Some(transition) = deps.presence.set_status(self.user_id, status) {
                    self.gateway.publish_transition(transition).await;
                }
                Ok(())
            }
        }
    }

    /// 显式断开并等待离线通知发送完成
    pub async fn disconnect(mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(transition) = self.gateway.release(self.user_id, self.id) {
            self.gateway.publish_transition(transition).await;
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(transition) = self.gateway.release(self.user_id, self.id) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let gateway = self.gateway.clone();
                handle.spawn(async move { gateway.publish_transition(transition).await });
            }
            Err(_) => {
                tracing::warn!(user_id = %self.user_id, "运行时不可用，离线通知未发送");
            }
        }
    }
}
