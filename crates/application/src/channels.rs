//! 连接级的频道路由
//!
//! 每条连接有一个出站队列，以及它加入的会话频道集合。私有频道不需要
//! 显式记录：用户的全部连接就是他的私有频道。

use std::collections::HashSet;

use dashmap::DashMap;
use domain::{ConnectionId, ConversationId, UserId};
use tokio::sync::mpsc;

use crate::protocol::ServerEvent;

pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerEvent>;

#[derive(Debug)]
struct ConnectionHandle {
    user_id: UserId,
    sender: OutboundSender,
    conversations: HashSet<ConversationId>,
}

#[derive(Debug, Default)]
pub struct ChannelRouter {
    connections: DashMap<ConnectionId, ConnectionHandle>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定一条连接，返回它的出站队列
    pub fn attach(&self, connection_id: ConnectionId, user_id: UserId) -> OutboundReceiver {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id,
            ConnectionHandle {
                user_id,
                sender,
                conversations: HashSet::new(),
            },
        );
        receiver
    }

    /// 解绑连接，同时丢弃它的全部频道成员关系。返回连接是否存在。
    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        self.connections.remove(&connection_id).is_some()
    }

    pub fn join(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        match self.connections.get_mut(&connection_id) {
            Some(mut handle) => {
                handle.conversations.insert(conversation_id);
                true
            }
            None => false,
        }
    }

    pub fn leave(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        self.connections
            .get_mut(&connection_id)
            .map(|mut handle| handle.conversations.remove(&conversation_id))
            .unwrap_or(false)
    }

    /// 把会话从所有连接的频道集合中移除（会话被删除时）
    pub fn close_conversation(&self, conversation_id: ConversationId) -> usize {
        let mut removed = 0;
        for mut handle in self.connections.iter_mut() {
            if handle.conversations.remove(&conversation_id) {
                removed += 1;
            }
        }
        removed
    }

    pub fn is_joined(&self, connection_id: ConnectionId, conversation_id: ConversationId) -> bool {
        self.connections
            .get(&connection_id)
            .map(|handle| handle.conversations.contains(&conversation_id))
            .unwrap_or(false)
    }

    pub fn user_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.connections.get(&connection_id).map(|handle| handle.user_id)
    }

    /// 投递到一条连接。连接不存在或接收端已关闭时返回 false。
    pub fn send(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let Some(handle) = self.connections.get(&connection_id) else {
            return false;
        };
        if handle.sender.send(event).is_err() {
            tracing::debug!(connection_id = %connection_id, "出站队列已关闭，丢弃事件");
            return false;
        }
        true
    }
}
