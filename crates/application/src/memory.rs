//! 内存实现的会话存储与社交关系，没有配置数据库时使用，也供测试使用

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationSummary, Message, MessageContent, MessageId,
    MessagePage, PresenceStatus, RepositoryError, Timestamp, UserId,
};
use tokio::sync::RwLock;

use crate::error::ApplicationError;
use crate::repository::{ConversationRepository, MessageRepository, PresenceRepository};
use crate::social::SocialGraph;

#[derive(Default)]
struct StoreState {
    conversations: HashMap<ConversationId, Conversation>,
    pairs: HashMap<(UserId, UserId), ConversationId>,
    // 每个会话的消息按 (created_at, id) 升序保存
    messages: HashMap<ConversationId, Vec<Message>>,
    presence: HashMap<UserId, (PresenceStatus, Timestamp)>,
}

impl StoreState {
    fn unread_for(&self, conversation_id: ConversationId, user_id: UserId) -> u64 {
        self.messages
            .get(&conversation_id)
            .map(|messages| messages.iter().filter(|m| !m.is_read_by(user_id)).count() as u64)
            .unwrap_or(0)
    }
}

#[derive(Default)]
pub struct MemoryConversationStore {
    state: RwLock<StoreState>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 最近一次记录的在线状态及时间
    pub async fn last_presence(&self, user_id: UserId) -> Option<(PresenceStatus, Timestamp)> {
        self.state.read().await.presence.get(&user_id).copied()
    }

    pub async fn message_count(&self, conversation_id: ConversationId) -> usize {
        self.state
            .read()
            .await
            .messages
            .get(&conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationStore {
    async fn find_or_create(
        &self,
        a: UserId,
        b: UserId,
        now: Timestamp,
    ) -> Result<(Conversation, bool), RepositoryError> {
        let key = Conversation::pair_key(a, b).map_err(|_| RepositoryError::Conflict)?;
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .pairs
            .get(&key)
            .and_then(|id| state.conversations.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let conversation = Conversation::new(ConversationId::generate(), a, b, now)
            .map_err(|_| RepositoryError::Conflict)?;
        state.pairs.insert(key, conversation.id);
        state.messages.insert(conversation.id, Vec::new());
        state
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok((conversation, true))
    }

    async fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.state.read().await.conversations.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let state = self.state.read().await;
        let mut summaries: Vec<ConversationSummary> = state
            .conversations
            .values()
            .filter(|conversation| conversation.is_participant(user_id))
            .map(|conversation| ConversationSummary {
                conversation: conversation.clone(),
                last_message: state
                    .messages
                    .get(&conversation.id)
                    .and_then(|messages| messages.last().cloned()),
                unread_count: state.unread_for(conversation.id, user_id),
            })
            .collect();
        summaries.sort_by(|a, b| b.conversation.updated_at.cmp(&a.conversation.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: ConversationId) -> Result<(), RepositoryError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .remove(&id)
            .ok_or(RepositoryError::NotFound)?;
        state
            .pairs
            .remove(&(conversation.participant_one, conversation.participant_two));
        state.messages.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryConversationStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let mut state = self.state.write().await;
        let message = Message::new(MessageId::generate(), conversation_id, sender_id, content, at);

        if !state.conversations.contains_key(&conversation_id) {
            return Err(RepositoryError::NotFound);
        }

        // 并发发送可能晚到，按时间插入到正确位置
        let messages = state.messages.entry(conversation_id).or_default();
        let key = (message.created_at, message.id);
        let index = messages.partition_point(|m| (m.created_at, m.id) < key);
        messages.insert(index, message.clone());
        let newest = index + 1 == messages.len();

        if newest {
            if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                conversation.record_message(message.id, at);
            }
        }
        Ok(message)
    }

    async fn list_page(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagePage, RepositoryError> {
        let state = self.state.read().await;
        let Some(messages) = state.messages.get(&conversation_id) else {
            return Ok(MessagePage::empty());
        };

        let end = match before {
            Some(cursor) => match messages.iter().find(|m| m.id == cursor) {
                Some(anchor) => {
                    let key = (anchor.created_at, anchor.id);
                    messages.partition_point(|m| (m.created_at, m.id) < key)
                }
                None => return Ok(MessagePage::empty()),
            },
            None => messages.len(),
        };

        let limit = limit as usize;
        let newest_first: Vec<Message> = messages[..end]
            .iter()
            .rev()
            .take(limit + 1)
            .cloned()
            .collect();
        Ok(MessagePage::from_overfetch(newest_first, limit))
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let mut state = self.state.write().await;
        let Some(messages) = state.messages.get_mut(&conversation_id) else {
            return Ok(0);
        };
        let changed = messages
            .iter_mut()
            .map(|message| message.mark_read_by(user_id, at))
            .filter(|changed| *changed)
            .count();
        Ok(changed as u64)
    }

    async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u64, RepositoryError> {
        Ok(self.state.read().await.unread_for(conversation_id, user_id))
    }
}

#[async_trait]
impl PresenceRepository for MemoryConversationStore {
    async fn record_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.state.write().await.presence.insert(user_id, (status, at));
        Ok(())
    }
}

/// 内存好友与屏蔽关系
#[derive(Default)]
pub struct MemorySocialGraph {
    friends: RwLock<HashMap<UserId, HashSet<UserId>>>,
    // (屏蔽者, 被屏蔽者)
    blocks: RwLock<HashSet<(UserId, UserId)>>,
}

impl MemorySocialGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_friendship(&self, a: UserId, b: UserId) {
        let mut friends = self.friends.write().await;
        friends.entry(a).or_default().insert(b);
        friends.entry(b).or_default().insert(a);
    }

    pub async fn remove_friendship(&self, a: UserId, b: UserId) {
        let mut friends = self.friends.write().await;
        if let Some(set) = friends.get_mut(&a) {
            set.remove(&b);
        }
        if let Some(set) = friends.get_mut(&b) {
            set.remove(&a);
        }
    }

    pub async fn block(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().await.insert((blocker, blocked));
    }

    pub async fn unblock(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().await.remove(&(blocker, blocked));
    }
}

#[async_trait]
impl SocialGraph for MemorySocialGraph {
    async fn can_message(&self, from: UserId, to: UserId) -> Result<bool, ApplicationError> {
        let blocks = self.blocks.read().await;
        Ok(!blocks.contains(&(from, to)) && !blocks.contains(&(to, from)))
    }

    async fn friends_of(&self, user_id: UserId) -> Result<Vec<UserId>, ApplicationError> {
        Ok(self
            .friends
            .read()
            .await
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}
