use std::collections::HashMap;
use std::sync::Arc;

use application::{
    ApplicationError, ConversationRepository, MessageRepository, PresenceRepository, SocialGraph,
};
use async_trait::async_trait;
use domain::{
    Conversation, ConversationId, ConversationSummary, Message, MessageContent, MessageId,
    MessagePage, PresenceStatus, ReadReceipt, RepositoryError, Timestamp, UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool, Postgres, Transaction};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        other => RepositoryError::storage(other.to_string()),
    }
}

#[derive(Debug, FromRow)]
struct ConversationRecord {
    id: Uuid,
    participant_one: Uuid,
    participant_two: Uuid,
    last_message_id: Option<Uuid>,
    created_at: Timestamp,
    updated_at: Timestamp,
}

impl From<ConversationRecord> for Conversation {
    fn from(value: ConversationRecord) -> Self {
        Conversation {
            id: ConversationId::from(value.id),
            participant_one: UserId::from(value.participant_one),
            participant_two: UserId::from(value.participant_two),
            last_message: value.last_message_id.map(MessageId::from),
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    conversation_id: Uuid,
    sender_id: Uuid,
    content: String,
    created_at: Timestamp,
}

#[derive(Debug, FromRow)]
struct ReadRecord {
    message_id: Uuid,
    user_id: Uuid,
    read_at: Timestamp,
}

const CONVERSATION_COLUMNS: &str =
    "id, participant_one, participant_two, last_message_id, created_at, updated_at";

#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 为一批消息补齐已读集合
    async fn hydrate(&self, records: Vec<MessageRecord>) -> Result<Vec<Message>, RepositoryError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = records.iter().map(|record| record.id).collect();
        let reads = sqlx::query_as::<_, ReadRecord>(
            r#"SELECT message_id, user_id, read_at
            FROM message_reads
            WHERE message_id = ANY($1)
            ORDER BY read_at, user_id"#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut by_message: HashMap<Uuid, Vec<ReadReceipt>> = HashMap::new();
        for read in reads {
            by_message.entry(read.message_id).or_default().push(ReadReceipt {
                user_id: UserId::from(read.user_id),
                read_at: read.read_at,
            });
        }

        Ok(records
            .into_iter()
            .map(|record| Message {
                id: MessageId::from(record.id),
                conversation_id: ConversationId::from(record.conversation_id),
                sender_id: UserId::from(record.sender_id),
                content: record.content,
                created_at: record.created_at,
                read_by: by_message.remove(&record.id).unwrap_or_default(),
            })
            .collect())
    }

    async fn find_by_pair(
        &self,
        participant_one: UserId,
        participant_two: UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE participant_one = $1 AND participant_two = $2"
        ))
        .bind(Uuid::from(participant_one))
        .bind(Uuid::from(participant_two))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(record.map(Conversation::from))
    }

    async fn last_message(&self, id: Option<MessageId>) -> Result<Option<Message>, RepositoryError> {
        let Some(id) = id else {
            return Ok(None);
        };
        let record = sqlx::query_as::<_, MessageRecord>(
            r#"SELECT id, conversation_id, sender_id, content, created_at FROM messages WHERE id = $1"#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(self
            .hydrate(record.into_iter().collect())
            .await?
            .into_iter()
            .next())
    }
}

async fn lock_conversation(
    tx: &mut Transaction<'_, Postgres>,
    conversation_id: ConversationId,
) -> Result<(), RepositoryError> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM conversations WHERE id = $1 FOR UPDATE")
        .bind(Uuid::from(conversation_id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?
        .ok_or(RepositoryError::NotFound)?;
    Ok(())
}

#[async_trait]
impl ConversationRepository for PgConversationStore {
    async fn find_or_create(
        &self,
        a: UserId,
        b: UserId,
        now: Timestamp,
    ) -> Result<(Conversation, bool), RepositoryError> {
        let candidate = Conversation::new(ConversationId::generate(), a, b, now)
            .map_err(|err| RepositoryError::storage(err.to_string()))?;

        // 唯一约束保证并发创建只有一个成功，失败方读取已存在的会话
        let inserted = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"INSERT INTO conversations (id, participant_one, participant_two, last_message_id, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, $4, $4)
            ON CONFLICT (participant_one, participant_two) DO NOTHING
            RETURNING {CONVERSATION_COLUMNS}"#
        ))
        .bind(Uuid::from(candidate.id))
        .bind(Uuid::from(candidate.participant_one))
        .bind(Uuid::from(candidate.participant_two))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        if let Some(record) = inserted {
            return Ok((Conversation::from(record), true));
        }

        self.find_by_pair(candidate.participant_one, candidate.participant_two)
            .await?
            .map(|conversation| (conversation, false))
            .ok_or(RepositoryError::Conflict)
    }

    async fn find_by_id(&self, id: ConversationId) -> Result<Option<Conversation>, RepositoryError> {
        let record = sqlx::query_as::<_, ConversationRecord>(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(record.map(Conversation::from))
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<ConversationSummary>, RepositoryError> {
        let records = sqlx::query_as::<_, ConversationRecord>(&format!(
            r#"SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE participant_one = $1 OR participant_two = $1
            ORDER BY updated_at DESC, id"#
        ))
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let mut summaries = Vec::with_capacity(records.len());
        for record in records {
            let conversation = Conversation::from(record);
            let last_message = self.last_message(conversation.last_message).await?;
            let unread_count = self.unread_count(conversation.id, user_id).await?;
            summaries.push(ConversationSummary {
                conversation,
                last_message,
                unread_count,
            });
        }
        Ok(summaries)
    }

    async fn delete(&self, id: ConversationId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(Uuid::from(id))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PgConversationStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        at: Timestamp,
    ) -> Result<Message, RepositoryError> {
        let message = Message::new(MessageId::generate(), conversation_id, sender_id, content, at);
        let mut tx = self.pool.begin().await.map_err(map_sqlx_err)?;
        lock_conversation(&mut tx, conversation_id).await?;

        sqlx::query(
            r#"INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
            VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(Uuid::from(message.id))
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(sender_id))
        .bind(&message.content)
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        sqlx::query("INSERT INTO message_reads (message_id, user_id, read_at) VALUES ($1, $2, $3)")
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(sender_id))
            .bind(at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        // 晚到的旧消息不覆盖最后一条消息
        sqlx::query(
            "UPDATE conversations SET last_message_id = $2, updated_at = $3 WHERE id = $1 AND updated_at <= $3",
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(message.id))
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(message)
    }

    async fn list_page(
        &self,
        conversation_id: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<MessagePage, RepositoryError> {
        // 游标不存在时子查询为空，比较结果为 NULL，返回空页
        let records = sqlx::query_as::<_, MessageRecord>(
            r#"SELECT id, conversation_id, sender_id, content, created_at
            FROM messages
            WHERE conversation_id = $1
              AND ($2::uuid IS NULL
                   OR (created_at, id) < (SELECT created_at, id FROM messages WHERE id = $2))
            ORDER BY created_at DESC, id DESC
            LIMIT $3"#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(before.map(Uuid::from))
        .bind(i64::from(limit) + 1)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        let messages = self.hydrate(records).await?;
        Ok(MessagePage::from_overfetch(messages, limit as usize))
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO message_reads (message_id, user_id, read_at)
            SELECT id, $2, $3 FROM messages WHERE conversation_id = $1
            ON CONFLICT (message_id, user_id) DO NOTHING"#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<u64, RepositoryError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"SELECT COUNT(*)
            FROM messages m
            WHERE m.conversation_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM message_reads r WHERE r.message_id = m.id AND r.user_id = $2
              )"#,
        )
        .bind(Uuid::from(conversation_id))
        .bind(Uuid::from(user_id))
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl PresenceRepository for PgConversationStore {
    async fn record_presence(
        &self,
        user_id: UserId,
        status: PresenceStatus,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO users (id, status, last_seen)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET status = EXCLUDED.status, last_seen = EXCLUDED.last_seen"#,
        )
        .bind(Uuid::from(user_id))
        .bind(status.as_str())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }
}

/// 基于 friendships / blocks 表的社交关系查询
#[derive(Clone)]
pub struct PgSocialGraph {
    pool: PgPool,
}

impl PgSocialGraph {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn add_friendship(&self, a: UserId, b: UserId) -> Result<(), RepositoryError> {
        let (user_a, user_b) = Conversation::pair_key(a, b)
            .map_err(|err| RepositoryError::storage(err.to_string()))?;
        sqlx::query("INSERT INTO friendships (user_a, user_b) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(Uuid::from(user_a))
            .bind(Uuid::from(user_b))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    pub async fn block(&self, blocker: UserId, blocked: UserId) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO blocks (blocker_id, blocked_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
            .bind(Uuid::from(blocker))
            .bind(Uuid::from(blocked))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }
}

fn social_err(err: sqlx::Error) -> ApplicationError {
    ApplicationError::infrastructure_with_source("social graph query failed", err)
}

#[async_trait]
impl SocialGraph for PgSocialGraph {
    async fn can_message(&self, from: UserId, to: UserId) -> Result<bool, ApplicationError> {
        let blocked = sqlx::query_scalar::<_, bool>(
            r#"SELECT EXISTS (
                SELECT 1 FROM blocks
                WHERE (blocker_id = $1 AND blocked_id = $2)
                   OR (blocker_id = $2 AND blocked_id = $1)
            )"#,
        )
        .bind(Uuid::from(from))
        .bind(Uuid::from(to))
        .fetch_one(&self.pool)
        .await
        .map_err(social_err)?;
        Ok(!blocked)
    }

    async fn friends_of(&self, user_id: UserId) -> Result<Vec<UserId>, ApplicationError> {
        let friends = sqlx::query_scalar::<_, Uuid>(
            r#"SELECT CASE WHEN user_a = $1 THEN user_b ELSE user_a END
            FROM friendships
            WHERE user_a = $1 OR user_b = $1"#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(&self.pool)
        .await
        .map_err(social_err)?;
        Ok(friends.into_iter().map(UserId::from).collect())
    }
}

#[derive(Clone)]
pub struct PgStorage {
    pub pool: PgPool,
    pub conversation_store: Arc<PgConversationStore>,
    pub social_graph: Arc<PgSocialGraph>,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversation_store: Arc::new(PgConversationStore::new(pool.clone())),
            social_graph: Arc::new(PgSocialGraph::new(pool.clone())),
            pool,
        }
    }
}

pub async fn create_pg_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
