//! 客户端乐观发送
//!
//! 发送时先在时间线上放一条待确认消息，收到带同一临时 ID 的
//! `new_message` 后原地替换为服务器确认的消息，收到 `send_message_error`
//! 或超时则标记为失败。失败的消息保留在时间线上，可以重发或丢弃。
//! 重发后旧临时 ID 的迟到确认仍落在同一条目上，条目只确认一次。

use chrono::Duration;
use domain::{ConversationId, Message, MessageId, ReadReceipt, Timestamp, UserId};
use uuid::Uuid;

use crate::protocol::{ClientCommand, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub temp_id: Option<String>,
    /// 重发前用过的临时 ID
    pub previous_temp_ids: Vec<String>,
    pub message_id: Option<MessageId>,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: Timestamp,
    pub read_by: Vec<ReadReceipt>,
    pub status: DeliveryStatus,
    pub error: Option<String>,
}

impl TimelineEntry {
    fn confirmed(message: &Message, temp_id: Option<String>, previous_temp_ids: Vec<String>) -> Self {
        Self {
            temp_id,
            previous_temp_ids,
            message_id: Some(message.id),
            sender_id: message.sender_id,
            content: message.content.clone(),
            created_at: message.created_at,
            read_by: message.read_by.clone(),
            status: DeliveryStatus::Sent,
            error: None,
        }
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|receipt| receipt.user_id == user_id)
    }
}

/// 单个会话在客户端上的消息时间线
#[derive(Debug, Clone)]
pub struct ConversationTimeline {
    conversation_id: ConversationId,
    user_id: UserId,
    entries: Vec<TimelineEntry>,
}

impl ConversationTimeline {
    pub fn new(conversation_id: ConversationId, user_id: UserId) -> Self {
        Self {
            conversation_id,
            user_id,
            entries: Vec::new(),
        }
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn find(&self, temp_id: &str) -> Option<&TimelineEntry> {
        self.entries
            .iter()
            .find(|entry| entry.temp_id.as_deref() == Some(temp_id))
    }

    fn position(&self, temp_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.temp_id.as_deref() == Some(temp_id))
    }

    fn position_any(&self, temp_id: &str) -> Option<usize> {
        self.entries.iter().position(|entry| {
            entry.temp_id.as_deref() == Some(temp_id)
                || entry.previous_temp_ids.iter().any(|previous| previous == temp_id)
        })
    }

    /// 追加待确认消息，返回需要发给服务器的命令
    pub fn begin_send(&mut self, content: impl Into<String>, now: Timestamp) -> ClientCommand {
        let content = content.into();
        let temp_id = Uuid::new_v4().to_string();
        self.entries.push(TimelineEntry {
            temp_id: Some(temp_id.clone()),
            previous_temp_ids: Vec::new(),
            message_id: None,
            sender_id: self.user_id,
            content: content.clone(),
            created_at: now,
            read_by: Vec::new(),
            status: DeliveryStatus::Pending,
            error: None,
        });
        ClientCommand::SendMessage {
            conversation_id: self.conversation_id,
            content,
            temp_id: Some(temp_id),
        }
    }

    /// 应用一条服务器事件，时间线有变化时返回 true
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::NewMessage { message, temp_id } => {
                if message.conversation_id != self.conversation_id {
                    return false;
                }
                self.confirm(message, temp_id.as_deref())
            }
            ServerEvent::SendMessageError {
                temp_id: Some(temp_id),
                message,
                ..
            } => match self.position(temp_id) {
                Some(index) if self.entries[index].status == DeliveryStatus::Pending => {
                    let entry = &mut self.entries[index];
                    entry.status = DeliveryStatus::Failed;
                    entry.error = Some(message.clone());
                    true
                }
                _ => false,
            },
            ServerEvent::MessagesRead {
                conversation_id,
                user_id,
                read_at,
            } if *conversation_id == self.conversation_id => {
                let mut changed = false;
                for entry in self.entries.iter_mut().filter(|entry| {
                    entry.message_id.is_some()
                        && entry.created_at <= *read_at
                        && !entry.is_read_by(*user_id)
                }) {
                    entry.read_by.push(ReadReceipt {
                        user_id: *user_id,
                        read_at: *read_at,
                    });
                    changed = true;
                }
                changed
            }
            _ => false,
        }
    }

    fn confirm(&mut self, message: &Message, temp_id: Option<&str>) -> bool {
        if self
            .entries
            .iter()
            .any(|entry| entry.message_id == Some(message.id))
        {
            return false;
        }

        match temp_id.and_then(|temp_id| self.position_any(temp_id)) {
            // 另一次发送已经确认过这条消息
            Some(index) if self.entries[index].status == DeliveryStatus::Sent => false,
            Some(index) => {
                let entry = &self.entries[index];
                let confirmed =
                    TimelineEntry::confirmed(message, entry.temp_id.clone(), entry.previous_temp_ids.clone());
                self.entries[index] = confirmed;
                true
            }
            // 其他设备或对方发来的消息
            None => {
                self.entries.push(TimelineEntry::confirmed(message, None, Vec::new()));
                true
            }
        }
    }

    /// 把超时仍未确认的消息标记为失败，返回数量
    pub fn expire_pending(&mut self, now: Timestamp, timeout: Duration) -> usize {
        let mut expired = 0;
        for entry in self.entries.iter_mut().filter(|entry| {
            entry.status == DeliveryStatus::Pending && now - entry.created_at >= timeout
        }) {
            entry.status = DeliveryStatus::Failed;
            entry.error = Some("timed out".to_string());
            expired += 1;
        }
        expired
    }

    /// 失败的消息换一个临时 ID 重新进入待确认状态
    pub fn retry(&mut self, temp_id: &str, now: Timestamp) -> Option<ClientCommand> {
        let index = self.position(temp_id)?;
        let entry = &mut self.entries[index];
        if entry.status != DeliveryStatus::Failed {
            return None;
        }

        let new_temp_id = Uuid::new_v4().to_string();
        if let Some(previous) = entry.temp_id.replace(new_temp_id.clone()) {
            entry.previous_temp_ids.push(previous);
        }
        entry.status = DeliveryStatus::Pending;
        entry.error = None;
        entry.created_at = now;
        Some(ClientCommand::SendMessage {
            conversation_id: self.conversation_id,
            content: entry.content.clone(),
            temp_id: Some(new_temp_id),
        })
    }

    pub fn discard(&mut self, temp_id: &str) -> bool {
        match self.position(temp_id) {
            Some(index) if self.entries[index].status == DeliveryStatus::Failed => {
                self.entries.remove(index);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::MessageContent;

    fn temp_id_of(command: &ClientCommand) -> String {
        match command {
            ClientCommand::SendMessage {
                temp_id: Some(temp_id),
                ..
            } => temp_id.clone(),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    fn server_message(conversation_id: ConversationId, sender: UserId, text: &str) -> Message {
        Message::new(
            MessageId::generate(),
            conversation_id,
            sender,
            MessageContent::new(text).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn confirmation_replaces_pending_entry_in_place() {
        let (conversation, me) = (ConversationId::generate(), UserId::generate());
        let mut timeline = ConversationTimeline::new(conversation, me);
        let first = timeline.begin_send("one", Utc::now());
        let _second = timeline.begin_send("two", Utc::now());
        let temp_id = temp_id_of(&first);

        let message = server_message(conversation, me, "one");
        assert!(timeline.apply(&ServerEvent::new_message(message.clone(), Some(temp_id.clone()))));

        let entries = timeline.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, DeliveryStatus::Sent);
        assert_eq!(entries[0].message_id, Some(message.id));
        assert_eq!(entries[1].status, DeliveryStatus::Pending);

        // 重复确认不改变时间线
        assert!(!timeline.apply(&ServerEvent::new_message(message, Some(temp_id))));
    }

    #[test]
    fn error_marks_entry_failed_and_keeps_it_visible() {
        let (conversation, me) = (ConversationId::generate(), UserId::generate());
        let mut timeline = ConversationTimeline::new(conversation, me);
        let temp_id = temp_id_of(&timeline.begin_send("hey", Utc::now()));

        assert!(timeline.apply(&ServerEvent::SendMessageError {
            temp_id: Some(temp_id.clone()),
            conversation_id: Some(conversation),
            message: "cannot message this user".into(),
            code: "FORBIDDEN".into(),
        }));

        let entry = timeline.find(&temp_id).unwrap();
        assert_eq!(entry.status, DeliveryStatus::Failed);
        assert_eq!(entry.error.as_deref(), Some("cannot message this user"));
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn peer_messages_are_appended_once() {
        let (conversation, me, peer) = (
            ConversationId::generate(),
            UserId::generate(),
            UserId::generate(),
        );
        let mut timeline = ConversationTimeline::new(conversation, me);
        let message = server_message(conversation, peer, "hi");

        assert!(timeline.apply(&ServerEvent::new_message(message.clone(), None)));
        assert!(!timeline.apply(&ServerEvent::new_message(message, None)));
        assert!(!timeline.apply(&ServerEvent::new_message(
            server_message(ConversationId::generate(), peer, "elsewhere"),
            None
        )));
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn expired_entries_can_be_retried_or_discarded() {
        let (conversation, me) = (ConversationId::generate(), UserId::generate());
        let mut timeline = ConversationTimeline::new(conversation, me);
        let start = Utc::now();
        let first = temp_id_of(&timeline.begin_send("one", start));
        let second = temp_id_of(&timeline.begin_send("two", start + Duration::seconds(20)));

        assert_eq!(timeline.expire_pending(start + Duration::seconds(15), Duration::seconds(10)), 1);
        assert_eq!(timeline.find(&first).unwrap().status, DeliveryStatus::Failed);
        assert_eq!(timeline.find(&second).unwrap().status, DeliveryStatus::Pending);

        // 仍在等待的消息不能重发
        assert!(timeline.retry(&second, start).is_none());

        let command = timeline.retry(&first, start + Duration::seconds(30)).unwrap();
        let new_temp_id = temp_id_of(&command);
        assert_ne!(new_temp_id, first);
        assert!(timeline.find(&first).is_none());
        assert_eq!(timeline.find(&new_temp_id).unwrap().status, DeliveryStatus::Pending);

        timeline.apply(&ServerEvent::SendMessageError {
            temp_id: Some(new_temp_id.clone()),
            conversation_id: Some(conversation),
            message: "internal error".into(),
            code: "INTERNAL".into(),
        });
        assert!(timeline.discard(&new_temp_id));
        assert!(!timeline.discard(&second));
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn late_confirmation_after_retry_settles_the_same_entry() {
        let (conversation, me) = (ConversationId::generate(), UserId::generate());
        let mut timeline = ConversationTimeline::new(conversation, me);
        let start = Utc::now();
        let original = temp_id_of(&timeline.begin_send("slow", start));
        timeline.expire_pending(start + Duration::seconds(15), Duration::seconds(10));
        let retried = temp_id_of(&timeline.retry(&original, start + Duration::seconds(16)).unwrap());

        // 第一次发送其实已经成功，确认晚到
        let first = server_message(conversation, me, "slow");
        assert!(timeline.apply(&ServerEvent::new_message(first.clone(), Some(original.clone()))));
        assert_eq!(timeline.entries().len(), 1);
        let entry = timeline.find(&retried).unwrap();
        assert_eq!(entry.status, DeliveryStatus::Sent);
        assert_eq!(entry.message_id, Some(first.id));

        // 重发的确认不再追加
        let second = server_message(conversation, me, "slow");
        assert!(!timeline.apply(&ServerEvent::new_message(second, Some(retried))));
        assert!(!timeline.apply(&ServerEvent::new_message(first, Some(original))));
        assert_eq!(timeline.entries().len(), 1);
    }

    #[test]
    fn stale_error_does_not_fail_the_retry() {
        let (conversation, me) = (ConversationId::generate(), UserId::generate());
        let mut timeline = ConversationTimeline::new(conversation, me);
        let start = Utc::now();
        let original = temp_id_of(&timeline.begin_send("again", start));
        timeline.expire_pending(start + Duration::seconds(15), Duration::seconds(10));
        let retried = temp_id_of(&timeline.retry(&original, start + Duration::seconds(16)).unwrap());

        assert!(!timeline.apply(&ServerEvent::SendMessageError {
            temp_id: Some(original),
            conversation_id: Some(conversation),
            message: "internal error".into(),
            code: "INTERNAL".into(),
        }));
        assert_eq!(timeline.find(&retried).unwrap().status, DeliveryStatus::Pending);
    }

    #[test]
    fn read_receipts_update_confirmed_messages() {
        let (conversation, me, peer) = (
            ConversationId::generate(),
            UserId::generate(),
            UserId::generate(),
        );
        let mut timeline = ConversationTimeline::new(conversation, me);
        let temp_id = temp_id_of(&timeline.begin_send("hello", Utc::now()));
        let message = server_message(conversation, me, "hello");
        timeline.apply(&ServerEvent::new_message(message.clone(), Some(temp_id)));
        timeline.begin_send("still pending", Utc::now());

        let read_at = message.created_at + Duration::seconds(1);
        let event = ServerEvent::MessagesRead {
            conversation_id: conversation,
            user_id: peer,
            read_at,
        };
        assert!(timeline.apply(&event));
        assert!(timeline.entries()[0].is_read_by(peer));
        assert!(!timeline.entries()[1].is_read_by(peer));
        assert!(!timeline.apply(&event));
    }
}
