//! 领域实体定义

pub mod conversation;
pub mod message;
pub mod presence;
pub mod user;

pub use conversation::{Conversation, ConversationSummary};
pub use message::{Message, MessageContent, MessagePage, ReadReceipt, MAX_CONTENT_CHARS};
pub use presence::PresenceStatus;
pub use user::User;
