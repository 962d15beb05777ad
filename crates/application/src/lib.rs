//! 应用层实现。
//!
//! 在线状态注册表、频道路由、扇出引擎与连接网关，以及对存储、
//! 社交关系、身份校验等外部协作方的抽象。

pub mod channels;
pub mod clock;
pub mod error;
pub mod event_bus;
pub mod fanout;
pub mod gateway;
pub mod identity;
pub mod memory;
pub mod optimistic;
pub mod presence;
pub mod protocol;
pub mod repository;
pub mod social;

pub use channels::{ChannelRouter, OutboundReceiver, OutboundSender};
pub use clock::{Clock, SystemClock};
pub use error::{ApplicationError, ErrorKind};
pub use event_bus::{EventBus, EventHandler, LocalEventBus};
pub use fanout::{FanoutDependencies, FanoutEngine, SendMessageRequest, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use gateway::{ConnectionGateway, ConnectionSession, GatewayDependencies};
pub use identity::IdentityVerifier;
pub use memory::{MemoryConversationStore, MemorySocialGraph};
pub use optimistic::{ConversationTimeline, DeliveryStatus, TimelineEntry};
pub use presence::{PresenceRegistry, PresenceTransition};
pub use protocol::{parse_command, ClientCommand, MalformedCommand, ServerEvent};
pub use repository::{ConversationRepository, MessageRepository, PresenceRepository};
pub use social::SocialGraph;
