//! 双人实时聊天核心领域模型
//!
//! 包含用户、会话、消息等核心实体，以及在线状态和领域事件定义。

pub mod entities;
pub mod errors;
pub mod events;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use value_objects::*;
