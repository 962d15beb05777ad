//! 基础设施层实现。
//!
//! 提供基于 PostgreSQL 的会话/消息存储与社交关系查询，实现应用层定义的接口。

pub mod builder;
pub mod migrations;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureConfig, InfrastructureError};
pub use migrations::MIGRATOR;
pub use repository::{create_pg_pool, PgConversationStore, PgSocialGraph, PgStorage};
