//! 用户实体
//!
//! 用户资料由账户系统维护，这里只关心在线状态和最后在线时间。

use serde::{Deserialize, Serialize};

use crate::entities::presence::PresenceStatus;
use crate::value_objects::{Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: Option<Timestamp>,
}
