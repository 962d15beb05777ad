//! 好友与屏蔽关系的外部协作方

use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SocialGraph: Send + Sync {
    /// `from` 当前是否可以给 `to` 发消息。任一方向存在屏蔽时为 false。
    async fn can_message(&self, from: UserId, to: UserId) -> Result<bool, ApplicationError>;

    /// 用户当前的好友列表
    async fn friends_of(&self, user_id: UserId) -> Result<Vec<UserId>, ApplicationError>;
}
