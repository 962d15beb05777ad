use async_trait::async_trait;
use domain::UserId;

use crate::error::ApplicationError;

/// 把连接握手携带的凭证解析为用户身份
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, ApplicationError>;
}
