use std::{sync::Arc, time::Duration};

use application::{ConnectionGateway, EventBus, FanoutEngine};

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<FanoutEngine>,
    pub gateway: ConnectionGateway,
    /// 外部协作方（好友服务等）发布领域事件的入口
    pub events: Arc<dyn EventBus>,
    pub jwt_service: Arc<JwtService>,
    pub idle_timeout: Duration,
    pub internal_token: Option<String>,
}

impl AppState {
    pub fn new(
        engine: Arc<FanoutEngine>,
        gateway: ConnectionGateway,
        events: Arc<dyn EventBus>,
        jwt_service: Arc<JwtService>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            gateway,
            events,
            jwt_service,
            idle_timeout,
            internal_token: None,
        }
    }

    pub fn with_internal_token(mut self, token: Option<String>) -> Self {
        self.internal_token = token;
        self
    }
}
