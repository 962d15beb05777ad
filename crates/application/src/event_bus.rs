//! 进程内领域事件总线

use std::sync::Arc;

use async_trait::async_trait;
use domain::DomainEvent;
use parking_lot::RwLock;

use crate::error::ApplicationError;

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<(), ApplicationError>;

    fn can_handle(&self, event_type: &str) -> bool;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// 依次交给所有能处理该事件的订阅者。单个订阅者失败只记录日志。
    async fn publish(&self, event: DomainEvent);

    fn subscribe(&self, handler: Arc<dyn EventHandler>);
}

#[derive(Default)]
pub struct LocalEventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: DomainEvent) {
        let name = event.name();
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|handler| handler.can_handle(name))
            .cloned()
            .collect();

        if handlers.is_empty() {
            tracing::debug!(event = name, "事件没有订阅者");
            return;
        }

        for handler in handlers {
            if let Err(err) = handler.handle(&event).await {
                tracing::warn!(event = name, error = %err, "事件处理失败");
            }
        }
    }

    fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().push(handler);
    }
}
