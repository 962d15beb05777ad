//! 主应用程序入口
//!
//! 加载配置、组装依赖并启动 Axum 服务。

use std::{sync::Arc, time::Duration};

use application::{
    ChannelRouter, Clock, ConnectionGateway, ConversationRepository, EventBus, FanoutDependencies,
    FanoutEngine, GatewayDependencies, LocalEventBus, MemoryConversationStore, MemorySocialGraph,
    MessageRepository, PresenceRegistry, PresenceRepository, SocialGraph, SystemClock,
};
use config::AppConfig;
use infrastructure::{Infrastructure, InfrastructureConfig};
use tracing_subscriber::EnvFilter;
use web_api::{router_with_cors, AppState, JwtService};

struct Storage {
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    presence: Arc<dyn PresenceRepository>,
    social: Arc<dyn SocialGraph>,
}

async fn build_storage(config: &AppConfig) -> anyhow::Result<Storage> {
    match &config.database.url {
        Some(url) => {
            let infrastructure = Infrastructure::connect(InfrastructureConfig {
                database_url: url.clone(),
                max_connections: config.database.max_connections,
            })
            .await?;
            let storage = infrastructure.storage;
            Ok(Storage {
                conversations: storage.conversation_store.clone(),
                messages: storage.conversation_store.clone(),
                presence: storage.conversation_store.clone(),
                social: storage.social_graph.clone(),
            })
        }
        None => {
            tracing::warn!("未配置数据库，使用内存存储，重启后数据会丢失");
            let store = Arc::new(MemoryConversationStore::new());
            Ok(Storage {
                conversations: store.clone(),
                messages: store.clone(),
                presence: store,
                social: Arc::new(MemorySocialGraph::new()),
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let storage = build_storage(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let presence = Arc::new(PresenceRegistry::new());
    let channels = Arc::new(ChannelRouter::new());

    let engine = Arc::new(FanoutEngine::new(FanoutDependencies {
        conversation_repository: storage.conversations,
        message_repository: storage.messages,
        presence_repository: storage.presence,
        social_graph: storage.social,
        presence: presence.clone(),
        router: channels.clone(),
        clock: clock.clone(),
    }));

    // 扇出引擎订阅领域事件
    let events: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    events.subscribe(engine.clone());

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    let gateway = ConnectionGateway::new(GatewayDependencies {
        verifier: jwt_service.clone(),
        presence,
        router: channels,
        engine: engine.clone(),
        events: events.clone(),
        clock,
    });

    let state = AppState::new(
        engine,
        gateway,
        events,
        jwt_service,
        Duration::from_secs(config.gateway.idle_timeout_secs),
    )
    .with_internal_token(config.server.internal_token.clone());
    let app = router_with_cors(state, &config.server.cors_origins);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(address = %address, "聊天服务已启动");
    axum::serve(listener, app).await?;

    Ok(())
}
