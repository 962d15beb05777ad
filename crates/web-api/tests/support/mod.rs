#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use application::{
    ChannelRouter, Clock, ConnectionGateway, EventBus, FanoutDependencies, FanoutEngine,
    GatewayDependencies, LocalEventBus, MemoryConversationStore, MemorySocialGraph,
    PresenceRegistry, SystemClock,
};
use domain::UserId;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use web_api::{router, AppState, JwtConfig, JwtService};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const INTERNAL_TOKEN: &str = "integration-internal-token";

/// 使用内存存储启动的完整服务
pub struct TestApp {
    pub base_http: String,
    pub base_ws: String,
    pub jwt: Arc<JwtService>,
    pub events: Arc<dyn EventBus>,
    pub social: Arc<MemorySocialGraph>,
    pub store: Arc<MemoryConversationStore>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let store = Arc::new(MemoryConversationStore::new());
        let social = Arc::new(MemorySocialGraph::new());
        let presence = Arc::new(PresenceRegistry::new());
        let channels = Arc::new(ChannelRouter::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let engine = Arc::new(FanoutEngine::new(FanoutDependencies {
            conversation_repository: store.clone(),
            message_repository: store.clone(),
            presence_repository: store.clone(),
            social_graph: social.clone(),
            presence: presence.clone(),
            router: channels.clone(),
            clock: clock.clone(),
        }));

        let events: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        events.subscribe(engine.clone());

        let jwt = Arc::new(JwtService::new(JwtConfig {
            secret: "integration-test-secret-with-32-plus-chars".into(),
            expiration_hours: 1,
        }));

        let gateway = ConnectionGateway::new(GatewayDependencies {
            verifier: jwt.clone(),
            presence,
            router: channels,
            engine: engine.clone(),
            events: events.clone(),
            clock,
        });

        let state = AppState::new(engine, gateway, events.clone(), jwt.clone(), Duration::from_secs(30))
            .with_internal_token(Some(INTERNAL_TOKEN.to_string()));
        let app = router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // allow server to start
        sleep(Duration::from_millis(50)).await;

        Self {
            base_http: format!("http://{addr}"),
            base_ws: format!("ws://{addr}"),
            jwt,
            events,
            social,
            store,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn token(&self, user: UserId) -> String {
        self.jwt.generate_token(user).expect("token")
    }

    pub async fn connect(&self, user: UserId) -> Socket {
        let url = format!("{}/api/v1/ws?token={}", self.base_ws, self.token(user));
        let (socket, _) = connect_async(url).await.expect("ws connect");
        socket
    }

    /// 通过 HTTP 打开会话，返回会话 ID 字符串
    pub async fn open_conversation(&self, initiator: UserId, peer: UserId) -> String {
        let response = reqwest::Client::new()
            .post(format!("{}/api/v1/conversations", self.base_http))
            .bearer_auth(self.token(initiator))
            .json(&serde_json::json!({ "peerId": peer.to_string() }))
            .send()
            .await
            .expect("open conversation");
        assert!(response.status().is_success(), "status {}", response.status());
        let body: Value = response.json().await.expect("conversation json");
        body["id"].as_str().expect("conversation id").to_string()
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub async fn send(socket: &mut Socket, event: &str, data: Value) {
    let frame = serde_json::json!({ "event": event, "data": data });
    socket
        .send(TungsteniteMessage::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// 跳过其他事件，等待第一个满足条件的指定事件
pub async fn expect_event<F>(socket: &mut Socket, event: &str, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            let frame = socket.next().await.expect("socket closed").expect("frame");
            let TungsteniteMessage::Text(text) = frame else {
                continue;
            };
            let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
            if value["event"] == event && predicate(&value["data"]) {
                return value["data"].clone();
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {event}"))
}

/// 断言一段时间内没有收到指定事件
pub async fn expect_silence(socket: &mut Socket, event: &str, wait: Duration) {
    let result = timeout(wait, async {
        loop {
            match socket.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => {
                    let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                    if value["event"] == event {
                        return value;
                    }
                }
                Some(Ok(_)) => continue,
                _ => return Value::Null,
            }
        }
    })
    .await;
    if let Ok(value) = result {
        assert!(value.is_null(), "unexpected {event}: {value}");
    }
}

/// 加入会话频道并等待服务端处理
pub async fn join(socket: &mut Socket, conversation_id: &str) {
    send(socket, "join_conversation", serde_json::json!({ "conversationId": conversation_id })).await;
    sleep(Duration::from_millis(50)).await;
}
