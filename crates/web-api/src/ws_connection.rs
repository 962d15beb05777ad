use std::time::Duration;

use application::{ConnectionSession, ServerEvent};
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use tokio::sync::mpsc;

/// 单条 WebSocket 连接
///
/// 持有会话守卫，负责：
/// - 把出站事件写成 JSON 文本帧
/// - 把入站文本帧交给会话处理
/// - 心跳与空闲超时
///
/// 主循环结束后总是调用 `disconnect`，在线状态只清理一次。
pub struct WebSocketConnection {
    socket: WebSocket,
    session: ConnectionSession,
    idle_timeout: Duration,
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Vec<u8>),
}

impl WebSocketConnection {
    pub fn new(socket: WebSocket, session: ConnectionSession, idle_timeout: Duration) -> Self {
        Self {
            socket,
            session,
            idle_timeout,
        }
    }

    pub async fn run(self) {
        let Self {
            socket,
            mut session,
            idle_timeout,
        } = self;
        let user_id = session.user_id();
        let connection_id = session.id();

        let Some(mut outbound) = session.take_outbound() else {
            tracing::warn!(connection_id = %connection_id, "出站队列已被取走，关闭连接");
            session.disconnect().await;
            return;
        };

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        // 发送任务：所有写操作都经过这里
        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendText(text) => WsMessage::Text(text.into()),
                        WsCommand::SendPong(data) => WsMessage::Pong(data.into()),
                    },
                    event = outbound.recv() => match event {
                        Some(event) => match encode(&event) {
                            Some(text) => WsMessage::Text(text.into()),
                            None => continue,
                        },
                        // 路由已摘除该连接
                        None => break,
                    },
                };
                if sender.send(frame).await.is_err() {
                    tracing::debug!("写入 WebSocket 失败");
                    break;
                }
            }
            let _ = sender.close().await;
        });

        tokio::select! {
            _ = Self::receive_loop(&session, &mut incoming, &cmd_tx, idle_timeout) => {}
            _ = &mut send_task => {
                tracing::debug!(connection_id = %connection_id, "发送任务先行结束");
            }
        }

        session.disconnect().await;
        send_task.abort();
        tracing::info!(user_id = %user_id, connection_id = %connection_id, "WebSocket 连接已关闭");
    }

    async fn receive_loop(
        session: &ConnectionSession,
        incoming: &mut SplitStream<WebSocket>,
        cmd_tx: &mpsc::Sender<WsCommand>,
        idle_timeout: Duration,
    ) {
        loop {
            let message = match tokio::time::timeout(idle_timeout, incoming.next()).await {
                Err(_) => {
                    tracing::info!(connection_id = %session.id(), "连接空闲超时");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(err))) => {
                    tracing::debug!(connection_id = %session.id(), error = %err, "读取 WebSocket 失败");
                    return;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                WsMessage::Close(_) => {
                    tracing::debug!(connection_id = %session.id(), "收到关闭帧");
                    return;
                }
                WsMessage::Ping(data) => {
                    if cmd_tx.send(WsCommand::SendPong(data.to_vec())).await.is_err() {
                        return;
                    }
                }
                WsMessage::Pong(_) => {}
                WsMessage::Text(text) => {
                    if let Err(err) = session.handle_text(text.as_str()).await {
                        // 失败已经通知到发起连接，这里只记录
                        tracing::debug!(connection_id = %session.id(), error = %err, "客户端命令处理失败");
                    }
                }
                WsMessage::Binary(_) => {
                    tracing::debug!(connection_id = %session.id(), "忽略二进制帧");
                }
            }
        }
    }
}

fn encode(event: &ServerEvent) -> Option<String> {
    match event.to_json() {
        Ok(json) => Some(json),
        Err(err) => {
            tracing::warn!(event = event.name(), error = %err, "事件序列化失败");
            None
        }
    }
}
