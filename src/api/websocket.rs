use crate::api::AppState;
use crate::hub::Topic;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 客户端控制消息
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Ping,
}

/// 服务端控制消息（事件本身走 MonitorEvent 的线上格式）
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerReply {
    Subscribed { topic: String },
    Unsubscribed { topic: String },
    Error { message: String },
    Pong,
}

/// WebSocket 升级处理函数
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// 单连接主循环：Hub 事件下行与客户端命令上行在同一任务内复用
///
/// 连接退出（对端关闭、发送失败或 Hub 把慢客户端踢掉）即从
/// Hub 注销，订阅随之清除。
async fn handle_socket(socket: WebSocket, state: AppState) {
    let hub = state.monitor.hub().clone();
    let (client_id, mut events) = hub.register_client().await;
    info!("New WebSocket connection: {}", client_id);

    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Hub 已丢弃该客户端（队列溢出）
                    debug!("Event channel closed for {}", client_id);
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if ws_tx.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to serialize event: {}", e),
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&hub, client_id, &text).await;
                        if let Ok(json) = serde_json::to_string(&reply) {
                            if ws_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if ws_tx.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket connection closed: {}", client_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for connection {}: {}", client_id, e);
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(client_id).await;
}

async fn handle_command(hub: &crate::hub::Hub, client_id: uuid::Uuid, text: &str) -> ServerReply {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(c) => c,
        Err(e) => {
            return ServerReply::Error {
                message: format!("Invalid message: {}", e),
            }
        }
    };

    match command {
        ClientCommand::Subscribe { topic } => match topic.parse::<Topic>() {
            Ok(t) => {
                hub.subscribe(client_id, t).await;
                ServerReply::Subscribed { topic }
            }
            Err(e) => ServerReply::Error { message: e },
        },
        ClientCommand::Unsubscribe { topic } => match topic.parse::<Topic>() {
            Ok(t) => {
                hub.unsubscribe(client_id, t).await;
                ServerReply::Unsubscribed { topic }
            }
            Err(e) => ServerReply::Error { message: e },
        },
        ClientCommand::Ping => ServerReply::Pong,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_parsing() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"subscribe","topic":"metrics"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Subscribe { ref topic } if topic == "metrics"));

        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(cmd, ClientCommand::Ping));
    }

    #[test]
    fn test_server_reply_wire_format() {
        let reply = ServerReply::Subscribed {
            topic: "discovery".to_string(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["topic"], "discovery");
    }
}
