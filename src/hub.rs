use crate::monitor::MonitorEvent;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 订阅主题
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// 扫描进度快照
    Discovery,
    /// 指标与状态事件（带 miner_id 标签）
    Metrics,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Discovery => "discovery",
            Topic::Metrics => "metrics",
        }
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Topic::Discovery),
            "metrics" => Ok(Topic::Metrics),
            other => Err(format!("Unknown topic: {}", other)),
        }
    }
}

/// 单个客户端连接：有界发送队列 + 订阅集合
struct HubClient {
    sender: mpsc::Sender<MonitorEvent>,
    subscriptions: HashSet<Topic>,
}

/// 实时推送中心 - 主题化发布/订阅
///
/// publish 对慢客户端永不阻塞：队列满即断开该客户端，由其重连后
/// 重新订阅。订阅表按整表锁管理，publish 与 subscribe 并发安全。
pub struct Hub {
    clients: Arc<RwLock<HashMap<Uuid, HubClient>>>,
    queue_capacity: usize,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity,
        }
    }

    /// 注册新连接，返回连接 ID 与事件接收端
    pub async fn register_client(&self) -> (Uuid, mpsc::Receiver<MonitorEvent>) {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.queue_capacity);

        self.clients.write().await.insert(
            id,
            HubClient {
                sender,
                subscriptions: HashSet::new(),
            },
        );

        info!("Hub client registered: {}", id);
        (id, receiver)
    }

    pub async fn subscribe(&self, client_id: Uuid, topic: Topic) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.subscriptions.insert(topic);
            debug!("Client {} subscribed to {}", client_id, topic.as_str());
        }
    }

    pub async fn unsubscribe(&self, client_id: Uuid, topic: Topic) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.subscriptions.remove(&topic);
            debug!("Client {} unsubscribed from {}", client_id, topic.as_str());
        }
    }

    /// 断开连接并清除其全部订阅
    pub async fn disconnect(&self, client_id: Uuid) {
        if self.clients.write().await.remove(&client_id).is_some() {
            info!("Hub client disconnected: {}", client_id);
        }
    }

    /// 发布事件到主题的所有订阅者
    ///
    /// try_send 失败（队列满或接收端已关闭）即踢掉该客户端，
    /// 不影响其余订阅者。
    pub async fn publish(&self, topic: Topic, event: MonitorEvent) {
        let mut dropped = Vec::new();

        {
            let clients = self.clients.read().await;
            for (id, client) in clients.iter() {
                if !client.subscriptions.contains(&topic) {
                    continue;
                }
                if client.sender.try_send(event.clone()).is_err() {
                    dropped.push(*id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut clients = self.clients.write().await;
            for id in dropped {
                clients.remove(&id);
                warn!("Hub client {} dropped: outbound queue overflow", id);
            }
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorEvent;
    use chrono::Utc;

    fn status_event() -> MonitorEvent {
        MonitorEvent::StatusChange {
            miner_id: Uuid::new_v4(),
            status: crate::registry::MinerState::Offline,
            last_seen: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.register_client().await;
        let (b, mut rx_b) = hub.register_client().await;
        hub.subscribe(a, Topic::Metrics).await;
        hub.subscribe(b, Topic::Metrics).await;

        hub.publish(Topic::Metrics, status_event()).await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribed_client_receives_nothing() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.register_client().await;
        hub.subscribe(a, Topic::Discovery).await;

        hub.publish(Topic::Metrics, status_event()).await;

        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_dropped_others_survive() {
        let hub = Hub::new(1);
        let (slow, _rx_slow) = hub.register_client().await;
        let (fast, mut rx_fast) = hub.register_client().await;
        hub.subscribe(slow, Topic::Metrics).await;
        hub.subscribe(fast, Topic::Metrics).await;

        // 慢客户端不消费：第一条填满其队列
        hub.publish(Topic::Metrics, status_event()).await;
        assert!(rx_fast.recv().await.is_some());

        // 第二条在慢客户端上溢出，只有它被丢弃
        hub.publish(Topic::Metrics, status_event()).await;
        assert_eq!(hub.client_count().await, 1);
        assert!(rx_fast.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriptions() {
        let hub = Hub::new(8);
        let (a, _rx) = hub.register_client().await;
        hub.subscribe(a, Topic::Metrics).await;
        hub.disconnect(a).await;
        assert_eq!(hub.client_count().await, 0);
    }
}
