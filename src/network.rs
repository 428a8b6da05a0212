// src/network.rs

use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Wifi,
    Cellular,
    Wired,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    Connected(LinkType),
    Disconnected,
}

impl NetworkStatus {
    pub fn is_connected(self) -> bool {
        matches!(self, NetworkStatus::Connected(_))
    }
}

/// 连通性信号发布器。宿主应用把操作系统可达性设施的回调桥接到
/// `publish`，引擎通过 `subscribe` 拿到 watch 接收端。
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: watch::Sender<NetworkStatus>,
}

impl NetworkMonitor {
    /// 初始状态默认按已连通处理，避免引擎在宿主桥接好之前空等。
    pub fn new() -> Self {
        Self::with_initial(NetworkStatus::Connected(LinkType::Unknown))
    }

    pub fn with_initial(status: NetworkStatus) -> Self {
        let (tx, _rx) = watch::channel(status);
        Self { tx }
    }

    /// 发布一次状态变化；与当前状态相同的重复发布会被吞掉，
    /// 订阅方只会在真正的迁移上被唤醒。
    pub fn publish(&self, status: NetworkStatus) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            info!("网络状态变化: {:?}", status);
        }
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_dedup() {
        let monitor = NetworkMonitor::new();
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();

        // 重复发布相同状态不应唤醒订阅方
        monitor.publish(NetworkStatus::Connected(LinkType::Unknown));
        assert!(!rx.has_changed().unwrap());

        monitor.publish(NetworkStatus::Disconnected);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Disconnected);
        assert!(!monitor.current().is_connected());
    }

    #[tokio::test]
    async fn test_link_type_transition_counts_as_change() {
        let monitor = NetworkMonitor::with_initial(NetworkStatus::Connected(LinkType::Wifi));
        let mut rx = monitor.subscribe();
        rx.mark_unchanged();

        monitor.publish(NetworkStatus::Connected(LinkType::Cellular));
        assert!(rx.has_changed().unwrap());
    }
}
