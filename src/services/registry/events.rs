use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use super::types::{HealthState, ServiceInstance};

/// 注册表变更事件
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered {
        instance: ServiceInstance,
    },
    Deregistered {
        instance: ServiceInstance,
    },
    /// TTL 到期被清理
    Expired {
        instance: ServiceInstance,
    },
    HealthChanged {
        service_name: String,
        instance_id: String,
        from: HealthState,
        to: HealthState,
    },
    MetadataUpdated {
        service_name: String,
        instance_id: String,
    },
}

impl RegistryEvent {
    pub fn instance_id(&self) -> &str {
        match self {
            RegistryEvent::Registered { instance }
            | RegistryEvent::Deregistered { instance }
            | RegistryEvent::Expired { instance } => &instance.id,
            RegistryEvent::HealthChanged { instance_id, .. }
            | RegistryEvent::MetadataUpdated { instance_id, .. } => instance_id,
        }
    }
}

/// 基于 Tokio broadcast 的注册表事件通道
#[derive(Debug, Clone)]
pub(crate) struct EventChannel {
    sender: broadcast::Sender<RegistryEvent>,
}

impl EventChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn publish(&self, event: RegistryEvent) {
        // 没有订阅者时发送失败是正常情况
        if self.sender.send(event).is_err() {
            tracing::trace!("No active subscribers for registry event");
        }
    }

    pub(crate) fn receiver(&self) -> broadcast::Receiver<RegistryEvent> {
        self.sender.subscribe()
    }

    /// 订阅事件流，跟不上时丢弃的事件会被跳过
    pub(crate) fn stream(&self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(err) => {
                tracing::warn!(error = %err, "Registry event subscriber lagged");
                None
            }
        })
    }
}
