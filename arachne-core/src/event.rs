//! 事件广播
//!
//! 同步的事件多播器，织入引擎用它发布生命周期事件
//! （类型匹配、类型转换、上下文创建、引擎关闭）

use std::any::Any;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

/// 事件 trait - 所有事件都必须实现此 trait
pub trait Event: Any + Send + Sync {
    /// 事件名称
    fn event_name(&self) -> &str;

    /// 事件时间戳
    fn timestamp(&self) -> SystemTime;

    /// 转换为 Any 引用，用于类型转换
    fn as_any(&self) -> &dyn Any;
}

/// 事件监听器 trait
pub trait EventListener: Send + Sync {
    /// 处理事件（同步）
    fn on_event(&self, event: Arc<dyn Event>);

    /// 监听器名称（用于日志）
    fn listener_name(&self) -> &str {
        "AnonymousListener"
    }

    /// 是否支持该事件类型（默认支持所有事件）
    fn supports_event(&self, event_name: &str) -> bool {
        let _ = event_name;
        true
    }
}

/// 事件多播器
///
/// 同步地将事件传播到所有注册的监听器。事件发布发生在织入的
/// 关键路径上，监听器的 panic 被隔离记录，不会传播到发布线程
pub struct EventMulticaster {
    /// 事件监听器列表
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventMulticaster {
    /// 创建新的多播器
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 添加监听器
    pub fn add_listener(&self, listener: Arc<dyn EventListener>) {
        tracing::debug!("Registering event listener: {}", listener.listener_name());
        self.listeners.write().push(listener);
    }

    /// 移除指定名称的监听器
    pub fn remove_listener(&self, listener_name: &str) {
        self.listeners
            .write()
            .retain(|l| l.listener_name() != listener_name);
    }

    /// 监听器数量
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// 广播事件到所有监听器
    pub fn multicast(&self, event: Arc<dyn Event>) {
        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();

        for listener in listeners {
            if !listener.supports_event(event.event_name()) {
                continue;
            }

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener.on_event(Arc::clone(&event));
            }));

            if result.is_err() {
                tracing::warn!(
                    "Event listener '{}' panicked while handling '{}'",
                    listener.listener_name(),
                    event.event_name()
                );
            }
        }
    }
}

impl Default for EventMulticaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestEvent {
        timestamp: SystemTime,
    }

    impl Event for TestEvent {
        fn event_name(&self) -> &str {
            "TestEvent"
        }

        fn timestamp(&self) -> SystemTime {
            self.timestamp
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl EventListener for CountingListener {
        fn on_event(&self, _event: Arc<dyn Event>) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn listener_name(&self) -> &str {
            "CountingListener"
        }
    }

    struct PanickingListener;

    impl EventListener for PanickingListener {
        fn on_event(&self, _event: Arc<dyn Event>) {
            panic!("listener failure");
        }

        fn listener_name(&self) -> &str {
            "PanickingListener"
        }
    }

    #[test]
    fn test_multicast_reaches_all_listeners() {
        let multicaster = EventMulticaster::new();
        let count = Arc::new(AtomicUsize::new(0));

        multicaster.add_listener(Arc::new(CountingListener {
            count: Arc::clone(&count),
        }));
        multicaster.add_listener(Arc::new(CountingListener {
            count: Arc::clone(&count),
        }));

        multicaster.multicast(Arc::new(TestEvent {
            timestamp: SystemTime::now(),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_listener_panic_is_isolated() {
        let multicaster = EventMulticaster::new();
        let count = Arc::new(AtomicUsize::new(0));

        multicaster.add_listener(Arc::new(PanickingListener));
        multicaster.add_listener(Arc::new(CountingListener {
            count: Arc::clone(&count),
        }));

        // PanickingListener 在前，但不应阻断后续监听器
        multicaster.multicast(Arc::new(TestEvent {
            timestamp: SystemTime::now(),
        }));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_listener() {
        let multicaster = EventMulticaster::new();
        multicaster.add_listener(Arc::new(PanickingListener));
        assert_eq!(multicaster.listener_count(), 1);

        multicaster.remove_listener("PanickingListener");
        assert_eq!(multicaster.listener_count(), 0);
    }
}
