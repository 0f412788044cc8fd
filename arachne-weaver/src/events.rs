//! 织入生命周期事件
//!
//! 通过 arachne-core 的同步多播器发布，供宿主侧做观测或联动

use std::any::Any;
use std::time::SystemTime;

use arachne_core::Event;

/// 类型匹配成功事件
#[derive(Debug, Clone)]
pub struct TypeMatchedEvent {
    /// 类型名
    pub type_name: String,
    /// 目标类加载器名
    pub loader_name: String,
    /// 匹配到通知链的方法数
    pub matched_methods: usize,
    pub timestamp: SystemTime,
}

impl TypeMatchedEvent {
    pub fn new(type_name: String, loader_name: String, matched_methods: usize) -> Self {
        Self {
            type_name,
            loader_name,
            matched_methods,
            timestamp: SystemTime::now(),
        }
    }
}

impl Event for TypeMatchedEvent {
    fn event_name(&self) -> &str {
        "TypeMatchedEvent"
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 类型转换完成事件
#[derive(Debug, Clone)]
pub struct TypeTransformedEvent {
    pub type_name: String,
    pub loader_name: String,
    pub timestamp: SystemTime,
}

impl TypeTransformedEvent {
    pub fn new(type_name: String, loader_name: String) -> Self {
        Self {
            type_name,
            loader_name,
            timestamp: SystemTime::now(),
        }
    }
}

impl Event for TypeTransformedEvent {
    fn event_name(&self) -> &str {
        "TypeTransformedEvent"
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 类加载器上下文创建事件
#[derive(Debug, Clone)]
pub struct LoaderContextCreatedEvent {
    pub loader_name: String,
    /// 是否复用了共享的切面运行时
    pub shared: bool,
    pub timestamp: SystemTime,
}

impl LoaderContextCreatedEvent {
    pub fn new(loader_name: String, shared: bool) -> Self {
        Self {
            loader_name,
            shared,
            timestamp: SystemTime::now(),
        }
    }
}

impl Event for LoaderContextCreatedEvent {
    fn event_name(&self) -> &str {
        "LoaderContextCreatedEvent"
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 织入引擎关闭事件
#[derive(Debug, Clone)]
pub struct WeaverShutdownEvent {
    pub timestamp: SystemTime,
}

impl WeaverShutdownEvent {
    pub fn new() -> Self {
        Self {
            timestamp: SystemTime::now(),
        }
    }
}

impl Default for WeaverShutdownEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Event for WeaverShutdownEvent {
    fn event_name(&self) -> &str {
        "WeaverShutdownEvent"
    }

    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
