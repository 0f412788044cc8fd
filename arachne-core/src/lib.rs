// arachne-core: 织入引擎的基础设施层
//
// 提供织入引擎依赖的通用能力：
// - 分层配置源与占位符插值
// - 统一错误类型
// - 日志初始化
// - 同步事件广播
// - 任务拆分执行器

pub mod config;
pub mod error;
pub mod event;
pub mod executor;
pub mod logging;

// 重新导出常用类型
pub use config::{
    ConfigValue, Environment, EnvironmentPropertySource, MapPropertySource, PropertySource,
    TomlPropertySource,
};
pub use error::{CoreError, CoreResult};
pub use event::{Event, EventListener, EventMulticaster};
pub use executor::TaskExecutor;
pub use logging::{LogFormat, LogLevel, LoggingConfig};

/// Prelude 模块，包含常用的 traits 和类型
pub mod prelude {
    pub use crate::config::{
        ConfigValue, Environment, EnvironmentPropertySource, MapPropertySource, PropertySource,
        TomlPropertySource,
    };
    pub use crate::error::{CoreError, CoreResult};
    pub use crate::event::{Event, EventListener, EventMulticaster};
    pub use crate::executor::TaskExecutor;
    pub use crate::logging::{LogFormat, LogLevel, LoggingConfig};
    // Re-export anyhow for convenience
    pub use anyhow::{anyhow, Context};
}
