//! 统一的错误类型
//!
//! 基础设施层的错误，织入引擎在其上定义自己的错误类型

/// 基础设施错误
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Failed to load property source '{name}': {reason}")]
    ConfigSource { name: String, reason: String },

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("Unresolved placeholder '${{{0}}}'")]
    PlaceholderUnresolved(String),

    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Worker task panicked: {0}")]
    ExecutorPanic(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// 基础设施层的统一 Result 类型
pub type CoreResult<T> = Result<T, CoreError>;
