//! 织入引擎的错误类型
//!
//! 结构性错误（切点解析失败）与上下文性不匹配（加载器范围不符）
//! 是不同的东西：前者是错误，后者是正常控制流，调用方通过
//! Option/bool 表达，不会出现在这里

use arachne_core::CoreError;

/// 织入引擎错误
#[derive(Debug, thiserror::Error)]
pub enum WeaverError {
    /// 切点表达式解析失败（结构性，导致仓库永久失效）
    #[error("Failed to parse pointcut expression '{expression}': {reason}")]
    PointcutParse { expression: String, reason: String },

    /// 切点不满足织入要求（缺少类型谓词和方法谓词）
    #[error("Invalid pointcut for '{0}': a weaving pointcut needs a type or method predicate")]
    InvalidPointcut(String),

    /// 通知实例化/加载失败（按通知单独跳过，不永久失效）
    #[error("Failed to instantiate advice '{advice}' for aspect '{aspect}': {reason}")]
    AdviceInstantiation {
        aspect: String,
        advice: String,
        reason: String,
    },

    /// 目标类加载器上下文创建失败
    #[error("Failed to create loader context for '{loader}': {reason}")]
    ContextCreation { loader: String, reason: String },

    /// 类型解析失败
    #[error("Failed to resolve type '{0}'")]
    TypeResolution(String),

    /// 一致性违例（例如同一类型被二次转换）
    #[error("Weaving inconsistency: {0}")]
    Inconsistency(String),

    /// 通知抛出的致命错误（OOM/线程中断级别，永远向外传播）
    #[error("Fatal error from advice dispatch: {type_name}: {message}")]
    AdviceFatal { type_name: String, message: String },

    /// 安装器失败
    #[error("Weaver installation failed: {0}")]
    Installation(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// 织入引擎的统一 Result 类型
pub type WeaverResult<T> = Result<T, WeaverError>;
