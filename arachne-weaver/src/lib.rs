//! Arachne Weaver - 运行时切面织入引擎
//!
//! 在运行中的进程里拦截类加载，把类型/方法与声明式切点规则匹配，
//! 在命中的连接点周围注入横切行为。提供：
//! - 多级切点匹配（类加载器层、类型层、方法层）
//! - 按类加载器范围的切面解析与缓存（共享/隔离决策）
//! - 连接点调度（before/after/around 语义、异常传播、结果改写）
//!
//! 字节码改写本身由外部安装器（WeaverInstallation）完成，
//! 引擎只应答它的 matches/transform 回调

pub mod advice;
pub mod advisor;
pub mod aspect;
pub mod bridge;
pub mod context;
pub mod error;
pub mod events;
pub mod installation;
pub mod joinpoint;
pub mod matcher;
pub mod pattern;
pub mod pointcut;
pub mod registry;
pub mod testing;
pub mod types;

// 重新导出核心类型
pub use advice::{AdviceCapabilities, AdviceContract, AdviceHandle, AdviceHandleBuilder, TypeBinding};
pub use advisor::{Advisor, AdvisorRepository};
pub use aspect::{
    AdviceFactoryRegistration, AdviceFactoryRegistry, AdviceLifecycle, AspectSpec,
};
pub use bridge::RuntimeBridge;
pub use context::{
    AspectGroupContext, AspectRuntime, ClassLoader, GlobalContext, LoaderContext,
    LoaderContextGuard, LoaderId, LoaderKind,
};
pub use error::{WeaverError, WeaverResult};
pub use events::{
    LoaderContextCreatedEvent, TypeMatchedEvent, TypeTransformedEvent, WeaverShutdownEvent,
};
pub use installation::{Weaver, WeaverBuilder, WeaverCallbacks, WeaverInstallation};
pub use joinpoint::{
    AroundDispatcher, BeforeAfterDispatcher, CallDispatcher, DispatchOutcome, Joinpoint,
    JoinpointDescriptor, JoinpointKind, ProceedingJoinpoint, ThrownValue, Value,
};
pub use matcher::{TransformPlan, TypeCache, WeavingMatcher};
pub use pattern::{NameMatcher, NamePattern, PatternCompiler};
pub use pointcut::{
    CompiledPointcut, DefaultExpressionCompiler, ExpressionCompiler, FormalParameter, Pointcut,
    PointcutBuilder, PointcutExpression,
};
pub use registry::{AspectGroup, AspectGroupSubmission};
pub use types::{
    AnnotationDescription, MethodDescription, MethodModifiers, ResolvedType, TypeDescription,
    TypeSource, TypeWorld,
};

// 导出 inventory 供注册使用
pub use inventory;

/// 预导入模块
pub mod prelude {
    pub use crate::advice::{AdviceContract, AdviceHandle, TypeBinding};
    pub use crate::aspect::{AdviceFactoryRegistry, AdviceLifecycle, AspectSpec};
    pub use crate::bridge::RuntimeBridge;
    pub use crate::context::{ClassLoader, GlobalContext, LoaderContext, LoaderKind};
    pub use crate::error::{WeaverError, WeaverResult};
    pub use crate::installation::{Weaver, WeaverCallbacks, WeaverInstallation};
    pub use crate::joinpoint::{
        CallDispatcher, DispatchOutcome, Joinpoint, ProceedingJoinpoint, ThrownValue, Value,
    };
    pub use crate::matcher::WeavingMatcher;
    pub use crate::pointcut::{ExpressionCompiler, Pointcut, PointcutExpression};
    pub use crate::registry::AspectGroup;
    pub use crate::types::{TypeSource, TypeWorld};
}
