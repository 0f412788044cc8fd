//! 通知
//!
//! 通知采用能力标志模型：一个通知描述符携带 {before, after, around}
//! 能力集与对应的函数闭包，而不是每种通知一个接口层次。
//! returning/throwing 的声明约束是静态元数据（AdviceContract），
//! 校验时不需要实例化通知

use std::sync::Arc;

use crate::joinpoint::{Joinpoint, ProceedingJoinpoint, ThrownValue};

/// 前置/后置通知函数
///
/// 返回 Err 表示通知自身抛出了异常（不是目标方法的异常），
/// 调度器按致命/普通分类处理
pub type AdviceFn = Arc<dyn Fn(&mut Joinpoint) -> Result<(), ThrownValue> + Send + Sync>;

/// 环绕通知函数
///
/// 通过 `proceed()` 显式调用链上的下一环（或原始方法体）
pub type AroundFn =
    Arc<dyn Fn(&mut ProceedingJoinpoint<'_>) -> Result<(), ThrownValue> + Send + Sync>;

/// 通知能力集
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdviceCapabilities {
    pub before: bool,
    pub after: bool,
    pub around: bool,
}

impl AdviceCapabilities {
    pub fn is_empty(&self) -> bool {
        !self.before && !self.after && !self.around
    }
}

/// 类型绑定声明
///
/// `parameterized` 表示该绑定来自参数化的类型参数：returning 使用
/// 运行时恒等检查，必须与目标返回类型精确相等，而非可赋值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeBinding {
    pub type_name: String,
    pub parameterized: bool,
}

impl TypeBinding {
    pub fn loose(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            parameterized: false,
        }
    }

    pub fn parameterized(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            parameterized: true,
        }
    }
}

/// 通知的声明契约（静态元数据）
///
/// 在仓库解析阶段对候选目标方法做结构校验用，
/// 不需要实例化通知本身
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdviceContract {
    pub returning: Option<TypeBinding>,
    pub throwing: Option<TypeBinding>,
}

impl AdviceContract {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_returning(mut self, binding: TypeBinding) -> Self {
        self.returning = Some(binding);
        self
    }

    pub fn with_throwing(mut self, binding: TypeBinding) -> Self {
        self.throwing = Some(binding);
        self
    }
}

/// 通知句柄
///
/// 一个句柄可以同时具备多种能力（例如同时出现在 before 和 after
/// 列表里）。句柄由工厂惰性创建，只在类型真正匹配后才实例化
pub struct AdviceHandle {
    name: String,
    before: Option<AdviceFn>,
    after: Option<AdviceFn>,
    around: Option<AroundFn>,
}

impl AdviceHandle {
    pub fn builder(name: impl Into<String>) -> AdviceHandleBuilder {
        AdviceHandleBuilder {
            name: name.into(),
            before: None,
            after: None,
            around: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> AdviceCapabilities {
        AdviceCapabilities {
            before: self.before.is_some(),
            after: self.after.is_some(),
            around: self.around.is_some(),
        }
    }

    pub fn before_fn(&self) -> Option<&AdviceFn> {
        self.before.as_ref()
    }

    pub fn after_fn(&self) -> Option<&AdviceFn> {
        self.after.as_ref()
    }

    pub fn around_fn(&self) -> Option<&AroundFn> {
        self.around.as_ref()
    }
}

impl std::fmt::Debug for AdviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdviceHandle")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// 通知句柄构建器
pub struct AdviceHandleBuilder {
    name: String,
    before: Option<AdviceFn>,
    after: Option<AdviceFn>,
    around: Option<AroundFn>,
}

impl AdviceHandleBuilder {
    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Joinpoint) -> Result<(), ThrownValue> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(f));
        self
    }

    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Joinpoint) -> Result<(), ThrownValue> + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(f));
        self
    }

    pub fn around<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut ProceedingJoinpoint<'_>) -> Result<(), ThrownValue> + Send + Sync + 'static,
    {
        self.around = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> AdviceHandle {
        AdviceHandle {
            name: self.name,
            before: self.before,
            after: self.after,
            around: self.around,
        }
    }
}
