//! 连接点与调度
//!
//! 每次被拦截的调用对应一个运行时 Joinpoint 对象，携带参数、
//! 返回值槽与异常槽。调度器按序驱动通知链：before 升序、after
//! 降序（LIFO），around 洋葱式组合。返回/异常改写要经过声明类型
//! 校验；通知自身的异常按致命/普通分类——普通异常被吞掉并告警，
//! 切面不允许破坏宿主应用的控制流，致命错误除外

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::advice::AdviceHandle;
use crate::advisor::Advisor;
use crate::context::{LoaderContextGuard, LoaderId};
use crate::error::{WeaverError, WeaverResult};
use crate::types::{MethodDescription, TypeWorld};

/// 运行时值：宿主对象 + 它的运行时类型名
#[derive(Clone)]
pub struct Value {
    pub type_name: String,
    pub value: Arc<dyn Any + Send + Sync>,
}

impl Value {
    pub fn new<T: Any + Send + Sync>(type_name: impl Into<String>, value: T) -> Self {
        Self {
            type_name: type_name.into(),
            value: Arc::new(value),
        }
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// 被抛出的宿主异常的模型
#[derive(Debug, Clone)]
pub struct ThrownValue {
    /// 异常类名
    pub type_name: String,
    pub message: String,
    /// 是否携带线程中断标志
    pub interrupted: bool,
}

impl ThrownValue {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            interrupted: false,
        }
    }

    pub fn interrupted(mut self) -> Self {
        self.interrupted = true;
        self
    }

    /// 致命错误分类
    ///
    /// VirtualMachineError 族、ThreadDeath、以及携带中断标志的异常
    /// 永远向外传播，不允许被吞掉
    pub fn is_fatal(&self, world: &TypeWorld) -> bool {
        self.interrupted
            || self.type_name == "java.lang.ThreadDeath"
            || world.is_assignable("java.lang.VirtualMachineError", &self.type_name)
    }

    /// 非受检异常：RuntimeException 或 Error 族
    pub fn is_unchecked(&self, world: &TypeWorld) -> bool {
        world.is_assignable("java.lang.RuntimeException", &self.type_name)
            || world.is_assignable("java.lang.Error", &self.type_name)
    }
}

/// 连接点种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinpointKind {
    Method,
    Constructor,
    TypeInitializer,
}

/// 连接点描述符
///
/// 每个（类型, 方法签名）一个，不可变；通知链槽位在重转换时可替换
pub struct JoinpointDescriptor {
    pub type_name: String,
    pub signature: String,
    pub kind: JoinpointKind,
    pub is_static: bool,
    pub is_void: bool,
    pub return_type: String,
    pub declared_throws: Vec<String>,
    pub loader_id: LoaderId,
    /// 当前解析的通知链（重转换时整体替换）
    chain: RwLock<Arc<Vec<Arc<Advisor>>>>,
}

impl JoinpointDescriptor {
    pub fn new(
        type_name: impl Into<String>,
        method: &MethodDescription,
        loader_id: LoaderId,
        chain: Vec<Arc<Advisor>>,
    ) -> Self {
        let kind = if method.is_constructor() {
            JoinpointKind::Constructor
        } else if method.is_type_initializer() {
            JoinpointKind::TypeInitializer
        } else {
            JoinpointKind::Method
        };
        Self {
            type_name: type_name.into(),
            signature: method.signature(),
            kind,
            is_static: method.modifiers.is_static,
            is_void: method.is_void(),
            return_type: method.return_type.clone(),
            declared_throws: method.declared_throws.clone(),
            loader_id,
            chain: RwLock::new(Arc::new(chain)),
        }
    }

    pub fn chain(&self) -> Arc<Vec<Arc<Advisor>>> {
        Arc::clone(&self.chain.read())
    }

    /// 替换通知链（重转换路径）
    pub fn replace_chain(&self, chain: Vec<Arc<Advisor>>) {
        *self.chain.write() = Arc::new(chain);
    }
}

impl std::fmt::Debug for JoinpointDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinpointDescriptor")
            .field("type_name", &self.type_name)
            .field("signature", &self.signature)
            .field("kind", &self.kind)
            .field("chain_len", &self.chain.read().len())
            .finish()
    }
}

/// 运行时连接点
///
/// 携带 this、参数、返回值槽、异常槽
pub struct Joinpoint {
    descriptor: Arc<JoinpointDescriptor>,
    target: Option<Value>,
    args: Vec<Value>,
    returning: Option<Value>,
    throwing: Option<ThrownValue>,
    target_invoked: bool,
    /// 致命传播路径上需要恢复的中断标志
    interrupt_pending: bool,
}

impl Joinpoint {
    pub fn new(descriptor: Arc<JoinpointDescriptor>, target: Option<Value>, args: Vec<Value>) -> Self {
        Self {
            descriptor,
            target,
            args,
            returning: None,
            throwing: None,
            target_invoked: false,
            interrupt_pending: false,
        }
    }

    pub fn descriptor(&self) -> &Arc<JoinpointDescriptor> {
        &self.descriptor
    }

    pub fn target(&self) -> Option<&Value> {
        self.target.as_ref()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    pub fn returning(&self) -> Option<&Value> {
        self.returning.as_ref()
    }

    pub fn throwing(&self) -> Option<&ThrownValue> {
        self.throwing.as_ref()
    }

    /// 是否已有结果（返回值或异常任一被设置）
    pub fn has_outcome(&self) -> bool {
        self.returning.is_some() || self.throwing.is_some()
    }

    pub fn target_invoked(&self) -> bool {
        self.target_invoked
    }

    pub fn interrupt_pending(&self) -> bool {
        self.interrupt_pending
    }

    pub(crate) fn mark_target_invoked(&mut self) {
        self.target_invoked = true;
    }

    pub(crate) fn set_interrupt_pending(&mut self) {
        self.interrupt_pending = true;
    }

    /// 通知设置返回值改写
    ///
    /// 按声明返回类型做可赋值校验，不兼容时丢弃并告警——
    /// 原方法的自然返回仍然生效
    pub fn set_returning(&mut self, world: &TypeWorld, value: Value) {
        if self.descriptor.is_void {
            tracing::warn!(
                "Dropping returning override for void joinpoint {}",
                self.descriptor.signature
            );
            return;
        }
        if !world.is_assignable(&self.descriptor.return_type, &value.type_name) {
            tracing::warn!(
                "Dropping returning override of type '{}' for {} (declared return type '{}')",
                value.type_name,
                self.descriptor.signature,
                self.descriptor.return_type
            );
            return;
        }
        self.returning = Some(value);
    }

    /// 通知设置异常改写
    ///
    /// 必须可赋值给某个声明的受检异常，或者是非受检异常；
    /// 否则丢弃并告警
    pub fn set_throwing(&mut self, world: &TypeWorld, thrown: ThrownValue) {
        let declared_ok = self
            .descriptor
            .declared_throws
            .iter()
            .any(|declared| world.is_assignable(declared, &thrown.type_name));
        if !declared_ok && !thrown.is_unchecked(world) {
            tracing::warn!(
                "Dropping throwing override of type '{}' for {} (not declared and not unchecked)",
                thrown.type_name,
                self.descriptor.signature
            );
            return;
        }
        self.throwing = Some(thrown);
    }

    /// 记录目标方法的自然返回（不经过改写校验）
    pub fn record_natural_return(&mut self, value: Option<Value>) {
        self.returning = value;
        self.throwing = None;
    }

    /// 记录目标方法的自然异常（不经过改写校验）
    pub fn record_natural_throw(&mut self, thrown: ThrownValue) {
        self.throwing = Some(thrown);
        self.returning = None;
    }

    /// 清除异常槽（通知吞掉了目标异常）
    pub fn clear_throwing(&mut self) {
        self.throwing = None;
    }

    /// 取出最终结果
    pub fn into_outcome(self) -> DispatchOutcome {
        match self.throwing {
            Some(thrown) => DispatchOutcome::Throw(thrown),
            None => DispatchOutcome::Return(self.returning),
        }
    }
}

/// 调度结果：自然/改写后的返回值，或要向调用方抛出的异常
#[derive(Debug)]
pub enum DispatchOutcome {
    Return(Option<Value>),
    Throw(ThrownValue),
}

/// 目标方法体调用器
///
/// 织入的调用点提供：执行原方法体，把自然返回/自然异常记录到
/// 连接点上并返回 Ok；返回 Err 仅表示调用基础设施自身失败
pub type TargetBody<'a> = &'a mut dyn FnMut(&mut Joinpoint) -> Result<(), ThrownValue>;

/// 前置/后置调度器
///
/// before 升序执行，after 降序（LIFO）执行；任一通知设置了
/// 返回/异常槽则短路剩余通知
pub struct BeforeAfterDispatcher {
    world: Arc<TypeWorld>,
    chain: Vec<Arc<AdviceHandle>>,
}

impl BeforeAfterDispatcher {
    /// `chain` 必须已按优先级升序排好
    pub fn new(world: Arc<TypeWorld>, chain: Vec<Arc<AdviceHandle>>) -> Self {
        Self { world, chain }
    }

    pub fn dispatch_before(&self, jp: &mut Joinpoint) -> Result<(), ThrownValue> {
        let _guard = LoaderContextGuard::enter(jp.descriptor().loader_id);
        for handle in self.chain.iter() {
            let Some(before) = handle.before_fn() else {
                continue;
            };
            invoke_advice(&self.world, handle.name(), before, jp)?;
            if jp.has_outcome() {
                tracing::trace!(
                    "Before chain short-circuited by '{}' at {}",
                    handle.name(),
                    jp.descriptor().signature
                );
                break;
            }
        }
        Ok(())
    }

    pub fn dispatch_after(&self, jp: &mut Joinpoint) -> Result<(), ThrownValue> {
        let _guard = LoaderContextGuard::enter(jp.descriptor().loader_id);
        let entry_outcome = jp.has_outcome();
        for handle in self.chain.iter().rev() {
            let Some(after) = handle.after_fn() else {
                continue;
            };
            invoke_advice(&self.world, handle.name(), after, jp)?;
            // after 阶段的短路只对通知新设置的结果生效
            if !entry_outcome && jp.has_outcome() {
                tracing::trace!(
                    "After chain short-circuited by '{}' at {}",
                    handle.name(),
                    jp.descriptor().signature
                );
                break;
            }
        }
        Ok(())
    }
}

/// 调用单个通知函数，按致命/普通分类处理失败
///
/// 普通异常（以及 panic）被吞掉并告警；致命错误记录中断标志后传播
fn invoke_advice(
    world: &TypeWorld,
    advice_name: &str,
    advice: &crate::advice::AdviceFn,
    jp: &mut Joinpoint,
) -> Result<(), ThrownValue> {
    let outcome = catch_unwind(AssertUnwindSafe(|| advice(jp)));
    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(thrown)) => {
            if thrown.is_fatal(world) {
                tracing::error!(
                    "Fatal error from advice '{}' at {}: {}",
                    advice_name,
                    jp.descriptor().signature,
                    thrown.message
                );
                if thrown.interrupted {
                    jp.set_interrupt_pending();
                }
                Err(thrown)
            } else {
                tracing::warn!(
                    "Suppressing failure of advice '{}' at {}: {} ({})",
                    advice_name,
                    jp.descriptor().signature,
                    thrown.message,
                    thrown.type_name
                );
                Ok(())
            }
        }
        Err(_) => {
            tracing::warn!(
                "Suppressing panic from advice '{}' at {}",
                advice_name,
                jp.descriptor().signature
            );
            Ok(())
        }
    }
}

/// 环绕执行链
///
/// 每一环通过 `proceed()` 调用下一环；链耗尽时调用原方法体
pub struct ProceedingJoinpoint<'a> {
    world: &'a TypeWorld,
    joinpoint: &'a mut Joinpoint,
    links: &'a [Arc<AdviceHandle>],
    index: usize,
    target: &'a mut dyn FnMut(&mut Joinpoint) -> Result<(), ThrownValue>,
}

impl<'a> ProceedingJoinpoint<'a> {
    pub fn joinpoint(&mut self) -> &mut Joinpoint {
        &mut *self.joinpoint
    }

    pub fn world(&self) -> &TypeWorld {
        self.world
    }

    /// 调用链上的下一环，或原始方法体
    pub fn proceed(&mut self) -> Result<(), ThrownValue> {
        let mut index = self.index;
        while index < self.links.len() && self.links[index].around_fn().is_none() {
            index += 1;
        }

        if index >= self.links.len() {
            self.joinpoint.mark_target_invoked();
            return (self.target)(&mut *self.joinpoint);
        }

        let link = Arc::clone(&self.links[index]);
        let saved = self.index;
        self.index = index + 1;
        let result = match link.around_fn() {
            Some(around) => around(self),
            None => self.proceed(),
        };
        self.index = saved;
        result
    }
}

/// 环绕调度器
pub struct AroundDispatcher {
    world: Arc<TypeWorld>,
    links: Vec<Arc<AdviceHandle>>,
}

impl AroundDispatcher {
    /// `links` 必须已按优先级升序排好（低 order 在最外层）
    pub fn new(world: Arc<TypeWorld>, links: Vec<Arc<AdviceHandle>>) -> Self {
        Self { world, links }
    }

    /// 驱动环绕链
    ///
    /// 链返回的 Err 一定来自通知自身（目标方法的异常由 target
    /// 记录在连接点的异常槽上）：致命错误传播，普通错误吞掉；
    /// 如果失败发生在目标方法执行之前，回退为直接调用目标方法，
    /// 保证失败的切面最多表现为"通知未生效"
    pub fn dispatch(
        &self,
        jp: &mut Joinpoint,
        target: TargetBody<'_>,
    ) -> Result<(), ThrownValue> {
        let _guard = LoaderContextGuard::enter(jp.descriptor().loader_id);

        let result = {
            let mut pjp = ProceedingJoinpoint {
                world: &self.world,
                joinpoint: &mut *jp,
                links: &self.links,
                index: 0,
                target: &mut *target,
            };
            pjp.proceed()
        };

        match result {
            Ok(()) => Ok(()),
            Err(thrown) if thrown.is_fatal(&self.world) => {
                tracing::error!(
                    "Fatal error from around chain at {}: {}",
                    jp.descriptor().signature,
                    thrown.message
                );
                if thrown.interrupted {
                    jp.set_interrupt_pending();
                }
                Err(thrown)
            }
            Err(thrown) => {
                tracing::warn!(
                    "Suppressing around-advice failure at {}: {} ({})",
                    jp.descriptor().signature,
                    thrown.message,
                    thrown.type_name
                );
                if !jp.target_invoked() {
                    jp.mark_target_invoked();
                    target(jp)?;
                }
                Ok(())
            }
        }
    }
}

/// 调用点调度器
///
/// 桥接层按连接点的通知链组装：完整的调度包络是
/// before → (环绕链 | 原方法体) → after
pub struct CallDispatcher {
    before_after: BeforeAfterDispatcher,
    around: Option<AroundDispatcher>,
    joinpoint: Joinpoint,
}

impl CallDispatcher {
    pub fn new(
        world: Arc<TypeWorld>,
        joinpoint: Joinpoint,
        chain: Vec<Arc<AdviceHandle>>,
    ) -> Self {
        let has_around = chain.iter().any(|h| h.around_fn().is_some());
        let around = has_around.then(|| AroundDispatcher::new(Arc::clone(&world), chain.clone()));
        Self {
            before_after: BeforeAfterDispatcher::new(world, chain),
            around,
            joinpoint,
        }
    }

    pub fn joinpoint(&mut self) -> &mut Joinpoint {
        &mut self.joinpoint
    }

    /// 执行完整的调度包络
    pub fn dispatch(mut self, target: TargetBody<'_>) -> WeaverResult<DispatchOutcome> {
        let jp = &mut self.joinpoint;

        self.before_after
            .dispatch_before(jp)
            .map_err(fatal_to_error)?;

        // before 已经设置结果时跳过目标方法（短路语义）
        if !jp.has_outcome() {
            match &self.around {
                Some(around) => around.dispatch(jp, target).map_err(fatal_to_error)?,
                None => {
                    jp.mark_target_invoked();
                    target(jp).map_err(fatal_to_error)?;
                }
            }
        }

        self.before_after
            .dispatch_after(jp)
            .map_err(fatal_to_error)?;

        Ok(self.joinpoint.into_outcome())
    }
}

fn fatal_to_error(thrown: ThrownValue) -> WeaverError {
    WeaverError::AdviceFatal {
        type_name: thrown.type_name,
        message: thrown.message,
    }
}
