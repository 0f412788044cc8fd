//! 通知器仓库
//!
//! 一个 AdvisorRepository 包装一条 AspectSpec：惰性解析切点、
//! 对候选目标方法做 returning/throwing 结构校验、把通知实例化
//! 推迟到类型真正匹配之后。结构性失败（表达式解析失败）让仓库
//! 永久失效，后续查询直接跳过；上下文性不匹配（加载器范围不符）
//! 只是"本范围无匹配"，换一个范围仍可能成功

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;

use crate::advice::{AdviceContract, AdviceHandle};
use crate::aspect::{AdviceFactoryRegistry, AdviceLifecycle, AspectSpec};
use crate::context::LoaderContext;
use crate::error::{WeaverError, WeaverResult};
use crate::pointcut::{ExpressionCompiler, Pointcut};
use crate::types::{MethodDescription, ResolvedType, TypeWorld};

use arachne_core::Environment;

/// 已解析的通知器
///
/// 每个（spec × 类加载器范围）一个；通知实例仍然是惰性的
pub struct Advisor {
    aspect: String,
    advice_id: String,
    order: i32,
    /// 发现顺序（组序号, 组内序号），排序平局时使用
    discovery: (usize, usize),
    lifecycle: AdviceLifecycle,
    contract: AdviceContract,
    pointcut: Pointcut,
    registry: Arc<AdviceFactoryRegistry>,
    /// per-context 生命周期的实例缓存（本范围内至多一次创建）
    per_context: OnceCell<Arc<AdviceHandle>>,
}

impl Advisor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        aspect: String,
        advice_id: String,
        order: i32,
        discovery: (usize, usize),
        lifecycle: AdviceLifecycle,
        contract: AdviceContract,
        pointcut: Pointcut,
        registry: Arc<AdviceFactoryRegistry>,
    ) -> Self {
        Self {
            aspect,
            advice_id,
            order,
            discovery,
            lifecycle,
            contract,
            pointcut,
            registry,
            per_context: OnceCell::new(),
        }
    }

    pub fn aspect(&self) -> &str {
        &self.aspect
    }

    pub fn advice_id(&self) -> &str {
        &self.advice_id
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn discovery(&self) -> (usize, usize) {
        self.discovery
    }

    pub fn pointcut(&self) -> &Pointcut {
        &self.pointcut
    }

    /// 类型层快速匹配
    pub fn fast_matches_type(&self, world: &TypeWorld, resolved: &ResolvedType) -> bool {
        self.pointcut.fast_matches_type(world, resolved)
    }

    /// 方法层完整匹配：切点命中且声明契约兼容
    pub fn matches_method(
        &self,
        world: &TypeWorld,
        resolved: &ResolvedType,
        method: &MethodDescription,
    ) -> bool {
        self.pointcut.matches_method(world, resolved, method)
            && self.contract_compatible(world, method)
    }

    /// returning/throwing 声明契约校验
    ///
    /// 参数化的 returning 绑定走运行时恒等检查，必须与目标返回类型
    /// 精确相等；非参数化绑定按可赋值判定。throwing 绑定必须能从
    /// 目标声明的每个受检异常赋值；目标没有声明受检异常时，绑定
    /// 必须恰好是 java.lang.RuntimeException
    fn contract_compatible(&self, world: &TypeWorld, method: &MethodDescription) -> bool {
        if let Some(returning) = &self.contract.returning {
            let compatible = if returning.parameterized {
                returning.type_name == method.return_type
            } else {
                world.is_assignable(&returning.type_name, &method.return_type)
            };
            if !compatible {
                return false;
            }
        }

        if let Some(throwing) = &self.contract.throwing {
            if method.declared_throws.is_empty() {
                if throwing.type_name != "java.lang.RuntimeException" {
                    return false;
                }
            } else if !method
                .declared_throws
                .iter()
                .all(|declared| world.is_assignable(&throwing.type_name, declared))
            {
                return false;
            }
        }

        true
    }

    /// 获取通知实例（惰性，类型匹配后才会走到这里）
    pub fn advice(&self) -> WeaverResult<Arc<AdviceHandle>> {
        match self.lifecycle {
            AdviceLifecycle::Singleton => self.registry.singleton(&self.advice_id),
            AdviceLifecycle::PerContext => self
                .per_context
                .get_or_try_init(|| self.registry.fresh(&self.advice_id))
                .map(Arc::clone),
        }
    }
}

impl std::fmt::Debug for Advisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Advisor")
            .field("aspect", &self.aspect)
            .field("advice_id", &self.advice_id)
            .field("order", &self.order)
            .field("discovery", &self.discovery)
            .finish()
    }
}

/// 通知器仓库
pub struct AdvisorRepository {
    spec: AspectSpec,
    group: String,
    discovery: (usize, usize),
    /// 解析成功的切点（惰性、一次校验、跨范围复用）
    resolved_pointcut: OnceCell<Pointcut>,
    /// 永久失效标志（fail-once, cached-forever）
    invalid: AtomicBool,
}

impl AdvisorRepository {
    pub fn new(spec: AspectSpec, group: impl Into<String>, discovery: (usize, usize)) -> Self {
        Self {
            spec,
            group: group.into(),
            discovery,
            resolved_pointcut: OnceCell::new(),
            invalid: AtomicBool::new(false),
        }
    }

    pub fn spec(&self) -> &AspectSpec {
        &self.spec
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// 在给定类加载器上下文里解析出通知器
    ///
    /// 返回 None 的三种情况：仓库已永久失效；加载器范围不匹配
    /// （上下文性，无日志噪音）；通知工厂缺失（按范围跳过，可能
    /// 在别的范围成功）
    pub fn create(&self, ctx: &LoaderContext) -> Option<Arc<Advisor>> {
        if self.is_invalid() {
            return None;
        }

        let pointcut = match self.resolved_pointcut.get_or_try_init(|| {
            self.resolve_pointcut(ctx.environment(), ctx.expression_compiler().as_ref())
        }) {
            Ok(pointcut) => pointcut.clone(),
            Err(e) => {
                // 结构性失败：永久失效，只在首次记录
                self.invalid.store(true, Ordering::Release);
                tracing::error!(
                    "Aspect '{}' (group '{}', advice '{}', loader '{}') is permanently invalid: {}",
                    self.spec.name,
                    self.group,
                    self.spec.advice,
                    ctx.loader_name(),
                    e
                );
                return None;
            }
        };

        if !pointcut.matches_loader(ctx.loader_name()) {
            tracing::trace!(
                "Aspect '{}' does not apply to loader '{}'",
                self.spec.name,
                ctx.loader_name()
            );
            return None;
        }

        let registry = Arc::clone(ctx.advice_registry());
        if !registry.contains(&self.spec.advice) {
            tracing::warn!(
                "Skipping aspect '{}' for loader '{}': advice factory '{}' is not available",
                self.spec.name,
                ctx.loader_name(),
                self.spec.advice
            );
            return None;
        }
        let contract = registry.contract(&self.spec.advice).unwrap_or_default();

        Some(Arc::new(Advisor::new(
            self.spec.name.clone(),
            self.spec.advice.clone(),
            self.spec.order,
            self.discovery,
            self.spec.lifecycle,
            contract,
            pointcut,
            registry,
        )))
    }

    /// 解析切点：占位符插值 → 表达式编译 → 织入要求校验
    fn resolve_pointcut(
        &self,
        environment: &Environment,
        compiler: &dyn ExpressionCompiler,
    ) -> WeaverResult<Pointcut> {
        if let Some(prepared) = &self.spec.prepared_pointcut {
            prepared.validate(&self.spec.name)?;
            return Ok(prepared.clone());
        }

        let expression = self
            .spec
            .pointcut
            .as_deref()
            .ok_or_else(|| WeaverError::InvalidPointcut(self.spec.name.clone()))?;

        let substituted = environment.resolve_placeholders(expression)?;
        let compiled = compiler.compile(&substituted, None, &[])?;

        let pointcut = Pointcut::from_expression(compiled.expression);
        pointcut.validate(&self.spec.name)?;
        Ok(pointcut)
    }
}

impl std::fmt::Debug for AdvisorRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisorRepository")
            .field("aspect", &self.spec.name)
            .field("group", &self.group)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}
