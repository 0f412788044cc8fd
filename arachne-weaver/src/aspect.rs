//! 切面声明
//!
//! AspectSpec 是配置扫描产出的声明式描述（切点表达式 + 通知工厂
//! 引用 + 排序 + 生命周期），创建后不再变更。通知不经反射加载，
//! 而是通过显式的工厂注册表按标识符查找：工厂可以用 inventory
//! 在编译期收集，也可以在启动时程序化注册

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::advice::{AdviceContract, AdviceHandle};
use crate::error::{WeaverError, WeaverResult};
use crate::pointcut::Pointcut;

/// 通知实例的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdviceLifecycle {
    /// 所有类加载器范围共享一个实例
    #[default]
    Singleton,
    /// 每个类加载器上下文一个实例
    PerContext,
}

/// 切面声明
#[derive(Debug, Clone, Deserialize)]
pub struct AspectSpec {
    /// 切面名
    pub name: String,

    /// 通知工厂标识符（惰性查找，类型真正匹配时才实例化）
    pub advice: String,

    /// 切点表达式字符串（编译前先做配置占位符插值）
    #[serde(default)]
    pub pointcut: Option<String>,

    /// 排序值（升序 = 优先级高）
    #[serde(default)]
    pub order: i32,

    #[serde(default)]
    pub lifecycle: AdviceLifecycle,

    /// 程序化构造时直接给出的切点（优先于表达式字符串）
    #[serde(skip)]
    pub prepared_pointcut: Option<Pointcut>,
}

impl AspectSpec {
    pub fn new(name: impl Into<String>, advice: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            advice: advice.into(),
            pointcut: None,
            order: 0,
            lifecycle: AdviceLifecycle::Singleton,
            prepared_pointcut: None,
        }
    }

    pub fn with_pointcut(mut self, expression: impl Into<String>) -> Self {
        self.pointcut = Some(expression.into());
        self
    }

    pub fn with_prepared_pointcut(mut self, pointcut: Pointcut) -> Self {
        self.prepared_pointcut = Some(pointcut);
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: AdviceLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

/// 通知工厂函数
pub type AdviceFactoryFn = Arc<dyn Fn() -> WeaverResult<AdviceHandle> + Send + Sync>;

/// inventory 收集的通知工厂注册项
pub struct AdviceFactoryRegistration {
    pub id: &'static str,
    pub contract: fn() -> AdviceContract,
    pub create: fn() -> AdviceHandle,
}

inventory::collect!(AdviceFactoryRegistration);

/// 工厂条目：契约元数据 + 工厂 + 单例缓存
struct FactoryEntry {
    contract: AdviceContract,
    create: AdviceFactoryFn,
    /// 单例生命周期的至多一次实例化
    singleton: OnceCell<Arc<AdviceHandle>>,
}

/// 通知工厂注册表
///
/// 标识符到工厂闭包的显式映射；契约元数据在不实例化通知的
/// 前提下可查（结构校验在仓库解析阶段用）
pub struct AdviceFactoryRegistry {
    factories: RwLock<HashMap<String, Arc<FactoryEntry>>>,
}

impl AdviceFactoryRegistry {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// 创建注册表并加载所有 inventory 注册项
    pub fn with_submissions() -> Self {
        let registry = Self::new();
        let mut count = 0usize;
        for registration in inventory::iter::<AdviceFactoryRegistration> {
            let create = registration.create;
            registry.register(registration.id, (registration.contract)(), move || {
                Ok(create())
            });
            count += 1;
        }
        if count > 0 {
            tracing::info!("Loaded {} advice factory registration(s)", count);
        }
        registry
    }

    /// 注册通知工厂
    pub fn register<F>(&self, id: impl Into<String>, contract: AdviceContract, factory: F)
    where
        F: Fn() -> WeaverResult<AdviceHandle> + Send + Sync + 'static,
    {
        let id = id.into();
        tracing::debug!("Registering advice factory '{}'", id);
        self.factories.write().insert(
            id,
            Arc::new(FactoryEntry {
                contract,
                create: Arc::new(factory),
                singleton: OnceCell::new(),
            }),
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.read().contains_key(id)
    }

    /// 查询通知的声明契约（不触发实例化）
    pub fn contract(&self, id: &str) -> Option<AdviceContract> {
        self.factories.read().get(id).map(|e| e.contract.clone())
    }

    /// 获取单例实例（至多一次创建）
    pub fn singleton(&self, id: &str) -> WeaverResult<Arc<AdviceHandle>> {
        let entry = self.entry(id)?;
        entry
            .singleton
            .get_or_try_init(|| (entry.create)().map(Arc::new))
            .map(Arc::clone)
    }

    /// 每次调用都新建一个实例（per-context 生命周期用）
    pub fn fresh(&self, id: &str) -> WeaverResult<Arc<AdviceHandle>> {
        let entry = self.entry(id)?;
        (entry.create)().map(Arc::new)
    }

    fn entry(&self, id: &str) -> WeaverResult<Arc<FactoryEntry>> {
        self.factories
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| WeaverError::AdviceInstantiation {
                aspect: String::new(),
                advice: id.to_string(),
                reason: "no factory registered for this advice id".to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl Default for AdviceFactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
