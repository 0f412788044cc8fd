//! 上下文层级
//!
//! 全局 → 切面组 → 类加载器三级上下文。全局上下文持有配置、
//! 模式编译器、表达式编译器、通知工厂注册表与事件多播器；
//! 每个目标类加载器第一次被观察到时做一次不可逆的共享/隔离
//! 决策，然后创建（或复用）它的 LoaderContext。上下文缓存以
//! 弱引用持有目标加载器，加载器卸载后条目可被清理

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use arachne_core::{Environment, EventMulticaster, TaskExecutor};

use crate::advisor::{Advisor, AdvisorRepository};
use crate::aspect::AdviceFactoryRegistry;
use crate::error::{WeaverError, WeaverResult};
use crate::events::LoaderContextCreatedEvent;
use crate::pattern::{NameMatcher, PatternCompiler};
use crate::pointcut::{DefaultExpressionCompiler, ExpressionCompiler};
use crate::registry::AspectGroup;
use crate::types::{TypeSource, TypeWorld};

/// 配置键
pub const KEY_LOADER_INCLUDE: &str = "arachne.weaver.loader-include";
pub const KEY_LOADER_EXCLUDE: &str = "arachne.weaver.loader-exclude";
pub const KEY_TYPE_INCLUDE: &str = "arachne.weaver.type-include";
pub const KEY_TYPE_EXCLUDE: &str = "arachne.weaver.type-exclude";
pub const KEY_SHARED_LOADER: &str = "arachne.weaver.shared-loader";
pub const KEY_CONFLICT_GROUPS: &str = "arachne.weaver.loader-conflict-groups";

/// 类加载器标识
pub type LoaderId = u64;

static LOADER_SEQ: AtomicU64 = AtomicU64::new(1);
static RUNTIME_SEQ: AtomicU64 = AtomicU64::new(1);

/// 类加载器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    Bootstrap,
    Platform,
    System,
    Application,
}

impl LoaderKind {
    /// 引导/平台/系统加载器天然是单例，总是共享
    pub fn is_builtin(&self) -> bool {
        !matches!(self, LoaderKind::Application)
    }
}

/// 目标类加载器的运行时句柄
#[derive(Debug)]
pub struct ClassLoader {
    id: LoaderId,
    name: String,
    kind: LoaderKind,
    /// 加载器的具体实现类名（共享决策的规则 4 使用）
    impl_class: String,
}

impl ClassLoader {
    pub fn new(
        name: impl Into<String>,
        kind: LoaderKind,
        impl_class: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: LOADER_SEQ.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            kind,
            impl_class: impl_class.into(),
        })
    }

    pub fn id(&self) -> LoaderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    pub fn impl_class(&self) -> &str {
        &self.impl_class
    }
}

thread_local! {
    /// 当前线程的加载器上下文栈
    static CURRENT_LOADER: RefCell<Vec<LoaderId>> = RefCell::new(Vec::new());
}

/// 线程加载器上下文守卫
///
/// 通知代码可能在目标加载器的上下文里解析类，调度器在每次通知
/// 调用和匹配前后保存/恢复当前线程的加载器上下文
pub struct LoaderContextGuard {
    _private: (),
}

impl LoaderContextGuard {
    pub fn enter(id: LoaderId) -> Self {
        CURRENT_LOADER.with(|stack| stack.borrow_mut().push(id));
        Self { _private: () }
    }

    /// 当前线程栈顶的加载器
    pub fn current() -> Option<LoaderId> {
        CURRENT_LOADER.with(|stack| stack.borrow().last().copied())
    }
}

impl Drop for LoaderContextGuard {
    fn drop(&mut self) {
        CURRENT_LOADER.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// 解析冲突组声明
///
/// 格式：分号分隔的组，组内是逗号分隔的加载器名
/// 例如 `"tenantA,tenantB;batch,web"`
pub fn parse_conflict_groups(raw: &str) -> Vec<Vec<String>> {
    raw.split(';')
        .map(|group| {
            group
                .split(',')
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|group| group.len() > 1)
        .collect()
}

/// 切面运行时
///
/// 隔离的类型池（TypeWorld）；按共享决策被一个或多个目标加载器
/// 上下文持有
pub struct AspectRuntime {
    id: u64,
    world: Arc<TypeWorld>,
}

impl AspectRuntime {
    fn new(source: Arc<dyn TypeSource>) -> Self {
        Self {
            id: RUNTIME_SEQ.fetch_add(1, Ordering::Relaxed),
            world: Arc::new(TypeWorld::new(source)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn world(&self) -> &Arc<TypeWorld> {
        &self.world
    }
}

/// 切面组上下文
///
/// 组级匹配器与父级合并：include 局部优先（未配置则继承父级），
/// exclude 取并集（父级已在全局层检查过，这里只查局部）
pub struct AspectGroupContext {
    name: String,
    type_include: Arc<NameMatcher>,
    type_exclude: Arc<NameMatcher>,
    repositories: Vec<Arc<AdvisorRepository>>,
}

impl AspectGroupContext {
    fn new(
        group_index: usize,
        group: AspectGroup,
        global_include: &Arc<NameMatcher>,
        compiler: &PatternCompiler,
    ) -> Self {
        let rule = format!("group '{}' type-include", group.name);
        let type_include = if group.type_include.is_empty() {
            Arc::clone(global_include)
        } else {
            compiler.compile(&rule, &group.type_include, true, true)
        };
        let rule = format!("group '{}' type-exclude", group.name);
        let type_exclude = if group.type_exclude.is_empty() {
            NameMatcher::none()
        } else {
            compiler.compile(&rule, &group.type_exclude, false, true)
        };

        let repositories = group
            .specs
            .iter()
            .enumerate()
            .map(|(spec_index, spec)| {
                Arc::new(AdvisorRepository::new(
                    spec.clone(),
                    group.name.clone(),
                    (group_index, spec_index),
                ))
            })
            .collect();

        Self {
            name: group.name,
            type_include,
            type_exclude,
            repositories,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 组级类型准入
    pub fn admits_type(&self, type_name: &str) -> bool {
        if self.type_exclude.matches(type_name) {
            return false;
        }
        self.type_include.matches(type_name)
    }

    pub fn repositories(&self) -> &[Arc<AdvisorRepository>] {
        &self.repositories
    }

    /// 在给定加载器上下文里解析本组的通知器
    pub fn resolve_advisors(&self, ctx: &LoaderContext) -> Vec<Arc<Advisor>> {
        self.repositories
            .iter()
            .filter_map(|repository| repository.create(ctx))
            .collect()
    }
}

/// 类加载器上下文
///
/// 每个目标加载器至多一个（除非共享策略决定复用运行时）。
/// 对目标加载器只持弱引用，不阻止其卸载
pub struct LoaderContext {
    loader_id: LoaderId,
    loader_name: String,
    loader: Weak<ClassLoader>,
    shared: bool,
    runtime: Arc<AspectRuntime>,
    environment: Arc<Environment>,
    compiler: Arc<dyn ExpressionCompiler>,
    advice_registry: Arc<AdviceFactoryRegistry>,
    groups: Arc<Vec<Arc<AspectGroupContext>>>,
    executor: Arc<TaskExecutor>,
    /// 本范围解析出的全部通知器（惰性，至多一次）
    advisors: OnceCell<Arc<Vec<Arc<Advisor>>>>,
    closed: AtomicBool,
}

impl LoaderContext {
    pub fn loader_id(&self) -> LoaderId {
        self.loader_id
    }

    pub fn loader_name(&self) -> &str {
        &self.loader_name
    }

    pub fn loader(&self) -> Option<Arc<ClassLoader>> {
        self.loader.upgrade()
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn world(&self) -> &Arc<TypeWorld> {
        self.runtime.world()
    }

    pub fn runtime(&self) -> &Arc<AspectRuntime> {
        &self.runtime
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn expression_compiler(&self) -> &Arc<dyn ExpressionCompiler> {
        &self.compiler
    }

    pub fn advice_registry(&self) -> &Arc<AdviceFactoryRegistry> {
        &self.advice_registry
    }

    pub fn groups(&self) -> &[Arc<AspectGroupContext>] {
        &self.groups
    }

    /// 本范围的通知器全集（排序后），惰性解析
    ///
    /// 每个切面组一个扇出任务；组间无顺序保证，汇合后统一排序
    pub fn advisors(&self) -> Arc<Vec<Arc<Advisor>>> {
        Arc::clone(self.advisors.get_or_init(|| {
            let groups: Vec<Arc<AspectGroupContext>> = self.groups.iter().cloned().collect();
            let results = self
                .executor
                .execute_all(groups, |group| group.resolve_advisors(self));

            let mut advisors = Vec::new();
            for (index, result) in results.into_iter().enumerate() {
                match result {
                    Ok(resolved) => advisors.extend(resolved),
                    Err(e) => tracing::error!(
                        "Failed to resolve aspect group '{}' for loader '{}': {}",
                        self.groups[index].name(),
                        self.loader_name,
                        e
                    ),
                }
            }

            advisors.sort_by(|a, b| {
                a.order()
                    .cmp(&b.order())
                    .then_with(|| a.discovery().cmp(&b.discovery()))
            });

            tracing::debug!(
                "Resolved {} advisor(s) for loader '{}'",
                advisors.len(),
                self.loader_name
            );
            Arc::new(advisors)
        }))
    }

    /// 释放上下文占用的资源（尽力而为，幂等）
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // 隔离运行时随上下文一起释放；共享运行时在全局关闭时清理
        if !self.shared {
            self.runtime.world().clear();
        }
        tracing::debug!("Closed loader context for '{}'", self.loader_name);
    }
}

struct LoaderSlot {
    loader: Weak<ClassLoader>,
    cell: Arc<OnceCell<Arc<LoaderContext>>>,
}

/// 全局上下文
pub struct GlobalContext {
    environment: Arc<Environment>,
    pattern_compiler: PatternCompiler,
    expression_compiler: Arc<dyn ExpressionCompiler>,
    type_source: Arc<dyn TypeSource>,
    advice_registry: Arc<AdviceFactoryRegistry>,
    multicaster: Arc<EventMulticaster>,
    executor: Arc<TaskExecutor>,
    groups: Arc<Vec<Arc<AspectGroupContext>>>,

    loader_include: Arc<NameMatcher>,
    loader_exclude: Arc<NameMatcher>,
    type_include: Arc<NameMatcher>,
    type_exclude: Arc<NameMatcher>,

    share_loader: bool,
    conflict_groups: Vec<Vec<String>>,

    shared_runtime: OnceCell<Arc<AspectRuntime>>,
    loader_contexts: RwLock<HashMap<LoaderId, LoaderSlot>>,
    contexts_created: AtomicUsize,
}

impl GlobalContext {
    pub fn builder() -> GlobalContextBuilder {
        GlobalContextBuilder::default()
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn multicaster(&self) -> &Arc<EventMulticaster> {
        &self.multicaster
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn groups(&self) -> &[Arc<AspectGroupContext>] {
        &self.groups
    }

    pub fn pattern_compiler(&self) -> &PatternCompiler {
        &self.pattern_compiler
    }

    /// 已创建的加载器上下文数（观测/测试用）
    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::Relaxed)
    }

    /// 全局类加载器准入
    pub fn loader_admitted(&self, loader_name: &str) -> bool {
        !self.loader_exclude.matches(loader_name) && self.loader_include.matches(loader_name)
    }

    /// 全局类型准入
    pub fn type_admitted(&self, type_name: &str) -> bool {
        !self.type_exclude.matches(type_name) && self.type_include.matches(type_name)
    }

    /// 获取（或创建）目标加载器的上下文
    ///
    /// 并发的首次触达收敛到同一个实例：槽位在短写锁内建立，
    /// 昂贵的创建在锁外通过 OnceCell 至多执行一次
    pub fn loader_context(&self, loader: &Arc<ClassLoader>) -> WeaverResult<Arc<LoaderContext>> {
        let cell = {
            let mut slots = self.loader_contexts.write();
            Self::prune_locked(&mut slots);
            let slot = slots.entry(loader.id()).or_insert_with(|| LoaderSlot {
                loader: Arc::downgrade(loader),
                cell: Arc::new(OnceCell::new()),
            });
            Arc::clone(&slot.cell)
        };

        cell.get_or_try_init(|| self.create_loader_context(loader))
            .map(Arc::clone)
    }

    /// 共享/隔离决策（一次性，随上下文缓存终身有效）
    fn decide_sharing(&self, loader: &Arc<ClassLoader>) -> bool {
        // 规则 2：引导/平台/系统加载器天然单例，总是共享
        if loader.kind().is_builtin() {
            return true;
        }
        // 规则 3：共享策略关闭时总是隔离
        if !self.share_loader {
            return false;
        }

        let slots = self.loader_contexts.read();
        for slot in slots.values() {
            let Some(existing) = slot.loader.upgrade() else {
                continue;
            };
            if existing.id() == loader.id() {
                continue;
            }
            // 规则 4：同一实现类加载不同应用代码，按多租户处理
            if existing.kind() == LoaderKind::Application
                && existing.impl_class() == loader.impl_class()
            {
                tracing::debug!(
                    "Isolating loader '{}': same implementation class as cached loader '{}'",
                    loader.name(),
                    existing.name()
                );
                return false;
            }
            // 规则 5：与已缓存加载器同处一个冲突组
            if self.in_conflict_group(loader.name(), existing.name()) {
                tracing::debug!(
                    "Isolating loader '{}': conflict group with cached loader '{}'",
                    loader.name(),
                    existing.name()
                );
                return false;
            }
        }

        // 规则 6：其余情况共享
        true
    }

    fn in_conflict_group(&self, a: &str, b: &str) -> bool {
        self.conflict_groups
            .iter()
            .any(|group| group.iter().any(|n| n == a) && group.iter().any(|n| n == b))
    }

    fn create_loader_context(&self, loader: &Arc<ClassLoader>) -> WeaverResult<Arc<LoaderContext>> {
        let shared = self.decide_sharing(loader);
        let runtime = if shared {
            Arc::clone(self.shared_runtime.get_or_init(|| {
                Arc::new(AspectRuntime::new(Arc::clone(&self.type_source)))
            }))
        } else {
            Arc::new(AspectRuntime::new(Arc::clone(&self.type_source)))
        };

        let context = Arc::new(LoaderContext {
            loader_id: loader.id(),
            loader_name: loader.name().to_string(),
            loader: Arc::downgrade(loader),
            shared,
            runtime,
            environment: Arc::clone(&self.environment),
            compiler: Arc::clone(&self.expression_compiler),
            advice_registry: Arc::clone(&self.advice_registry),
            groups: Arc::clone(&self.groups),
            executor: Arc::clone(&self.executor),
            advisors: OnceCell::new(),
            closed: AtomicBool::new(false),
        });

        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Created {} loader context for '{}' (runtime #{})",
            if shared { "shared" } else { "isolated" },
            loader.name(),
            context.runtime.id()
        );
        self.multicaster.multicast(Arc::new(LoaderContextCreatedEvent::new(
            loader.name().to_string(),
            shared,
        )));

        Ok(context)
    }

    fn prune_locked(slots: &mut HashMap<LoaderId, LoaderSlot>) {
        slots.retain(|_, slot| {
            if slot.loader.strong_count() > 0 {
                return true;
            }
            if let Some(context) = slot.cell.get() {
                context.close();
            }
            false
        });
    }

    /// 显式清理已卸载加载器的条目（宿主的卸载通知钩子）
    pub fn prune_dead_loaders(&self) {
        Self::prune_locked(&mut self.loader_contexts.write());
    }

    /// 全局关闭：关闭所有加载器上下文并清空共享运行时
    pub fn close(&self) {
        let slots = std::mem::take(&mut *self.loader_contexts.write());
        for slot in slots.values() {
            if let Some(context) = slot.cell.get() {
                context.close();
            }
        }
        if let Some(runtime) = self.shared_runtime.get() {
            runtime.world().clear();
        }
        tracing::info!("Global weaver context closed ({} loader context(s))", slots.len());
    }
}

/// 全局上下文构建器
#[derive(Default)]
pub struct GlobalContextBuilder {
    environment: Option<Arc<Environment>>,
    type_source: Option<Arc<dyn TypeSource>>,
    expression_compiler: Option<Arc<dyn ExpressionCompiler>>,
    advice_registry: Option<Arc<AdviceFactoryRegistry>>,
    multicaster: Option<Arc<EventMulticaster>>,
    executor: Option<Arc<TaskExecutor>>,
    groups: Vec<AspectGroup>,
}

impl GlobalContextBuilder {
    pub fn environment(mut self, environment: Arc<Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn type_source(mut self, source: Arc<dyn TypeSource>) -> Self {
        self.type_source = Some(source);
        self
    }

    pub fn expression_compiler(mut self, compiler: Arc<dyn ExpressionCompiler>) -> Self {
        self.expression_compiler = Some(compiler);
        self
    }

    pub fn advice_registry(mut self, registry: Arc<AdviceFactoryRegistry>) -> Self {
        self.advice_registry = Some(registry);
        self
    }

    pub fn multicaster(mut self, multicaster: Arc<EventMulticaster>) -> Self {
        self.multicaster = Some(multicaster);
        self
    }

    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn group(mut self, group: AspectGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn groups(mut self, groups: Vec<AspectGroup>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn build(self) -> WeaverResult<Arc<GlobalContext>> {
        let type_source = self.type_source.ok_or_else(|| WeaverError::ContextCreation {
            loader: "<global>".to_string(),
            reason: "a type source is required".to_string(),
        })?;
        let environment = self.environment.unwrap_or_else(|| Arc::new(Environment::new()));
        let expression_compiler = self
            .expression_compiler
            .unwrap_or_else(|| Arc::new(DefaultExpressionCompiler::new()));
        let advice_registry = self
            .advice_registry
            .unwrap_or_else(|| Arc::new(AdviceFactoryRegistry::with_submissions()));
        let multicaster = self.multicaster.unwrap_or_default();
        let executor = self.executor.unwrap_or_default();

        let pattern_compiler = PatternCompiler::new();
        let loader_include = include_matcher(
            &pattern_compiler,
            "loader-include",
            environment.get_list(KEY_LOADER_INCLUDE),
        );
        let loader_exclude = exclude_matcher(
            &pattern_compiler,
            "loader-exclude",
            environment.get_list(KEY_LOADER_EXCLUDE),
        );
        let type_include = include_matcher(
            &pattern_compiler,
            "type-include",
            environment.get_list(KEY_TYPE_INCLUDE),
        );
        let type_exclude = exclude_matcher(
            &pattern_compiler,
            "type-exclude",
            environment.get_list(KEY_TYPE_EXCLUDE),
        );

        let share_loader = environment.get_bool_or(KEY_SHARED_LOADER, true);
        let conflict_groups = environment
            .get_string(KEY_CONFLICT_GROUPS)
            .map(|raw| parse_conflict_groups(&raw))
            .unwrap_or_default();

        let groups = Arc::new(
            self.groups
                .into_iter()
                .enumerate()
                .map(|(index, group)| {
                    Arc::new(AspectGroupContext::new(
                        index,
                        group,
                        &type_include,
                        &pattern_compiler,
                    ))
                })
                .collect::<Vec<_>>(),
        );

        tracing::info!(
            "Weaver global context ready: {} aspect group(s), shared-loader policy {}",
            groups.len(),
            if share_loader { "enabled" } else { "disabled" }
        );

        Ok(Arc::new(GlobalContext {
            environment,
            pattern_compiler,
            expression_compiler,
            type_source,
            advice_registry,
            multicaster,
            executor,
            groups,
            loader_include,
            loader_exclude,
            type_include,
            type_exclude,
            share_loader,
            conflict_groups,
            shared_runtime: OnceCell::new(),
            loader_contexts: RwLock::new(HashMap::new()),
            contexts_created: AtomicUsize::new(0),
        }))
    }
}

/// include 规则：未配置时放行一切
fn include_matcher(
    compiler: &PatternCompiler,
    rule: &str,
    patterns: Vec<String>,
) -> Arc<NameMatcher> {
    if patterns.is_empty() {
        NameMatcher::any()
    } else {
        compiler.compile(rule, &patterns, true, true)
    }
}

/// exclude 规则：未配置时不排除；不接受 match-all
fn exclude_matcher(
    compiler: &PatternCompiler,
    rule: &str,
    patterns: Vec<String>,
) -> Arc<NameMatcher> {
    if patterns.is_empty() {
        NameMatcher::none()
    } else {
        compiler.compile(rule, &patterns, false, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureTypeSource;
    use arachne_core::MapPropertySource;

    fn builder_with_env(source: MapPropertySource) -> GlobalContextBuilder {
        let environment = Arc::new(Environment::new());
        environment.add_property_source(Box::new(source));
        GlobalContext::builder()
            .environment(environment)
            .type_source(Arc::new(FixtureTypeSource::with_core_types()))
            .advice_registry(Arc::new(AdviceFactoryRegistry::new()))
    }

    fn plain_global() -> Arc<GlobalContext> {
        builder_with_env(MapPropertySource::new("test")).build().unwrap()
    }

    #[test]
    fn test_loader_context_is_idempotent() {
        let global = plain_global();
        let loader = ClassLoader::new("app", LoaderKind::Application, "com.host.AppLoader");

        let first = global.loader_context(&loader).unwrap();
        let second = global.loader_context(&loader).unwrap();

        // 规则 1：同一加载器复用缓存的上下文
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(global.contexts_created(), 1);
    }

    #[test]
    fn test_concurrent_first_touch_creates_one_context() {
        // N 个线程并发首次触达同一加载器，只构造一个上下文
        let global = plain_global();
        let loader = ClassLoader::new("app", LoaderKind::Application, "com.host.AppLoader");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let global = Arc::clone(&global);
            let loader = Arc::clone(&loader);
            handles.push(std::thread::spawn(move || {
                global.loader_context(&loader).unwrap()
            }));
        }

        let contexts: Vec<Arc<LoaderContext>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        for context in &contexts[1..] {
            assert!(Arc::ptr_eq(&contexts[0], context));
        }
        assert_eq!(global.contexts_created(), 1);
    }

    #[test]
    fn test_builtin_loaders_always_share() {
        let global = plain_global();
        let bootstrap = ClassLoader::new("bootstrap", LoaderKind::Bootstrap, "<bootstrap>");
        let system = ClassLoader::new("system", LoaderKind::System, "jdk.internal.AppClassLoader");

        let first = global.loader_context(&bootstrap).unwrap();
        let second = global.loader_context(&system).unwrap();

        assert!(first.is_shared());
        assert!(second.is_shared());
        assert_eq!(first.runtime().id(), second.runtime().id());
    }

    #[test]
    fn test_sharing_disabled_isolates_everything() {
        // 共享策略关闭时，同实现类的两个应用加载器
        // 各自获得隔离的上下文（策略开关先于实现类启发式生效）
        let global = builder_with_env(
            MapPropertySource::new("test").with_bool(KEY_SHARED_LOADER, false),
        )
        .build()
        .unwrap();

        let first_loader = ClassLoader::new("app-1", LoaderKind::Application, "com.host.AppLoader");
        let second_loader = ClassLoader::new("app-2", LoaderKind::Application, "com.host.AppLoader");

        let first = global.loader_context(&first_loader).unwrap();
        let second = global.loader_context(&second_loader).unwrap();

        assert!(!first.is_shared());
        assert!(!second.is_shared());
        assert_ne!(first.runtime().id(), second.runtime().id());
    }

    #[test]
    fn test_same_impl_class_isolates() {
        // 规则 4：同实现类的第二个加载器按多租户隔离
        let global = plain_global();
        let first_loader = ClassLoader::new("tenant-a", LoaderKind::Application, "com.host.TenantLoader");
        let second_loader = ClassLoader::new("tenant-b", LoaderKind::Application, "com.host.TenantLoader");

        let first = global.loader_context(&first_loader).unwrap();
        let second = global.loader_context(&second_loader).unwrap();

        assert!(first.is_shared());
        assert!(!second.is_shared());
    }

    #[test]
    fn test_conflict_group_isolates() {
        // 规则 5：冲突组里的加载器名互相隔离
        let global = builder_with_env(
            MapPropertySource::new("test")
                .with_string(KEY_CONFLICT_GROUPS, "web,batch;other-a,other-b"),
        )
        .build()
        .unwrap();

        let web = ClassLoader::new("web", LoaderKind::Application, "com.host.WebLoader");
        let batch = ClassLoader::new("batch", LoaderKind::Application, "com.host.BatchLoader");

        let first = global.loader_context(&web).unwrap();
        let second = global.loader_context(&batch).unwrap();

        assert!(first.is_shared());
        assert!(!second.is_shared());
    }

    #[test]
    fn test_unrelated_loaders_share() {
        // 规则 6：无冲突迹象时共享
        let global = plain_global();
        let first_loader = ClassLoader::new("web", LoaderKind::Application, "com.host.WebLoader");
        let second_loader = ClassLoader::new("batch", LoaderKind::Application, "com.host.BatchLoader");

        let first = global.loader_context(&first_loader).unwrap();
        let second = global.loader_context(&second_loader).unwrap();

        assert!(first.is_shared());
        assert!(second.is_shared());
        assert_eq!(first.runtime().id(), second.runtime().id());
    }

    #[test]
    fn test_dead_loader_entries_are_pruned() {
        let global = plain_global();
        let loader = ClassLoader::new("short-lived", LoaderKind::Application, "com.host.AppLoader");
        let context = global.loader_context(&loader).unwrap();
        drop(loader);
        drop(context);

        global.prune_dead_loaders();

        // 条目被清理后，同名的新加载器重新创建上下文
        let fresh = ClassLoader::new("short-lived", LoaderKind::Application, "com.host.AppLoader");
        let _ = global.loader_context(&fresh).unwrap();
        assert_eq!(global.contexts_created(), 2);
    }

    #[test]
    fn test_admission_matchers_from_config() {
        let global = builder_with_env(
            MapPropertySource::new("test")
                .with_string(KEY_TYPE_INCLUDE, "com.foo..*")
                .with_string(KEY_TYPE_EXCLUDE, "com.foo.internal..*")
                .with_string(KEY_LOADER_EXCLUDE, "jdk.*"),
        )
        .build()
        .unwrap();

        assert!(global.type_admitted("com.foo.Bar"));
        assert!(!global.type_admitted("com.foo.internal.Secret"));
        assert!(!global.type_admitted("org.other.Thing"));

        assert!(global.loader_admitted("app-loader"));
        assert!(!global.loader_admitted("jdk.internal"));
    }

    #[test]
    fn test_parse_conflict_groups() {
        let groups = parse_conflict_groups("a, b; c,d,e ;single;");
        assert_eq!(
            groups,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string(), "d".to_string(), "e".to_string()],
            ]
        );
    }

    #[test]
    fn test_loader_context_guard_nesting() {
        assert_eq!(LoaderContextGuard::current(), None);
        {
            let _outer = LoaderContextGuard::enter(1);
            assert_eq!(LoaderContextGuard::current(), Some(1));
            {
                let _inner = LoaderContextGuard::enter(2);
                assert_eq!(LoaderContextGuard::current(), Some(2));
            }
            assert_eq!(LoaderContextGuard::current(), Some(1));
        }
        assert_eq!(LoaderContextGuard::current(), None);
    }
}
