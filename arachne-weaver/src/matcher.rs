//! 织入匹配器与派发缓存
//!
//! 外部插桩层对每个加载的类型问一次"这个类型是否有趣"。
//! 每个（加载器, 类型）对走 UNSEEN → MATCHING → {MATCHED, REJECTED}
//! 状态机：MATCHED 的缓存保留（签名 → 通知链），REJECTED 的条目
//! 立即驱逐，避免为只加载一次再也不碰的类型泄漏内存。匹配采用
//! 两阶段过滤：先用类型层谓词并行收缩候选通知器集，再做昂贵的
//! 方法层匹配。桥方法命中后重定位到代表方法，保证每个逻辑覆写
//! 只触发一次通知

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::advisor::Advisor;
use crate::context::{ClassLoader, GlobalContext, LoaderContextGuard, LoaderId};
use crate::error::{WeaverError, WeaverResult};
use crate::events::{TypeMatchedEvent, TypeTransformedEvent};
use crate::joinpoint::JoinpointDescriptor;
use crate::registry::order_chain;
use crate::types::MethodDescription;

/// 类型层快速匹配切换到并行执行的候选数阈值
const FAST_MATCH_PARALLEL_THRESHOLD: usize = 8;

/// 转换计划：交还给外部插桩层的连接点描述符集合
#[derive(Debug)]
pub struct TransformPlan {
    pub type_name: String,
    pub descriptors: Vec<Arc<JoinpointDescriptor>>,
}

/// 每个被拦截类型的缓存
pub struct TypeCache {
    type_name: String,
    loader_id: LoaderId,
    /// 方法签名 → 已排序去重的通知链
    chains: HashMap<String, Vec<Arc<Advisor>>>,
    /// 签名 → 方法描述（构建描述符用）
    methods: HashMap<String, MethodDescription>,
    /// 匹配标志（保留的条目恒为 true）
    matched: bool,
    /// 转换标志：false→true 恰好一次，二次转换是一致性违例
    transformed: AtomicBool,
    /// 签名 → 连接点描述符（惰性构建）
    descriptors: RwLock<HashMap<String, Arc<JoinpointDescriptor>>>,
}

impl TypeCache {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub fn is_transformed(&self) -> bool {
        self.transformed.load(Ordering::Acquire)
    }

    pub fn matched_signatures(&self) -> Vec<String> {
        self.chains.keys().cloned().collect()
    }

    pub fn chain(&self, signature: &str) -> Option<&Vec<Arc<Advisor>>> {
        self.chains.get(signature)
    }

    /// 按签名查找（必要时惰性构建）连接点描述符
    pub fn descriptor(&self, signature: &str) -> Option<Arc<JoinpointDescriptor>> {
        if let Some(descriptor) = self.descriptors.read().get(signature) {
            return Some(Arc::clone(descriptor));
        }

        let method = self.methods.get(signature)?;
        let chain = self.chains.get(signature)?.clone();
        let mut descriptors = self.descriptors.write();
        let descriptor = descriptors
            .entry(signature.to_string())
            .or_insert_with(|| {
                Arc::new(JoinpointDescriptor::new(
                    self.type_name.clone(),
                    method,
                    self.loader_id,
                    chain,
                ))
            });
        Some(Arc::clone(descriptor))
    }
}

type CacheKey = (LoaderId, String);

/// 织入匹配器
pub struct WeavingMatcher {
    global: Arc<GlobalContext>,
    caches: RwLock<HashMap<CacheKey, Arc<OnceCell<Option<Arc<TypeCache>>>>>>,
}

impl WeavingMatcher {
    pub fn new(global: Arc<GlobalContext>) -> Self {
        Self {
            global,
            caches: RwLock::new(HashMap::new()),
        }
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    /// 缓存的（已匹配）类型数（观测/测试用）
    pub fn cached_types(&self) -> usize {
        self.caches.read().len()
    }

    /// 插桩层入口："这个类型是否有趣"
    ///
    /// 因为重定义/重转换语义，同一类型可能被询问两次——结果幂等，
    /// 第二次命中缓存，不会重新解析或重新创建通知器
    pub fn matches(
        &self,
        type_name: &str,
        loader: &Arc<ClassLoader>,
        module: Option<&str>,
        class_being_redefined: bool,
    ) -> bool {
        if class_being_redefined {
            tracing::trace!("Re-evaluating '{}' for redefinition", type_name);
        }
        let _ = module;

        // 全局的加载器/类型过滤在建立任何缓存状态之前
        if !self.global.loader_admitted(loader.name()) {
            return false;
        }
        if !self.global.type_admitted(type_name) {
            return false;
        }

        let key: CacheKey = (loader.id(), type_name.to_string());
        let cell = {
            let mut caches = self.caches.write();
            let slot = caches.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new()));
            Arc::clone(slot)
        };

        // MATCHING 阶段至多执行一次，并发询问收敛到同一结果
        let outcome = cell.get_or_init(|| self.match_type(type_name, loader));
        let matched = outcome.is_some();

        if !matched {
            // REJECTED：驱逐缓存条目
            self.caches.write().remove(&key);
        }
        matched
    }

    /// 查询已匹配类型的缓存
    pub fn type_cache(&self, loader_id: LoaderId, type_name: &str) -> Option<Arc<TypeCache>> {
        let key: CacheKey = (loader_id, type_name.to_string());
        let cell = self.caches.read().get(&key).cloned()?;
        cell.get().and_then(|outcome| outcome.clone())
    }

    /// 插桩层回调：请求实际的字节码转换
    ///
    /// 每个类型只允许转换一次；二次转换按宿主运行时的重定义竞态
    /// 容忍处理——记错误日志、返回既有计划，绝不在这里抛崩宿主
    pub fn transform(
        &self,
        type_name: &str,
        loader: &Arc<ClassLoader>,
    ) -> WeaverResult<TransformPlan> {
        let cache = self
            .type_cache(loader.id(), type_name)
            .ok_or_else(|| {
                WeaverError::Inconsistency(format!(
                    "transform requested for unmatched type '{}'",
                    type_name
                ))
            })?;

        if cache.transformed.swap(true, Ordering::AcqRel) {
            tracing::error!(
                "Type '{}' in loader '{}' transformed twice; the host double-instrumented",
                type_name,
                loader.name()
            );
            return Ok(self.plan_from_cache(&cache));
        }

        let plan = self.plan_from_cache(&cache);
        tracing::debug!(
            "Transforming '{}': {} joinpoint(s)",
            type_name,
            plan.descriptors.len()
        );
        self.global
            .multicaster()
            .multicast(Arc::new(TypeTransformedEvent::new(
                type_name.to_string(),
                loader.name().to_string(),
            )));
        Ok(plan)
    }

    fn plan_from_cache(&self, cache: &TypeCache) -> TransformPlan {
        let mut descriptors: Vec<Arc<JoinpointDescriptor>> = cache
            .matched_signatures()
            .into_iter()
            .filter_map(|signature| cache.descriptor(&signature))
            .collect();
        descriptors.sort_by(|a, b| a.signature.cmp(&b.signature));
        TransformPlan {
            type_name: cache.type_name().to_string(),
            descriptors,
        }
    }

    /// MATCHING 阶段：解析类型并求值通知器集
    fn match_type(&self, type_name: &str, loader: &Arc<ClassLoader>) -> Option<Arc<TypeCache>> {
        let _guard = LoaderContextGuard::enter(loader.id());

        let ctx = match self.global.loader_context(loader) {
            Ok(ctx) => ctx,
            Err(e) => {
                tracing::error!(
                    "Failed to create loader context for '{}', skipping '{}': {}",
                    loader.name(),
                    type_name,
                    e
                );
                return None;
            }
        };

        let world = Arc::clone(ctx.world());
        let resolved = match world.resolve(type_name, true) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::debug!("Cannot resolve '{}', rejecting: {}", type_name, e);
                return None;
            }
        };

        let advisors = ctx.advisors();

        // 组级准入过滤
        let groups = self.global.groups();
        let admitted: Vec<Arc<Advisor>> = advisors
            .iter()
            .filter(|advisor| {
                groups
                    .get(advisor.discovery().0)
                    .map(|group| group.admits_type(type_name))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        // 第一阶段：类型层快速匹配，收缩候选集
        let candidates = self.fast_match(&admitted, &world, &resolved);
        if candidates.is_empty() {
            world.release(type_name);
            return None;
        }

        // 第二阶段：方法层匹配
        let mut chains: HashMap<String, Vec<Arc<Advisor>>> = HashMap::new();
        let mut methods: HashMap<String, MethodDescription> = HashMap::new();
        for method in resolved.methods() {
            if method.modifiers.is_synthetic && !method.modifiers.is_bridge {
                continue;
            }

            let hits: Vec<Arc<Advisor>> = candidates
                .iter()
                .filter(|advisor| advisor.matches_method(&world, &resolved, method))
                .cloned()
                .collect();
            if hits.is_empty() {
                continue;
            }

            // 桥方法重定位到代表方法
            let representative = if method.modifiers.is_bridge {
                match resolved.representative_of(method, &world) {
                    Some(representative) => {
                        tracing::trace!(
                            "Re-resolved bridge method {} to representative {}",
                            method.signature(),
                            representative.signature()
                        );
                        representative
                    }
                    None => method,
                }
            } else {
                method
            };

            let signature = representative.signature();
            chains.entry(signature.clone()).or_default().extend(hits);
            methods
                .entry(signature)
                .or_insert_with(|| representative.clone());
        }

        // 匹配结束立即释放类型世界缓存，约束长期内存
        world.release(type_name);

        if chains.is_empty() {
            return None;
        }

        let chains: HashMap<String, Vec<Arc<Advisor>>> = chains
            .into_iter()
            .map(|(signature, chain)| (signature, order_chain(chain)))
            .collect();

        tracing::info!(
            "Matched '{}' in loader '{}': {} method(s) with advice",
            type_name,
            loader.name(),
            chains.len()
        );
        self.global
            .multicaster()
            .multicast(Arc::new(TypeMatchedEvent::new(
                type_name.to_string(),
                loader.name().to_string(),
                chains.len(),
            )));

        Some(Arc::new(TypeCache {
            type_name: type_name.to_string(),
            loader_id: loader.id(),
            chains,
            methods,
            matched: true,
            transformed: AtomicBool::new(false),
            descriptors: RwLock::new(HashMap::new()),
        }))
    }

    /// 类型层快速匹配
    ///
    /// 候选集较大时并行求值（纯吞吐量优化，结果与顺序求值一致）
    fn fast_match(
        &self,
        advisors: &[Arc<Advisor>],
        world: &Arc<crate::types::TypeWorld>,
        resolved: &Arc<crate::types::ResolvedType>,
    ) -> Vec<Arc<Advisor>> {
        if advisors.len() < FAST_MATCH_PARALLEL_THRESHOLD {
            return advisors
                .iter()
                .filter(|advisor| advisor.fast_matches_type(world, resolved))
                .cloned()
                .collect();
        }

        let items: Vec<Arc<Advisor>> = advisors.to_vec();
        let results = self
            .global
            .executor()
            .execute_all(items, |advisor| advisor.fast_matches_type(world, resolved));

        advisors
            .iter()
            .zip(results)
            .filter_map(|(advisor, result)| match result {
                Ok(true) => Some(Arc::clone(advisor)),
                Ok(false) => None,
                Err(e) => {
                    tracing::error!(
                        "Fast-match failed for advisor '{}': {}",
                        advisor.aspect(),
                        e
                    );
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::{AdviceContract, AdviceHandle};
    use crate::aspect::{AdviceFactoryRegistry, AspectSpec};
    use crate::context::{ClassLoader, LoaderKind};
    use crate::registry::AspectGroup;
    use crate::testing::{bridge_method, method, FixtureTypeSource};
    use crate::types::{TypeDescription, TypeSource};

    use arachne_core::Environment;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// 统计 describe 调用次数的类型源（验证缓存命中）
    struct CountingTypeSource {
        inner: FixtureTypeSource,
        describes: Arc<AtomicUsize>,
    }

    impl TypeSource for CountingTypeSource {
        fn describe(&self, name: &str) -> Option<TypeDescription> {
            self.describes.fetch_add(1, Ordering::SeqCst);
            self.inner.describe(name)
        }
    }

    fn service_fixture() -> FixtureTypeSource {
        let mut source = FixtureTypeSource::with_core_types();
        source.add_class("com.foo.UserService", Some("java.lang.Object"), &[]);
        source.add_method(
            "com.foo.UserService",
            method("doWork", &[], "java.lang.String"),
        );
        source.add_method("com.foo.UserService", method("ignore", &[], "void"));
        source.add_class("org.other.Plain", Some("java.lang.Object"), &[]);
        source.add_method("org.other.Plain", method("run", &[], "void"));
        source
    }

    fn registry_with(ids: &[&str]) -> Arc<AdviceFactoryRegistry> {
        let registry = Arc::new(AdviceFactoryRegistry::new());
        for id in ids {
            let name = id.to_string();
            registry.register(*id, AdviceContract::none(), move || {
                Ok(AdviceHandle::builder(name.clone()).before(|_jp| Ok(())).build())
            });
        }
        registry
    }

    fn matcher_with(
        source: impl TypeSource + 'static,
        registry: Arc<AdviceFactoryRegistry>,
        groups: Vec<AspectGroup>,
    ) -> WeavingMatcher {
        let global = GlobalContext::builder()
            .environment(Arc::new(Environment::new()))
            .type_source(Arc::new(source))
            .advice_registry(registry)
            .groups(groups)
            .build()
            .unwrap();
        WeavingMatcher::new(global)
    }

    fn app_loader() -> Arc<ClassLoader> {
        ClassLoader::new("app", LoaderKind::Application, "com.host.AppLoader")
    }

    fn work_group(advice_id: &str, order: i32) -> AspectGroup {
        AspectGroup::new(format!("group-{}", advice_id)).with_spec(
            AspectSpec::new(format!("aspect-{}", advice_id), advice_id)
                .with_order(order)
                .with_pointcut("execution(* com.foo..*.doWork(..))"),
        )
    }

    #[test]
    fn test_matching_and_rejection() {
        let matcher = matcher_with(
            service_fixture(),
            registry_with(&["log"]),
            vec![work_group("log", 0)],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.UserService", &loader, None, false));
        // MATCHED 的条目保留
        assert_eq!(matcher.cached_types(), 1);

        assert!(!matcher.matches("org.other.Plain", &loader, None, false));
        // REJECTED 的条目被驱逐
        assert_eq!(matcher.cached_types(), 1);
    }

    #[test]
    fn test_idempotent_matching_hits_cache() {
        // 第二次询问结果相同，且不重新解析类型、不重新创建通知器
        let describes = Arc::new(AtomicUsize::new(0));
        let counting = CountingTypeSource {
            inner: service_fixture(),
            describes: Arc::clone(&describes),
        };
        let matcher = matcher_with(
            counting,
            registry_with(&["log"]),
            vec![work_group("log", 0)],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.UserService", &loader, None, false));
        let describes_after_first = describes.load(Ordering::SeqCst);
        assert!(describes_after_first > 0);

        assert!(matcher.matches("com.foo.UserService", &loader, None, true));
        assert_eq!(describes.load(Ordering::SeqCst), describes_after_first);
        assert_eq!(matcher.cached_types(), 1);
    }

    #[test]
    fn test_transform_once_and_double_transform_tolerated() {
        let matcher = matcher_with(
            service_fixture(),
            registry_with(&["log"]),
            vec![work_group("log", 0)],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.UserService", &loader, None, false));

        let plan = matcher.transform("com.foo.UserService", &loader).unwrap();
        assert_eq!(plan.descriptors.len(), 1);
        assert_eq!(plan.descriptors[0].signature, "doWork()");

        let cache = matcher.type_cache(loader.id(), "com.foo.UserService").unwrap();
        assert!(cache.is_transformed());

        // 二次转换：记错误日志但不失败，返回既有计划
        let again = matcher.transform("com.foo.UserService", &loader).unwrap();
        assert_eq!(again.descriptors.len(), 1);
    }

    #[test]
    fn test_transform_unmatched_type_is_error() {
        let matcher = matcher_with(
            service_fixture(),
            registry_with(&["log"]),
            vec![work_group("log", 0)],
        );
        let loader = app_loader();

        let result = matcher.transform("org.other.Plain", &loader);
        assert!(matches!(result, Err(WeaverError::Inconsistency(_))));
    }

    #[test]
    fn test_two_groups_merge_into_one_chain() {
        // 两个组都命中 doWork()，链里两个通知按优先级排列
        let matcher = matcher_with(
            service_fixture(),
            registry_with(&["metrics", "log"]),
            vec![work_group("metrics", 5), work_group("log", 1)],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.UserService", &loader, None, false));
        let cache = matcher.type_cache(loader.id(), "com.foo.UserService").unwrap();
        let chain = cache.chain("doWork()").unwrap();

        let ids: Vec<&str> = chain.iter().map(|a| a.advice_id()).collect();
        assert_eq!(ids, vec!["log", "metrics"]);
    }

    #[test]
    fn test_duplicate_advice_across_groups_deduplicated() {
        // 两个组解析到同一个 advice 标识符时只保留第一个
        let matcher = matcher_with(
            service_fixture(),
            registry_with(&["shared"]),
            vec![work_group("shared", 2), {
                AspectGroup::new("second").with_spec(
                    AspectSpec::new("aspect-shared-2", "shared")
                        .with_order(7)
                        .with_pointcut("execution(* com.foo..*.doWork(..))"),
                )
            }],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.UserService", &loader, None, false));
        let cache = matcher.type_cache(loader.id(), "com.foo.UserService").unwrap();
        let chain = cache.chain("doWork()").unwrap();

        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].order(), 2);
    }

    #[test]
    fn test_bridge_method_reresolved_to_representative() {
        // 桥方法命中后挂到代表方法上，映射里只有一个条目
        let mut source = FixtureTypeSource::with_core_types();
        source.add_class("com.foo.Box", Some("java.lang.Object"), &[]);
        // 泛型覆写：具体方法 + 编译器生成的擦除桥方法
        source.add_method(
            "com.foo.Box",
            method("unwrap", &["java.lang.String"], "java.lang.String"),
        );
        source.add_method(
            "com.foo.Box",
            bridge_method("unwrap", &["java.lang.Object"], "java.lang.Object"),
        );

        let matcher = matcher_with(
            source,
            registry_with(&["log"]),
            vec![AspectGroup::new("bridge-group").with_spec(
                AspectSpec::new("bridge-aspect", "log")
                    .with_pointcut("execution(* com.foo.Box.unwrap(..))"),
            )],
        );
        let loader = app_loader();

        assert!(matcher.matches("com.foo.Box", &loader, None, false));
        let cache = matcher.type_cache(loader.id(), "com.foo.Box").unwrap();

        let signatures = cache.matched_signatures();
        assert_eq!(signatures, vec!["unwrap(java.lang.String)".to_string()]);
        // 链去重：桥方法与代表方法的命中合并为一条
        assert_eq!(cache.chain("unwrap(java.lang.String)").unwrap().len(), 1);
    }

    #[test]
    fn test_global_type_filter_rejects_before_matching() {
        use crate::context::KEY_TYPE_EXCLUDE;
        use arachne_core::MapPropertySource;

        let environment = Arc::new(Environment::new());
        environment.add_property_source(Box::new(
            MapPropertySource::new("test").with_string(KEY_TYPE_EXCLUDE, "com.foo.internal..*"),
        ));
        let global = GlobalContext::builder()
            .environment(environment)
            .type_source(Arc::new(service_fixture()))
            .advice_registry(registry_with(&["log"]))
            .group(work_group("log", 0))
            .build()
            .unwrap();
        let matcher = WeavingMatcher::new(global);
        let loader = app_loader();

        assert!(!matcher.matches("com.foo.internal.Secret", &loader, None, false));
        assert_eq!(matcher.cached_types(), 0);
    }

    #[test]
    fn test_group_level_exclude() {
        let group = work_group("log", 0).with_type_exclude(vec!["com.foo..*".to_string()]);
        let matcher = matcher_with(service_fixture(), registry_with(&["log"]), vec![group]);
        let loader = app_loader();

        // 组级 exclude 把唯一的组滤掉，类型被拒绝
        assert!(!matcher.matches("com.foo.UserService", &loader, None, false));
    }

    #[test]
    fn test_concurrent_first_touch_single_matching_run() {
        let matcher = Arc::new(matcher_with(
            service_fixture(),
            registry_with(&["log"]),
            vec![work_group("log", 0)],
        ));
        let loader = app_loader();
        let results = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let matcher = Arc::clone(&matcher);
            let loader = Arc::clone(&loader);
            let results = Arc::clone(&results);
            handles.push(std::thread::spawn(move || {
                let matched = matcher.matches("com.foo.UserService", &loader, None, false);
                results.lock().push(matched);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(results.lock().iter().all(|&m| m));
        assert_eq!(matcher.cached_types(), 1);
        assert_eq!(matcher.global().contexts_created(), 1);
    }
}
