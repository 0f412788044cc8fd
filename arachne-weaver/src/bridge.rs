//! 通知运行时桥接
//!
//! 织入后的调用点通过这里回到引擎：按方法签名查找缓存的连接点
//! 描述符，再用描述符 + 捕获的 this/参数构造调度器对象。调用点
//! 拿到的是显式句柄，不经过任何进程级单例

use std::sync::Arc;

use crate::context::ClassLoader;
use crate::joinpoint::{CallDispatcher, Joinpoint, JoinpointDescriptor, Value};
use crate::matcher::WeavingMatcher;

/// 运行时桥接句柄
///
/// 织入时作为显式参数交给生成的调用点
pub struct RuntimeBridge {
    matcher: Arc<WeavingMatcher>,
}

impl RuntimeBridge {
    pub fn new(matcher: Arc<WeavingMatcher>) -> Self {
        Self { matcher }
    }

    /// 按（加载器, 类型, 方法签名）查找连接点描述符
    pub fn descriptor(
        &self,
        loader: &Arc<ClassLoader>,
        type_name: &str,
        signature: &str,
    ) -> Option<Arc<JoinpointDescriptor>> {
        self.matcher
            .type_cache(loader.id(), type_name)?
            .descriptor(signature)
    }

    /// 调度器工厂：描述符 + 捕获的 this/参数 → 调度器对象
    ///
    /// 通知实例化推迟到了这里（类型已经匹配）；单个通知实例化失败
    /// 只跳过该通知并告警，链上其余通知照常生效
    pub fn dispatcher(
        &self,
        loader: &Arc<ClassLoader>,
        descriptor: &Arc<JoinpointDescriptor>,
        target: Option<Value>,
        args: Vec<Value>,
    ) -> CallDispatcher {
        let chain = descriptor.chain();
        let mut handles = Vec::with_capacity(chain.len());
        for advisor in chain.iter() {
            match advisor.advice() {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!(
                        "Skipping advice '{}' of aspect '{}' at {}: {}",
                        advisor.advice_id(),
                        advisor.aspect(),
                        descriptor.signature,
                        e
                    );
                }
            }
        }

        let world = self
            .matcher
            .global()
            .loader_context(loader)
            .map(|ctx| Arc::clone(ctx.world()));
        let world = match world {
            Ok(world) => world,
            Err(e) => {
                // 描述符存在但上下文拿不到属于宿主竞态；
                // 降级到空类型世界，改写校验一律按未知类型拒绝
                tracing::error!(
                    "Loader context unavailable while dispatching {}: {}",
                    descriptor.signature,
                    e
                );
                Arc::new(crate::types::TypeWorld::new(Arc::new(EmptyTypeSource)))
            }
        };

        let joinpoint = Joinpoint::new(Arc::clone(descriptor), target, args);
        CallDispatcher::new(world, joinpoint, handles)
    }
}

/// 空类型源（上下文丢失时的降级路径：一切校验按未知类型失败）
struct EmptyTypeSource;

impl crate::types::TypeSource for EmptyTypeSource {
    fn describe(&self, _name: &str) -> Option<crate::types::TypeDescription> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advice::{AdviceContract, AdviceHandle};
    use crate::aspect::{AdviceFactoryRegistry, AspectSpec};
    use crate::context::{GlobalContext, LoaderKind};
    use crate::error::WeaverError;
    use crate::joinpoint::DispatchOutcome;
    use crate::registry::AspectGroup;
    use crate::testing::{method, FixtureTypeSource};

    use arachne_core::Environment;
    use parking_lot::Mutex;

    fn fixture() -> FixtureTypeSource {
        let mut source = FixtureTypeSource::with_core_types();
        source.add_class("com.foo.UserService", Some("java.lang.Object"), &[]);
        source.add_method(
            "com.foo.UserService",
            method("doWork", &[], "java.lang.String"),
        );
        source
    }

    fn bridge_with(
        registry: Arc<AdviceFactoryRegistry>,
        groups: Vec<AspectGroup>,
    ) -> (RuntimeBridge, Arc<crate::context::ClassLoader>) {
        let global = GlobalContext::builder()
            .environment(Arc::new(Environment::new()))
            .type_source(Arc::new(fixture()))
            .advice_registry(registry)
            .groups(groups)
            .build()
            .unwrap();
        let matcher = Arc::new(WeavingMatcher::new(global));
        let loader = ClassLoader::new("app", LoaderKind::Application, "com.host.AppLoader");
        assert!(matcher.matches("com.foo.UserService", &loader, None, false));
        matcher.transform("com.foo.UserService", &loader).unwrap();
        (RuntimeBridge::new(matcher), loader)
    }

    fn work_group(advice_id: &str) -> AspectGroup {
        AspectGroup::new("test-group").with_spec(
            AspectSpec::new("test-aspect", advice_id)
                .with_pointcut("execution(* com.foo..*.doWork(..))"),
        )
    }

    #[test]
    fn test_descriptor_lookup_by_signature() {
        let registry = Arc::new(AdviceFactoryRegistry::new());
        registry.register("log", AdviceContract::none(), || {
            Ok(AdviceHandle::builder("log").before(|_jp| Ok(())).build())
        });
        let (bridge, loader) = bridge_with(registry, vec![work_group("log")]);

        let descriptor = bridge
            .descriptor(&loader, "com.foo.UserService", "doWork()")
            .unwrap();
        assert_eq!(descriptor.type_name, "com.foo.UserService");
        assert!(!descriptor.is_void);

        assert!(bridge
            .descriptor(&loader, "com.foo.UserService", "missing()")
            .is_none());
    }

    #[test]
    fn test_dispatch_through_bridge() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let registry = Arc::new(AdviceFactoryRegistry::new());
        let advice_log = Arc::clone(&log);
        registry.register("log", AdviceContract::none(), move || {
            let log = Arc::clone(&advice_log);
            Ok(AdviceHandle::builder("log")
                .before(move |jp| {
                    log.lock().push(format!("before {}", jp.descriptor().signature));
                    Ok(())
                })
                .build())
        });
        let (bridge, loader) = bridge_with(registry, vec![work_group("log")]);

        let descriptor = bridge
            .descriptor(&loader, "com.foo.UserService", "doWork()")
            .unwrap();
        let dispatcher = bridge.dispatcher(&loader, &descriptor, None, Vec::new());

        let mut target = |jp: &mut Joinpoint| {
            jp.record_natural_return(Some(Value::new(
                "java.lang.String",
                "done".to_string(),
            )));
            Ok(())
        };
        let outcome = dispatcher.dispatch(&mut target).unwrap();

        assert_eq!(*log.lock(), vec!["before doWork()"]);
        match outcome {
            DispatchOutcome::Return(Some(value)) => {
                assert_eq!(value.downcast_ref::<String>().unwrap(), "done");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_failing_advice_factory_is_skipped() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let registry = Arc::new(AdviceFactoryRegistry::new());
        registry.register("broken", AdviceContract::none(), || {
            Err(WeaverError::AdviceInstantiation {
                aspect: "test-aspect".to_string(),
                advice: "broken".to_string(),
                reason: "dependency missing".to_string(),
            })
        });
        let advice_log = Arc::clone(&log);
        registry.register("working", AdviceContract::none(), move || {
            let log = Arc::clone(&advice_log);
            Ok(AdviceHandle::builder("working")
                .before(move |_jp| {
                    log.lock().push("working".to_string());
                    Ok(())
                })
                .build())
        });

        let groups = vec![
            AspectGroup::new("g1").with_spec(
                AspectSpec::new("a-broken", "broken")
                    .with_order(1)
                    .with_pointcut("execution(* com.foo..*.doWork(..))"),
            ),
            AspectGroup::new("g2").with_spec(
                AspectSpec::new("a-working", "working")
                    .with_order(2)
                    .with_pointcut("execution(* com.foo..*.doWork(..))"),
            ),
        ];
        let (bridge, loader) = bridge_with(registry, groups);

        let descriptor = bridge
            .descriptor(&loader, "com.foo.UserService", "doWork()")
            .unwrap();
        let dispatcher = bridge.dispatcher(&loader, &descriptor, None, Vec::new());

        let mut target = |_jp: &mut Joinpoint| Ok(());
        dispatcher.dispatch(&mut target).unwrap();

        // broken 被跳过，working 照常执行
        assert_eq!(*log.lock(), vec!["working"]);
    }
}
