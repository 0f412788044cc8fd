//! 织入安装
//!
//! 底层字节码改写/插桩安装器是一个黑盒外部协作者：引擎把匹配
//! 与转换回调配置给它，由它在类加载路径上发起 matches/transform
//! 调用。Weaver 门面负责启动序列（配置 → 日志 → 上下文 → 切面组
//! 扫描 → 安装）与关闭时的资源释放

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arachne_core::{Environment, EventListener, EventMulticaster, LoggingConfig, TaskExecutor};

use crate::aspect::AdviceFactoryRegistry;
use crate::bridge::RuntimeBridge;
use crate::context::GlobalContext;
use crate::error::{WeaverError, WeaverResult};
use crate::events::WeaverShutdownEvent;
use crate::matcher::WeavingMatcher;
use crate::pointcut::ExpressionCompiler;
use crate::registry::{load_groups, AspectGroup};
use crate::types::TypeSource;

/// 织入回调集
///
/// 安装器持有它并在插桩路径上回调引擎
pub struct WeaverCallbacks {
    matcher: Arc<WeavingMatcher>,
    bridge: Arc<RuntimeBridge>,
}

impl WeaverCallbacks {
    pub fn matcher(&self) -> &Arc<WeavingMatcher> {
        &self.matcher
    }

    pub fn bridge(&self) -> &Arc<RuntimeBridge> {
        &self.bridge
    }
}

/// 织入安装器（外部协作者）
///
/// 引擎从不主动发起 matches/transform，只应答安装器的回调
pub trait WeaverInstallation: Send + Sync {
    /// 安装插桩，之后安装器开始通过回调询问引擎
    fn install(&self, callbacks: Arc<WeaverCallbacks>) -> WeaverResult<()>;

    /// 卸载插桩（尽力而为）
    fn uninstall(&self) -> WeaverResult<()>;
}

/// 织入引擎门面
pub struct Weaver {
    global: Arc<GlobalContext>,
    callbacks: Arc<WeaverCallbacks>,
    installation: Option<Arc<dyn WeaverInstallation>>,
    started: AtomicBool,
}

impl Weaver {
    pub fn builder() -> WeaverBuilder {
        WeaverBuilder::default()
    }

    pub fn global(&self) -> &Arc<GlobalContext> {
        &self.global
    }

    pub fn callbacks(&self) -> &Arc<WeaverCallbacks> {
        &self.callbacks
    }

    pub fn matcher(&self) -> &Arc<WeavingMatcher> {
        self.callbacks.matcher()
    }

    pub fn bridge(&self) -> &Arc<RuntimeBridge> {
        self.callbacks.bridge()
    }

    /// 启动：把回调安装到插桩层
    pub fn start(&self) -> WeaverResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            tracing::warn!("Weaver already started, ignoring duplicate start");
            return Ok(());
        }

        if let Some(installation) = &self.installation {
            installation
                .install(Arc::clone(&self.callbacks))
                .map_err(|e| WeaverError::Installation(e.to_string()))?;
            tracing::info!("🕸️ Weaver installed and answering instrumentation callbacks");
        } else {
            tracing::info!("🕸️ Weaver started without an installation (embedded mode)");
        }
        Ok(())
    }

    /// 关闭：卸载插桩并释放所有加载器上下文
    ///
    /// 织入决策不可撤销——已转换的类型保持原样，这里只释放
    /// 对外可见的资源
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(installation) = &self.installation {
            if let Err(e) = installation.uninstall() {
                tracing::warn!("Weaver installation uninstall failed: {}", e);
            }
        }

        self.global
            .multicaster()
            .multicast(Arc::new(WeaverShutdownEvent::new()));
        self.global.close();
        tracing::info!("🕸️ Weaver shut down");
    }
}

/// 织入引擎构建器
#[derive(Default)]
pub struct WeaverBuilder {
    environment: Option<Arc<Environment>>,
    type_source: Option<Arc<dyn TypeSource>>,
    expression_compiler: Option<Arc<dyn ExpressionCompiler>>,
    advice_registry: Option<Arc<AdviceFactoryRegistry>>,
    executor: Option<Arc<TaskExecutor>>,
    installation: Option<Arc<dyn WeaverInstallation>>,
    listeners: Vec<Arc<dyn EventListener>>,
    groups: Vec<AspectGroup>,
    skip_registered_groups: bool,
    init_logging: bool,
}

impl WeaverBuilder {
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

    pub fn executor(mut self, executor: Arc<TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn installation(mut self, installation: Arc<dyn WeaverInstallation>) -> Self {
        self.installation = Some(installation);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
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

    /// 不加载 inventory 注册的切面组（测试用）
    pub fn skip_registered_groups(mut self) -> Self {
        self.skip_registered_groups = true;
        self
    }

    /// 在构建时初始化日志系统（默认不初始化，宿主通常已有订阅者）
    pub fn init_logging(mut self) -> Self {
        self.init_logging = true;
        self
    }

    pub fn build(self) -> WeaverResult<Weaver> {
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(Environment::new()));

        if self.init_logging {
            if let Err(e) = LoggingConfig::from_environment(&environment).init() {
                // 宿主可能已经装好订阅者，双重初始化不致命
                tracing::debug!("Logging already initialized: {}", e);
            }
        }

        // 编译期注册的切面组在程序化注册的组之前
        let mut groups = if self.skip_registered_groups {
            Vec::new()
        } else {
            load_groups()
        };
        groups.extend(self.groups);

        let multicaster = Arc::new(EventMulticaster::new());
        for listener in self.listeners {
            multicaster.add_listener(listener);
        }

        let mut builder = GlobalContext::builder()
            .environment(environment)
            .multicaster(multicaster)
            .groups(groups);
        if let Some(source) = self.type_source {
            builder = builder.type_source(source);
        }
        if let Some(compiler) = self.expression_compiler {
            builder = builder.expression_compiler(compiler);
        }
        if let Some(registry) = self.advice_registry {
            builder = builder.advice_registry(registry);
        }
        if let Some(executor) = self.executor {
            builder = builder.executor(executor);
        }
        let global = builder.build()?;

        let matcher = Arc::new(WeavingMatcher::new(Arc::clone(&global)));
        let bridge = Arc::new(RuntimeBridge::new(Arc::clone(&matcher)));
        let callbacks = Arc::new(WeaverCallbacks { matcher, bridge });

        Ok(Weaver {
            global,
            callbacks,
            installation: self.installation,
            started: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureTypeSource;
    use arachne_core::Event;
    use parking_lot::Mutex;

    struct RecordingInstallation {
        installed: AtomicBool,
        uninstalled: AtomicBool,
    }

    impl RecordingInstallation {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                installed: AtomicBool::new(false),
                uninstalled: AtomicBool::new(false),
            })
        }
    }

    impl WeaverInstallation for RecordingInstallation {
        fn install(&self, callbacks: Arc<WeaverCallbacks>) -> WeaverResult<()> {
            assert!(Arc::strong_count(callbacks.matcher()) >= 1);
            self.installed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn uninstall(&self) -> WeaverResult<()> {
            self.uninstalled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct ShutdownListener {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl EventListener for ShutdownListener {
        fn on_event(&self, event: Arc<dyn Event>) {
            self.events.lock().push(event.event_name().to_string());
        }

        fn listener_name(&self) -> &str {
            "ShutdownListener"
        }
    }

    fn weaver_with_installation(installation: Arc<RecordingInstallation>) -> Weaver {
        Weaver::builder()
            .type_source(Arc::new(FixtureTypeSource::with_core_types()))
            .advice_registry(Arc::new(AdviceFactoryRegistry::new()))
            .skip_registered_groups()
            .installation(installation)
            .build()
            .unwrap()
    }

    #[test]
    fn test_start_installs_callbacks() {
        let installation = RecordingInstallation::new();
        let weaver = weaver_with_installation(Arc::clone(&installation));

        weaver.start().unwrap();
        assert!(installation.installed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_start_is_noop() {
        let installation = RecordingInstallation::new();
        let weaver = weaver_with_installation(Arc::clone(&installation));

        weaver.start().unwrap();
        weaver.start().unwrap();
        assert!(installation.installed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_uninstalls_and_publishes_event() {
        let installation = RecordingInstallation::new();
        let events = Arc::new(Mutex::new(Vec::new()));

        let weaver = Weaver::builder()
            .type_source(Arc::new(FixtureTypeSource::with_core_types()))
            .advice_registry(Arc::new(AdviceFactoryRegistry::new()))
            .skip_registered_groups()
            .installation(Arc::clone(&installation) as Arc<dyn WeaverInstallation>)
            .listener(Arc::new(ShutdownListener {
                events: Arc::clone(&events),
            }))
            .build()
            .unwrap();

        weaver.start().unwrap();
        weaver.shutdown();

        assert!(installation.uninstalled.load(Ordering::SeqCst));
        assert!(events.lock().contains(&"WeaverShutdownEvent".to_string()));
    }

    #[test]
    fn test_shutdown_without_start_is_noop() {
        let installation = RecordingInstallation::new();
        let weaver = weaver_with_installation(Arc::clone(&installation));

        weaver.shutdown();
        assert!(!installation.uninstalled.load(Ordering::SeqCst));
    }
}
