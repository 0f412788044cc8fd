//! 类型世界
//!
//! 切点求值需要的富类型元数据（超类型、注解、泛型、异常声明）都从
//! 这里解析。底层的反射类型描述由宿主运行时通过 TypeSource 提供，
//! TypeWorld 在其上做按类型记忆化，并支持在完成匹配后逐类型释放
//! 缓存以约束长生命周期进程的内存增长

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{WeaverError, WeaverResult};

/// 构造器的方法名
pub const CONSTRUCTOR_NAME: &str = "<init>";
/// 类型初始化器的方法名
pub const TYPE_INITIALIZER_NAME: &str = "<clinit>";
/// void 返回类型
pub const VOID_TYPE: &str = "void";

/// 方法修饰符
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodModifiers {
    pub is_static: bool,
    pub is_abstract: bool,
    /// 编译器生成的桥方法
    pub is_bridge: bool,
    pub is_synthetic: bool,
}

/// 方法描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescription {
    /// 方法名（构造器为 `<init>`，类型初始化器为 `<clinit>`）
    pub name: String,
    /// 参数类型（擦除后的二进制名）
    pub parameter_types: Vec<String>,
    /// 返回类型（void 方法为 `void`）
    pub return_type: String,
    /// throws 声明的受检异常
    pub declared_throws: Vec<String>,
    /// 方法声明上的注解
    pub annotations: Vec<String>,
    pub modifiers: MethodModifiers,
}

impl MethodDescription {
    /// 方法签名字符串：`name(paramA,paramB)`
    ///
    /// 运行时桥接层用它作为派发描述符的查找键
    pub fn signature(&self) -> String {
        format!("{}({})", self.name, self.parameter_types.join(","))
    }

    pub fn is_constructor(&self) -> bool {
        self.name == CONSTRUCTOR_NAME
    }

    pub fn is_type_initializer(&self) -> bool {
        self.name == TYPE_INITIALIZER_NAME
    }

    pub fn is_void(&self) -> bool {
        self.return_type == VOID_TYPE
    }
}

/// 注解描述
///
/// 注解类型本身也是类型，元注解通过解析注解类型获得
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationDescription {
    pub type_name: String,
}

/// 类型描述（宿主反射 API 提供的原始形态）
#[derive(Debug, Clone)]
pub struct TypeDescription {
    /// 二进制名，例如 `com.foo.Bar`
    pub name: String,
    pub super_class: Option<String>,
    pub interfaces: Vec<String>,
    pub annotations: Vec<AnnotationDescription>,
    /// 泛型实参（已实例化的参数化类型）
    pub type_arguments: Vec<String>,
    pub methods: Vec<MethodDescription>,
    pub is_interface: bool,
}

/// 反射类型描述提供者（外部协作者）
///
/// 宿主运行时实现此 trait，把它的类型系统暴露给织入引擎
pub trait TypeSource: Send + Sync {
    /// 按二进制名描述一个类型，未知类型返回 None
    fn describe(&self, name: &str) -> Option<TypeDescription>;
}

/// 已解析类型
///
/// 描述 + 超类型传递闭包，一次计算后供所有谓词求值使用
#[derive(Debug)]
pub struct ResolvedType {
    description: TypeDescription,
    /// 超类型传递闭包（类 + 接口，不含自身）
    supertypes: Vec<String>,
}

impl ResolvedType {
    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &TypeDescription {
        &self.description
    }

    pub fn methods(&self) -> &[MethodDescription] {
        &self.description.methods
    }

    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    pub fn type_arguments(&self) -> &[String] {
        &self.description.type_arguments
    }

    /// 自身或任一超类型的名字满足谓词
    pub fn any_type_name<F: Fn(&str) -> bool>(&self, predicate: F) -> bool {
        predicate(&self.description.name) || self.supertypes.iter().any(|s| predicate(s))
    }

    /// 按签名查找方法
    pub fn method_by_signature(&self, signature: &str) -> Option<&MethodDescription> {
        self.description
            .methods
            .iter()
            .find(|m| m.signature() == signature)
    }

    /// 查找桥方法对应的代表方法
    ///
    /// 桥方法与代表方法同名、参数个数相同、且桥方法的参数/返回类型
    /// 是代表方法对应类型的擦除（宽化）形式。通知链必须挂到代表方法
    /// 上，保证每个逻辑覆写只触发一次
    pub fn representative_of<'a>(
        &'a self,
        bridge: &MethodDescription,
        world: &TypeWorld,
    ) -> Option<&'a MethodDescription> {
        if !bridge.modifiers.is_bridge {
            return None;
        }
        self.description.methods.iter().find(|candidate| {
            !candidate.modifiers.is_bridge
                && candidate.name == bridge.name
                && candidate.parameter_types.len() == bridge.parameter_types.len()
                && candidate
                    .parameter_types
                    .iter()
                    .zip(bridge.parameter_types.iter())
                    .all(|(concrete, erased)| {
                        concrete == erased || world.is_assignable(erased, concrete)
                    })
                && (candidate.return_type == bridge.return_type
                    || world.is_assignable(&bridge.return_type, &candidate.return_type))
        })
    }
}

/// 类型世界门面
///
/// 对 TypeSource 做按名记忆化；`cache=false` 的探测性解析不会污染
/// 长生命周期缓存，匹配结束后按类型调用 `release` 归还内存
pub struct TypeWorld {
    source: Arc<dyn TypeSource>,
    cache: RwLock<HashMap<String, Arc<ResolvedType>>>,
}

impl TypeWorld {
    pub fn new(source: Arc<dyn TypeSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// 解析类型
    ///
    /// `cache` 为 false 时用于仅验证的探测，结果不进入缓存
    pub fn resolve(&self, name: &str, cache: bool) -> WeaverResult<Arc<ResolvedType>> {
        if let Some(resolved) = self.cache.read().get(name) {
            return Ok(Arc::clone(resolved));
        }

        let description = self
            .source
            .describe(name)
            .ok_or_else(|| WeaverError::TypeResolution(name.to_string()))?;

        let supertypes = self.collect_supertypes(&description);
        let resolved = Arc::new(ResolvedType {
            description,
            supertypes,
        });

        if cache {
            self.cache
                .write()
                .entry(name.to_string())
                .or_insert_with(|| Arc::clone(&resolved));
        }

        Ok(resolved)
    }

    /// 释放单个类型的缓存条目
    pub fn release(&self, name: &str) {
        if self.cache.write().remove(name).is_some() {
            tracing::trace!("Released type world cache entry for '{}'", name);
        }
    }

    /// 当前缓存的类型数（观测用）
    pub fn cached_count(&self) -> usize {
        self.cache.read().len()
    }

    /// 清空全部缓存
    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// `to` 是否可从 `from` 赋值（to.isAssignableFrom(from) 语义）
    ///
    /// 未知类型按不可赋值处理
    pub fn is_assignable(&self, to: &str, from: &str) -> bool {
        if to == from {
            return true;
        }
        // 超类型闭包直接从 TypeSource 遍历，不经过缓存，
        // 避免验证探测引入长期驻留的条目
        match self.source.describe(from) {
            Some(description) => self.collect_supertypes(&description).iter().any(|s| s == to),
            None => false,
        }
    }

    /// 类型是否带指定注解
    ///
    /// `meta` 为 true 时同时检查元注解（注解类型自身的注解，带环保护）
    pub fn has_annotation(&self, resolved: &ResolvedType, annotation: &str, meta: bool) -> bool {
        let direct = resolved
            .description
            .annotations
            .iter()
            .any(|a| a.type_name == annotation);
        if direct || !meta {
            return direct;
        }

        let mut visited = HashSet::new();
        resolved
            .description
            .annotations
            .iter()
            .any(|a| self.meta_annotated(&a.type_name, annotation, &mut visited))
    }

    /// 注解名列表中是否存在指定注解（方法注解用）
    ///
    /// `meta` 为 true 时沿元注解继续查找
    pub fn annotation_present(&self, annotations: &[String], wanted: &str, meta: bool) -> bool {
        if annotations.iter().any(|a| a == wanted) {
            return true;
        }
        if !meta {
            return false;
        }
        let mut visited = HashSet::new();
        annotations
            .iter()
            .any(|a| self.meta_annotated(a, wanted, &mut visited))
    }

    fn meta_annotated(&self, annotation_type: &str, wanted: &str, visited: &mut HashSet<String>) -> bool {
        if !visited.insert(annotation_type.to_string()) {
            return false;
        }
        let Some(description) = self.source.describe(annotation_type) else {
            return false;
        };
        description.annotations.iter().any(|a| {
            a.type_name == wanted || self.meta_annotated(&a.type_name, wanted, visited)
        })
    }

    /// 计算超类型传递闭包（类 + 接口，不含自身，去重保序）
    fn collect_supertypes(&self, description: &TypeDescription) -> Vec<String> {
        let mut closure = Vec::new();
        let mut seen = HashSet::new();
        let mut pending: Vec<String> = Vec::new();

        if let Some(super_class) = &description.super_class {
            pending.push(super_class.clone());
        }
        pending.extend(description.interfaces.iter().cloned());

        while let Some(name) = pending.pop() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(parent) = self.source.describe(&name) {
                if let Some(super_class) = &parent.super_class {
                    pending.push(super_class.clone());
                }
                pending.extend(parent.interfaces.iter().cloned());
            }
            closure.push(name);
        }

        closure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FixtureTypeSource;

    fn world() -> TypeWorld {
        let mut source = FixtureTypeSource::with_core_types();
        source.add_class("com.foo.Base", Some("java.lang.Object"), &[]);
        source.add_class("com.foo.Derived", Some("com.foo.Base"), &["com.foo.Marker"]);
        source.add_interface("com.foo.Marker", &[]);
        TypeWorld::new(Arc::new(source))
    }

    #[test]
    fn test_resolve_supertype_closure() {
        let world = world();
        let resolved = world.resolve("com.foo.Derived", true).unwrap();

        assert!(resolved.supertypes().contains(&"com.foo.Base".to_string()));
        assert!(resolved.supertypes().contains(&"java.lang.Object".to_string()));
        assert!(resolved.supertypes().contains(&"com.foo.Marker".to_string()));
    }

    #[test]
    fn test_resolve_unknown_type() {
        let world = world();
        assert!(matches!(
            world.resolve("com.missing.Type", true),
            Err(WeaverError::TypeResolution(_))
        ));
    }

    #[test]
    fn test_no_cache_probe_does_not_populate() {
        let world = world();
        world.resolve("com.foo.Base", false).unwrap();
        assert_eq!(world.cached_count(), 0);

        world.resolve("com.foo.Base", true).unwrap();
        assert_eq!(world.cached_count(), 1);
    }

    #[test]
    fn test_release_cache_entry() {
        let world = world();
        world.resolve("com.foo.Base", true).unwrap();
        world.resolve("com.foo.Derived", true).unwrap();
        assert_eq!(world.cached_count(), 2);

        world.release("com.foo.Base");
        assert_eq!(world.cached_count(), 1);
    }

    #[test]
    fn test_is_assignable() {
        let world = world();
        assert!(world.is_assignable("com.foo.Base", "com.foo.Derived"));
        assert!(world.is_assignable("java.lang.Object", "com.foo.Derived"));
        assert!(world.is_assignable("com.foo.Marker", "com.foo.Derived"));
        assert!(!world.is_assignable("com.foo.Derived", "com.foo.Base"));
        assert!(!world.is_assignable("com.foo.Base", "com.unknown.Type"));
    }

    #[test]
    fn test_exception_hierarchy_from_core_types() {
        let world = world();
        assert!(world.is_assignable("java.lang.Throwable", "java.io.IOException"));
        assert!(world.is_assignable("java.lang.Exception", "java.lang.RuntimeException"));
        assert!(world.is_assignable(
            "java.lang.VirtualMachineError",
            "java.lang.OutOfMemoryError"
        ));
        assert!(!world.is_assignable("java.lang.RuntimeException", "java.io.IOException"));
    }

    #[test]
    fn test_meta_annotations() {
        let mut source = FixtureTypeSource::with_core_types();
        source.add_annotation("com.foo.Service", &["com.foo.Component"]);
        source.add_annotation("com.foo.Component", &[]);
        source.add_class_with_annotations(
            "com.foo.UserService",
            Some("java.lang.Object"),
            &[],
            &["com.foo.Service"],
        );
        let world = TypeWorld::new(Arc::new(source));

        let resolved = world.resolve("com.foo.UserService", true).unwrap();
        assert!(world.has_annotation(&resolved, "com.foo.Service", false));
        assert!(!world.has_annotation(&resolved, "com.foo.Component", false));
        assert!(world.has_annotation(&resolved, "com.foo.Component", true));
    }
}
