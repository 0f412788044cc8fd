//! 测试支撑
//!
//! 预置 java.lang 核心层次的内存类型源，谓词与校验规则的测试
//! 都建立在它之上

use std::collections::HashMap;

use crate::types::{
    AnnotationDescription, MethodDescription, MethodModifiers, TypeDescription, TypeSource,
};

/// 内存类型源
///
/// 按名字注册 TypeDescription，describe 返回克隆
#[derive(Debug, Default)]
pub struct FixtureTypeSource {
    types: HashMap<String, TypeDescription>,
}

impl FixtureTypeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置 java.lang 核心类型层次
    ///
    /// 赋值兼容规则（返回类型、throws 声明、致命错误分类）都依赖
    /// 这里的异常层次
    pub fn with_core_types() -> Self {
        let mut source = Self::new();

        source.add_class("java.lang.Object", None, &[]);
        source.add_class("java.lang.String", Some("java.lang.Object"), &[]);
        source.add_class("java.lang.Number", Some("java.lang.Object"), &[]);
        source.add_class("java.lang.Integer", Some("java.lang.Number"), &[]);

        source.add_class("java.lang.Throwable", Some("java.lang.Object"), &[]);
        source.add_class("java.lang.Exception", Some("java.lang.Throwable"), &[]);
        source.add_class(
            "java.lang.RuntimeException",
            Some("java.lang.Exception"),
            &[],
        );
        source.add_class(
            "java.lang.IllegalArgumentException",
            Some("java.lang.RuntimeException"),
            &[],
        );
        source.add_class(
            "java.lang.IllegalStateException",
            Some("java.lang.RuntimeException"),
            &[],
        );
        source.add_class("java.io.IOException", Some("java.lang.Exception"), &[]);

        source.add_class("java.lang.Error", Some("java.lang.Throwable"), &[]);
        source.add_class(
            "java.lang.VirtualMachineError",
            Some("java.lang.Error"),
            &[],
        );
        source.add_class(
            "java.lang.OutOfMemoryError",
            Some("java.lang.VirtualMachineError"),
            &[],
        );
        source.add_class(
            "java.lang.StackOverflowError",
            Some("java.lang.VirtualMachineError"),
            &[],
        );
        source.add_class("java.lang.ThreadDeath", Some("java.lang.Error"), &[]);

        source
    }

    /// 注册完整的类型描述
    pub fn add(&mut self, description: TypeDescription) {
        self.types.insert(description.name.clone(), description);
    }

    /// 注册一个普通类
    pub fn add_class(&mut self, name: &str, super_class: Option<&str>, interfaces: &[&str]) {
        self.add(TypeDescription {
            name: name.to_string(),
            super_class: super_class.map(String::from),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            annotations: Vec::new(),
            type_arguments: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
        });
    }

    /// 注册一个带注解的类
    pub fn add_class_with_annotations(
        &mut self,
        name: &str,
        super_class: Option<&str>,
        interfaces: &[&str],
        annotations: &[&str],
    ) {
        self.add(TypeDescription {
            name: name.to_string(),
            super_class: super_class.map(String::from),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            annotations: annotations
                .iter()
                .map(|a| AnnotationDescription {
                    type_name: a.to_string(),
                })
                .collect(),
            type_arguments: Vec::new(),
            methods: Vec::new(),
            is_interface: false,
        });
    }

    /// 注册一个接口
    pub fn add_interface(&mut self, name: &str, extends: &[&str]) {
        self.add(TypeDescription {
            name: name.to_string(),
            super_class: None,
            interfaces: extends.iter().map(|s| s.to_string()).collect(),
            annotations: Vec::new(),
            type_arguments: Vec::new(),
            methods: Vec::new(),
            is_interface: true,
        });
    }

    /// 注册一个注解类型（可带元注解）
    pub fn add_annotation(&mut self, name: &str, meta_annotations: &[&str]) {
        self.add(TypeDescription {
            name: name.to_string(),
            super_class: None,
            interfaces: Vec::new(),
            annotations: meta_annotations
                .iter()
                .map(|a| AnnotationDescription {
                    type_name: a.to_string(),
                })
                .collect(),
            type_arguments: Vec::new(),
            methods: Vec::new(),
            is_interface: true,
        });
    }

    /// 给已注册的类型追加方法
    pub fn add_method(&mut self, type_name: &str, method: MethodDescription) {
        if let Some(description) = self.types.get_mut(type_name) {
            description.methods.push(method);
        }
    }
}

impl TypeSource for FixtureTypeSource {
    fn describe(&self, name: &str) -> Option<TypeDescription> {
        self.types.get(name).cloned()
    }
}

/// 方法描述的快捷构造
pub fn method(name: &str, parameter_types: &[&str], return_type: &str) -> MethodDescription {
    MethodDescription {
        name: name.to_string(),
        parameter_types: parameter_types.iter().map(|s| s.to_string()).collect(),
        return_type: return_type.to_string(),
        declared_throws: Vec::new(),
        annotations: Vec::new(),
        modifiers: MethodModifiers::default(),
    }
}

/// 带 throws 声明的方法
pub fn method_throws(
    name: &str,
    parameter_types: &[&str],
    return_type: &str,
    throws: &[&str],
) -> MethodDescription {
    let mut description = method(name, parameter_types, return_type);
    description.declared_throws = throws.iter().map(|s| s.to_string()).collect();
    description
}

/// 桥方法
pub fn bridge_method(name: &str, parameter_types: &[&str], return_type: &str) -> MethodDescription {
    let mut description = method(name, parameter_types, return_type);
    description.modifiers.is_bridge = true;
    description.modifiers.is_synthetic = true;
    description
}
