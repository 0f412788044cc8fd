//! 切面组注册表
//!
//! 切面按组声明：一个组带自己的类型 include/exclude 模式和一批
//! AspectSpec。组通过 inventory 在编译期收集，或在启动时程序化
//! 注册。批量解析时每个组是一个独立的扇出任务，组间无顺序保证，
//! 单条通知链内的顺序在汇合后按排序规则重建

use std::sync::Arc;

use crate::advisor::Advisor;
use crate::aspect::AspectSpec;

/// 切面组
#[derive(Debug, Clone, Default)]
pub struct AspectGroup {
    pub name: String,
    /// 组级类型 include 模式（空 = 继承全局）
    pub type_include: Vec<String>,
    /// 组级类型 exclude 模式（与全局取并集）
    pub type_exclude: Vec<String>,
    pub specs: Vec<AspectSpec>,
}

impl AspectGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_spec(mut self, spec: AspectSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn with_type_include(mut self, patterns: Vec<String>) -> Self {
        self.type_include = patterns;
        self
    }

    pub fn with_type_exclude(mut self, patterns: Vec<String>) -> Self {
        self.type_exclude = patterns;
        self
    }
}

/// inventory 收集的切面组注册项
pub struct AspectGroupSubmission {
    pub create: fn() -> AspectGroup,
}

inventory::collect!(AspectGroupSubmission);

/// 从全局注册表加载所有切面组
pub fn load_groups() -> Vec<AspectGroup> {
    let mut groups = Vec::new();
    for submission in inventory::iter::<AspectGroupSubmission> {
        let group = (submission.create)();
        tracing::debug!(
            "  ├─ Loading aspect group '{}' with {} spec(s)",
            group.name,
            group.specs.len()
        );
        groups.push(group);
    }
    if !groups.is_empty() {
        tracing::info!("Loaded {} aspect group(s) from registry", groups.len());
    }
    groups
}

/// 对单条通知链排序并去重
///
/// 排序：order 升序，平局按发现顺序（组序号, 组内序号）；
/// 同一连接点上重复的通知（同一 advice 标识符）只保留第一个
pub fn order_chain(mut advisors: Vec<Arc<Advisor>>) -> Vec<Arc<Advisor>> {
    advisors.sort_by(|a, b| {
        a.order()
            .cmp(&b.order())
            .then_with(|| a.discovery().cmp(&b.discovery()))
    });

    let mut seen = std::collections::HashSet::new();
    advisors.retain(|advisor| seen.insert(advisor.advice_id().to_string()));
    advisors
}
