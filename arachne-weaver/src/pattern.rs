//! 模式匹配引擎
//!
//! 把字符串模式编译成高效的名字谓词。模式按语法预分类为
//! match-all（`*`）、前缀（`com.foo..*`）、精确、后缀（`*Exception`）
//! 和复杂模式：前四类只用字符串操作判定，复杂模式才落到正则编译。
//! 编译结果按模式集合缓存，跨类加载器范围复用

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use regex::Regex;

/// 单个名字模式（已分类）
#[derive(Debug, Clone)]
pub enum NamePattern {
    /// `*`
    MatchAll,
    /// `com.foo..*` / `com.foo.*` —— 存储归一化后的前缀 `com.foo.`
    Prefix(String),
    /// 无通配符的精确匹配
    Exact(String),
    /// `*Exception` —— 存储后缀 `Exception`
    Suffix(String),
    /// 需要正则求值的复杂模式
    Complex(Regex),
}

impl NamePattern {
    /// 分类并编译一个原始模式
    ///
    /// 复杂模式的正则编译失败返回 None（调用方告警后丢弃）
    pub fn compile(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw == "*" {
            return Some(NamePattern::MatchAll);
        }
        if let Some(base) = raw.strip_suffix("..*") {
            if !base.is_empty() && !base.contains('*') {
                return Some(NamePattern::Prefix(format!("{}.", base)));
            }
        }
        if let Some(base) = raw.strip_suffix(".*") {
            if !base.is_empty() && !base.contains('*') {
                return Some(NamePattern::Prefix(format!("{}.", base)));
            }
        }
        if let Some(suffix) = raw.strip_prefix('*') {
            if !suffix.is_empty() && !suffix.contains('*') {
                return Some(NamePattern::Suffix(suffix.to_string()));
            }
        }
        if !raw.contains('*') && !raw.contains('?') {
            return Some(NamePattern::Exact(raw.to_string()));
        }

        Self::compile_complex(raw)
    }

    /// 复杂模式：把 `*`/`?`/`..` 翻译成锚定正则
    ///
    /// `..` 匹配任意包段序列（含空序列）
    fn compile_complex(raw: &str) -> Option<Self> {
        let mut pattern = String::with_capacity(raw.len() + 8);
        pattern.push('^');
        let mut chars = raw.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '*' => pattern.push_str("[^.]*"),
                '?' => pattern.push('.'),
                '.' if chars.peek() == Some(&'.') => {
                    chars.next();
                    pattern.push_str("(\\..*)?\\.");
                }
                other => pattern.push_str(&regex::escape(&other.to_string())),
            }
        }
        pattern.push('$');

        match Regex::new(&pattern) {
            Ok(regex) => Some(NamePattern::Complex(regex)),
            Err(e) => {
                tracing::warn!("Failed to compile pattern '{}' as regex: {}", raw, e);
                None
            }
        }
    }

    /// 是否是复杂模式（分类判断，不编译）
    pub fn is_complex(raw: &str) -> bool {
        let raw = raw.trim();
        if raw == "*" || raw.is_empty() {
            return false;
        }
        if let Some(base) = raw.strip_suffix("..*") {
            if !base.is_empty() && !base.contains('*') {
                return false;
            }
        }
        if let Some(base) = raw.strip_suffix(".*") {
            if !base.is_empty() && !base.contains('*') {
                return false;
            }
        }
        if let Some(suffix) = raw.strip_prefix('*') {
            if !suffix.is_empty() && !suffix.contains('*') {
                return false;
            }
        }
        raw.contains('*') || raw.contains('?')
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            NamePattern::MatchAll => true,
            NamePattern::Prefix(prefix) => candidate.starts_with(prefix.as_str()),
            NamePattern::Exact(exact) => candidate == exact,
            NamePattern::Suffix(suffix) => candidate.ends_with(suffix.as_str()),
            NamePattern::Complex(regex) => regex.is_match(candidate),
        }
    }
}

/// 编译后的名字匹配器
#[derive(Debug)]
pub enum NameMatcher {
    /// 恒真（模式集合里出现了 `*`）
    Any,
    /// 恒假（空模式集合）
    None,
    /// 逐模式判定
    Patterns(Vec<NamePattern>),
}

impl NameMatcher {
    pub fn any() -> Arc<Self> {
        Arc::new(NameMatcher::Any)
    }

    pub fn none() -> Arc<Self> {
        Arc::new(NameMatcher::None)
    }

    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            NameMatcher::Any => true,
            NameMatcher::None => false,
            NameMatcher::Patterns(patterns) => patterns.iter().any(|p| p.matches(candidate)),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, NameMatcher::Any)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, NameMatcher::None)
    }
}

/// 编译缓存键：模式集合 + 策略门
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CompileKey {
    patterns: Vec<String>,
    accept_match_all: bool,
    accept_complex: bool,
}

/// 模式编译器
///
/// 相同的模式集合（按集合相等性）只编译一次，结果跨类加载器范围共享
pub struct PatternCompiler {
    cache: Mutex<HashMap<CompileKey, Arc<NameMatcher>>>,
}

impl PatternCompiler {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// 编译一条规则的模式集合
    ///
    /// `accept_match_all` / `accept_complex` 是策略门：规则不允许的
    /// 模式被丢弃并告警，而不是报错——避免意外放开危险策略
    /// （例如 exclude 规则被 `*` 整体清空），同时保持非致命
    pub fn compile(
        &self,
        rule: &str,
        patterns: &[String],
        accept_match_all: bool,
        accept_complex: bool,
    ) -> Arc<NameMatcher> {
        if patterns.is_empty() {
            return NameMatcher::none();
        }

        let key = CompileKey {
            patterns: patterns.to_vec(),
            accept_match_all,
            accept_complex,
        };

        if let Some(matcher) = self.cache.lock().get(&key) {
            return Arc::clone(matcher);
        }

        let matcher = self.compile_uncached(rule, patterns, accept_match_all, accept_complex);
        self.cache
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::clone(&matcher));
        matcher
    }

    fn compile_uncached(
        &self,
        rule: &str,
        patterns: &[String],
        accept_match_all: bool,
        accept_complex: bool,
    ) -> Arc<NameMatcher> {
        // match-all 短路：直接返回恒真匹配器，完全不触发模式编译
        if accept_match_all && patterns.iter().any(|p| p.trim() == "*") {
            return NameMatcher::any();
        }

        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let raw_trimmed = raw.trim();
            if raw_trimmed == "*" {
                tracing::warn!(
                    "Rule '{}' does not accept the match-all pattern, dropping '*'",
                    rule
                );
                continue;
            }
            if NamePattern::is_complex(raw_trimmed) && !accept_complex {
                tracing::warn!(
                    "Rule '{}' does not accept complex patterns, dropping '{}'",
                    rule,
                    raw_trimmed
                );
                continue;
            }
            if let Some(pattern) = NamePattern::compile(raw_trimmed) {
                compiled.push(pattern);
            }
        }

        if compiled.is_empty() {
            NameMatcher::none()
        } else {
            Arc::new(NameMatcher::Patterns(compiled))
        }
    }

    /// 缓存的编译结果数（观测用）
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new()
    }
}
