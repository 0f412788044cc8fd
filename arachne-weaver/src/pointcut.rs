//! 切点
//!
//! 切点是（加载器谓词 × 类型谓词 × 方法谓词）三元组：任一轴缺省
//! 表示该轴恒真，但用于织入的切点必须带类型谓词或方法谓词。
//! 表达式编译器是一个外部协作者接缝，默认实现支持
//! `execution` / `within` / `@within` / `@annotation` 与 `&&`/`||`/`!` 组合

use std::sync::Arc;

use crate::error::{WeaverError, WeaverResult};
use crate::pattern::{NameMatcher, NamePattern};
use crate::types::{MethodDescription, ResolvedType, TypeWorld};

/// 参数列表模式
#[derive(Debug, Clone)]
pub enum ParamsPattern {
    /// `(..)` —— 任意参数
    Any,
    /// 精确的参数类型模式列表（`()` 为空列表）
    Exact(Vec<NamePattern>),
}

impl ParamsPattern {
    fn matches(&self, parameter_types: &[String]) -> bool {
        match self {
            ParamsPattern::Any => true,
            ParamsPattern::Exact(patterns) => {
                patterns.len() == parameter_types.len()
                    && patterns
                        .iter()
                        .zip(parameter_types.iter())
                        .all(|(p, t)| p.matches(t))
            }
        }
    }
}

/// 切点表达式
///
/// 对（类型, 方法）联合求值；`matches_type` 是保守的类型层投影，
/// 用于快速匹配阶段收缩候选集
#[derive(Debug, Clone)]
pub enum PointcutExpression {
    /// `execution(ret declaring.method(params))`
    Execution {
        return_pattern: NamePattern,
        declaring: Arc<NameMatcher>,
        method: Arc<NameMatcher>,
        params: ParamsPattern,
    },

    /// `within(type-pattern)`
    Within(Arc<NameMatcher>),

    /// `@within(annotation-type)` —— 类型（含元注解）带指定注解
    AnnotatedType(String),

    /// `@annotation(annotation-type)` —— 方法带指定注解
    AnnotatedMethod(String),

    /// 程序化构造：按类型名匹配
    TypeName(Arc<NameMatcher>),

    /// 程序化构造：按方法名匹配
    MethodName(Arc<NameMatcher>),

    And(Box<PointcutExpression>, Box<PointcutExpression>),
    Or(Box<PointcutExpression>, Box<PointcutExpression>),
    Not(Box<PointcutExpression>),
}

impl PointcutExpression {
    /// 完整求值：方法是否命中
    pub fn matches_method(
        &self,
        world: &TypeWorld,
        resolved: &ResolvedType,
        method: &MethodDescription,
    ) -> bool {
        match self {
            PointcutExpression::Execution {
                return_pattern,
                declaring,
                method: method_matcher,
                params,
            } => {
                return_pattern.matches(&method.return_type)
                    && method_matcher.matches(&method.name)
                    && resolved.any_type_name(|name| declaring.matches(name))
                    && params.matches(&method.parameter_types)
            }
            PointcutExpression::Within(matcher) => matcher.matches(resolved.name()),
            PointcutExpression::AnnotatedType(annotation) => {
                world.has_annotation(resolved, annotation, true)
            }
            PointcutExpression::AnnotatedMethod(annotation) => {
                world.annotation_present(&method.annotations, annotation, true)
            }
            PointcutExpression::TypeName(matcher) => matcher.matches(resolved.name()),
            PointcutExpression::MethodName(matcher) => matcher.matches(&method.name),
            PointcutExpression::And(left, right) => {
                left.matches_method(world, resolved, method)
                    && right.matches_method(world, resolved, method)
            }
            PointcutExpression::Or(left, right) => {
                left.matches_method(world, resolved, method)
                    || right.matches_method(world, resolved, method)
            }
            PointcutExpression::Not(inner) => !inner.matches_method(world, resolved, method),
        }
    }

    /// 类型层投影（快速匹配）
    ///
    /// 方法层成分在类型层不可判定，保守地返回 true；
    /// 返回 false 意味着该类型的任何方法都不可能命中
    pub fn matches_type(&self, world: &TypeWorld, resolved: &ResolvedType) -> bool {
        match self {
            PointcutExpression::Execution { declaring, .. } => {
                resolved.any_type_name(|name| declaring.matches(name))
            }
            PointcutExpression::Within(matcher) | PointcutExpression::TypeName(matcher) => {
                matcher.matches(resolved.name())
            }
            PointcutExpression::AnnotatedType(annotation) => {
                world.has_annotation(resolved, annotation, true)
            }
            PointcutExpression::AnnotatedMethod(_) | PointcutExpression::MethodName(_) => true,
            PointcutExpression::And(left, right) => {
                left.matches_type(world, resolved) && right.matches_type(world, resolved)
            }
            PointcutExpression::Or(left, right) => {
                left.matches_type(world, resolved) || right.matches_type(world, resolved)
            }
            PointcutExpression::Not(inner) => {
                if inner.is_type_only() {
                    !inner.matches_type(world, resolved)
                } else {
                    true
                }
            }
        }
    }

    /// 表达式是否只含类型层成分（Not 投影需要）
    fn is_type_only(&self) -> bool {
        match self {
            PointcutExpression::Within(_)
            | PointcutExpression::AnnotatedType(_)
            | PointcutExpression::TypeName(_) => true,
            PointcutExpression::Execution { .. }
            | PointcutExpression::AnnotatedMethod(_)
            | PointcutExpression::MethodName(_) => false,
            PointcutExpression::And(left, right) | PointcutExpression::Or(left, right) => {
                left.is_type_only() && right.is_type_only()
            }
            PointcutExpression::Not(inner) => inner.is_type_only(),
        }
    }
}

/// 切点
#[derive(Debug, Clone)]
pub struct Pointcut {
    /// 类加载器谓词（按加载器名），缺省恒真
    loader: Option<Arc<NameMatcher>>,
    /// 类型/方法谓词
    expression: Option<Arc<PointcutExpression>>,
}

impl Pointcut {
    pub fn builder() -> PointcutBuilder {
        PointcutBuilder::default()
    }

    pub fn from_expression(expression: PointcutExpression) -> Self {
        Self {
            loader: None,
            expression: Some(Arc::new(expression)),
        }
    }

    /// 校验织入要求：必须带类型谓词或方法谓词
    pub fn validate(&self, owner: &str) -> WeaverResult<()> {
        if self.expression.is_none() {
            return Err(WeaverError::InvalidPointcut(owner.to_string()));
        }
        Ok(())
    }

    pub fn matches_loader(&self, loader_name: &str) -> bool {
        match &self.loader {
            Some(matcher) => matcher.matches(loader_name),
            None => true,
        }
    }

    /// 类型层快速匹配
    pub fn fast_matches_type(&self, world: &TypeWorld, resolved: &ResolvedType) -> bool {
        match &self.expression {
            Some(expression) => expression.matches_type(world, resolved),
            None => true,
        }
    }

    /// 方法层完整匹配
    pub fn matches_method(
        &self,
        world: &TypeWorld,
        resolved: &ResolvedType,
        method: &MethodDescription,
    ) -> bool {
        match &self.expression {
            Some(expression) => expression.matches_method(world, resolved, method),
            None => false,
        }
    }
}

/// 切点构建器（程序化构造）
#[derive(Default)]
pub struct PointcutBuilder {
    loader: Option<Arc<NameMatcher>>,
    expression: Option<PointcutExpression>,
}

impl PointcutBuilder {
    pub fn loader(mut self, matcher: Arc<NameMatcher>) -> Self {
        self.loader = Some(matcher);
        self
    }

    pub fn types(self, matcher: Arc<NameMatcher>) -> Self {
        self.and(PointcutExpression::TypeName(matcher))
    }

    pub fn methods(self, matcher: Arc<NameMatcher>) -> Self {
        self.and(PointcutExpression::MethodName(matcher))
    }

    pub fn expression(self, expression: PointcutExpression) -> Self {
        self.and(expression)
    }

    fn and(mut self, expression: PointcutExpression) -> Self {
        self.expression = Some(match self.expression.take() {
            Some(existing) => PointcutExpression::And(Box::new(existing), Box::new(expression)),
            None => expression,
        });
        self
    }

    pub fn build(self) -> Pointcut {
        Pointcut {
            loader: self.loader,
            expression: self.expression.map(Arc::new),
        }
    }
}

/// 形参（通知方法的命名/类型化参数，绑定元数据）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormalParameter {
    pub name: String,
    pub type_name: String,
}

/// 编译结果：表达式 + 参数绑定元数据
#[derive(Debug, Clone)]
pub struct CompiledPointcut {
    pub expression: PointcutExpression,
    pub bindings: Vec<FormalParameter>,
}

/// 切点表达式编译器（外部协作者接缝）
///
/// 编译失败是结构性解析错误（WeaverError::PointcutParse），与
/// "语义上永不匹配"（求值为 false）严格区分
pub trait ExpressionCompiler: Send + Sync {
    fn compile(
        &self,
        expression: &str,
        scope: Option<&str>,
        parameters: &[FormalParameter],
    ) -> WeaverResult<CompiledPointcut>;
}

/// 默认表达式编译器
///
/// 递归下降解析 `&&`/`||`/`!` 组合的指示符
pub struct DefaultExpressionCompiler;

impl DefaultExpressionCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DefaultExpressionCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionCompiler for DefaultExpressionCompiler {
    fn compile(
        &self,
        expression: &str,
        _scope: Option<&str>,
        parameters: &[FormalParameter],
    ) -> WeaverResult<CompiledPointcut> {
        let mut parser = Parser::new(expression);
        let parsed = parser.parse_or()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(CompiledPointcut {
            expression: parsed,
            bindings: parameters.to_vec(),
        })
    }
}

/// 递归下降解析器
struct Parser<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }

    fn error(&self, reason: &str) -> WeaverError {
        WeaverError::PointcutParse {
            expression: self.input.to_string(),
            reason: format!("{} at offset {}", reason, self.position),
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    fn at_end(&self) -> bool {
        self.position >= self.input.len()
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.rest().chars().next() {
            if ch.is_whitespace() {
                self.position += ch.len_utf8();
            } else {
                break;
            }
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_whitespace();
        if self.rest().starts_with(token) {
            self.position += token.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> WeaverResult<PointcutExpression> {
        let mut left = self.parse_and()?;
        while self.eat("||") {
            let right = self.parse_and()?;
            left = PointcutExpression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> WeaverResult<PointcutExpression> {
        let mut left = self.parse_unary()?;
        while self.eat("&&") {
            let right = self.parse_unary()?;
            left = PointcutExpression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> WeaverResult<PointcutExpression> {
        if self.eat("!") {
            let inner = self.parse_unary()?;
            return Ok(PointcutExpression::Not(Box::new(inner)));
        }
        if self.eat("(") {
            let inner = self.parse_or()?;
            if !self.eat(")") {
                return Err(self.error("expected ')'"));
            }
            return Ok(inner);
        }
        self.parse_designator()
    }

    fn parse_designator(&mut self) -> WeaverResult<PointcutExpression> {
        self.skip_whitespace();
        for (keyword, kind) in [
            ("execution", DesignatorKind::Execution),
            ("within", DesignatorKind::Within),
            ("@within", DesignatorKind::AnnotatedType),
            ("@annotation", DesignatorKind::AnnotatedMethod),
        ] {
            if self.rest().starts_with(keyword) {
                let after = &self.rest()[keyword.len()..];
                if after.trim_start().starts_with('(') {
                    self.position += keyword.len();
                    let body = self.parse_parenthesized_body()?;
                    return self.build_designator(kind, &body);
                }
            }
        }
        Err(self.error("expected a pointcut designator"))
    }

    /// 读取配对括号内的内容（处理 execution 内部的嵌套括号）
    fn parse_parenthesized_body(&mut self) -> WeaverResult<String> {
        if !self.eat("(") {
            return Err(self.error("expected '('"));
        }
        let start = self.position;
        let mut depth = 1usize;
        for (offset, ch) in self.rest().char_indices() {
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        let body = self.input[start..start + offset].to_string();
                        self.position = start + offset + 1;
                        return Ok(body);
                    }
                }
                _ => {}
            }
        }
        Err(self.error("unbalanced parentheses"))
    }

    fn build_designator(
        &self,
        kind: DesignatorKind,
        body: &str,
    ) -> WeaverResult<PointcutExpression> {
        let body = body.trim();
        match kind {
            DesignatorKind::Within => {
                let matcher = self.single_pattern(body)?;
                Ok(PointcutExpression::Within(matcher))
            }
            DesignatorKind::AnnotatedType => {
                self.require_plain_name(body)?;
                Ok(PointcutExpression::AnnotatedType(body.to_string()))
            }
            DesignatorKind::AnnotatedMethod => {
                self.require_plain_name(body)?;
                Ok(PointcutExpression::AnnotatedMethod(body.to_string()))
            }
            DesignatorKind::Execution => self.build_execution(body),
        }
    }

    /// `execution` 体：`ret-pattern declaring.method(params)`
    fn build_execution(&self, body: &str) -> WeaverResult<PointcutExpression> {
        let (return_part, rest) = body
            .split_once(char::is_whitespace)
            .ok_or_else(|| self.error("execution needs a return pattern"))?;
        let rest = rest.trim();

        let open = rest
            .find('(')
            .ok_or_else(|| self.error("execution needs a parameter list"))?;
        if !rest.ends_with(')') {
            return Err(self.error("execution parameter list is not closed"));
        }
        let qualified = &rest[..open];
        let params_body = &rest[open + 1..rest.len() - 1];

        let (declaring_part, method_part) = qualified
            .rsplit_once('.')
            .ok_or_else(|| self.error("execution needs a declaring type"))?;

        let return_pattern = NamePattern::compile(return_part)
            .ok_or_else(|| self.error("invalid return pattern"))?;
        let declaring = self.single_pattern(declaring_part)?;
        let method = self.single_pattern(method_part)?;
        let params = self.build_params(params_body)?;

        Ok(PointcutExpression::Execution {
            return_pattern,
            declaring,
            method,
            params,
        })
    }

    fn build_params(&self, body: &str) -> WeaverResult<ParamsPattern> {
        let body = body.trim();
        if body == ".." {
            return Ok(ParamsPattern::Any);
        }
        if body.is_empty() {
            return Ok(ParamsPattern::Exact(Vec::new()));
        }
        if body.contains("..") {
            return Err(self.error("partial '..' parameter patterns are not supported"));
        }
        let mut patterns = Vec::new();
        for part in body.split(',') {
            let pattern = NamePattern::compile(part.trim())
                .ok_or_else(|| self.error("invalid parameter pattern"))?;
            patterns.push(pattern);
        }
        Ok(ParamsPattern::Exact(patterns))
    }

    fn single_pattern(&self, raw: &str) -> WeaverResult<Arc<NameMatcher>> {
        let pattern =
            NamePattern::compile(raw).ok_or_else(|| self.error("invalid name pattern"))?;
        Ok(Arc::new(NameMatcher::Patterns(vec![pattern])))
    }

    fn require_plain_name(&self, raw: &str) -> WeaverResult<()> {
        if raw.is_empty() || raw.contains('*') || raw.contains(char::is_whitespace) {
            return Err(self.error("expected a plain annotation type name"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum DesignatorKind {
    Execution,
    Within,
    AnnotatedType,
    AnnotatedMethod,
}
