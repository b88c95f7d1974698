//! Template injection.
//!
//! Directive arguments and policy arguments are templates evaluated against a scope of request
//! data (`source`, `args`, `jwt`, `headers` and friends). A template is either
//!
//! * a whole expression, `{expr}`, which evaluates to the JSON value of `expr`, or
//! * text with `{expr}` holes, which evaluates to a string.
//!
//! A template that fails to parse or evaluate is returned unchanged.

mod eval;
mod globals;
mod parser;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use displaydoc::Display;
use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

pub(crate) use self::eval::is_nullish;
pub(crate) use self::eval::to_js_string;
pub(crate) use self::eval::truthy;
use self::eval::Evaluator;
use self::parser::Expr;
use self::parser::TemplatePart;
use self::parser::parse_expression;
use crate::json_ext::Object;
use crate::json_ext::Value;

/// Why a template could not be evaluated.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateError {
    /// syntax error: {message}
    Syntax { message: String },
    /// unbalanced braces in template
    UnbalancedBraces,
    /// {name} is not defined
    UndefinedIdentifier { name: String },
    /// cannot read properties of {receiver} (reading '{property}')
    PropertyOfNullish {
        receiver: &'static str,
        property: String,
    },
    /// {callee} is not a function
    NotAFunction { callee: String },
    /// functions cannot be used as values
    FunctionValue,
    /// {function}: {message}
    InvalidArgument {
        function: &'static str,
        message: String,
    },
    /// expression evaluated to a number that has no JSON representation
    NotFinite,
    /// expression is nested too deeply
    TooDeep,
    /// evaluation ran out of time
    Timeout,
}

/// A parsed template.
#[derive(Debug)]
enum Template {
    Expression(Expr),
    Interpolation(Vec<TemplatePart>),
}

impl Template {
    fn parse(template: &str) -> Result<Self, TemplateError> {
        let trimmed = template.trim();
        if trimmed.starts_with('{') && matching_brace(trimmed, 0) == Some(trimmed.len() - 1) {
            return Ok(Template::Expression(parse_expression(
                &trimmed[1..trimmed.len() - 1],
            )?));
        }

        let mut parts = Vec::new();
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(TemplatePart::Text(rest[..open].to_string()));
            }
            let close = matching_brace(rest, open).ok_or(TemplateError::UnbalancedBraces)?;
            parts.push(TemplatePart::Expr(parse_expression(&rest[open + 1..close])?));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(TemplatePart::Text(rest.to_string()));
        }
        Ok(Template::Interpolation(parts))
    }
}

/// Byte offset of the `}` closing the `{` at `open`. Braces inside string literals do not count.
fn matching_brace(source: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in source[open..].char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + i);
                }
            }
            _ => {}
        }
    }
    None
}

const DEFAULT_CACHE_CAPACITY: usize = 1024;

type ParsedTemplate = Arc<Result<Template, TemplateError>>;

/// Evaluates templates with a time limit, caching the most recently parsed templates.
#[derive(Clone, Debug)]
pub struct TemplateEngine {
    timeout: Duration,
    parsed: Arc<Mutex<LruCache<String, ParsedTemplate>>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl TemplateEngine {
    pub fn new(timeout: Duration) -> Self {
        Self::with_cache_capacity(
            timeout,
            NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )
    }

    /// Like [`TemplateEngine::new`], keeping at most `capacity` parsed templates.
    pub fn with_cache_capacity(timeout: Duration, capacity: NonZeroUsize) -> Self {
        Self {
            timeout,
            parsed: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Evaluates `template`, returning the template itself when evaluation fails.
    ///
    /// A whole expression that evaluates to `undefined` yields `null`.
    pub fn evaluate(&self, template: &str, scope: &Object) -> Value {
        match self.try_evaluate(template, scope) {
            Ok(value) => value.unwrap_or(Value::Null),
            Err(error) => {
                tracing::trace!(template, %error, "template evaluation failed, using it verbatim");
                Value::String(template.to_string())
            }
        }
    }

    /// Evaluates `template`. `Ok(None)` is an expression that evaluated to `undefined`.
    pub fn try_evaluate(
        &self,
        template: &str,
        scope: &Object,
    ) -> Result<Option<Value>, TemplateError> {
        let parsed = self.parse(template);
        let template = match parsed.as_ref() {
            Ok(template) => template,
            Err(error) => return Err(error.clone()),
        };
        let evaluator = Evaluator::new(scope, Instant::now() + self.timeout);
        match template {
            Template::Expression(expr) => evaluator.evaluate(expr),
            Template::Interpolation(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => {
                            out.push_str(&to_js_string(evaluator.evaluate(expr)?.as_ref()))
                        }
                    }
                }
                Ok(Some(Value::String(out)))
            }
        }
    }

    /// Evaluates every string found in `input`, recursing through arrays and objects.
    pub fn inject(&self, input: &Value, scope: &Object) -> Value {
        match input {
            Value::String(template) => self.evaluate(template, scope),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.inject(item, scope)).collect())
            }
            Value::Object(object) => Value::Object(
                object
                    .iter()
                    .map(|(key, value)| (key.clone(), self.inject(value, scope)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Parses `template` without evaluating it.
    pub fn check(&self, template: &str) -> Result<(), TemplateError> {
        match self.parse(template).as_ref() {
            Ok(_) => Ok(()),
            Err(error) => Err(error.clone()),
        }
    }

    fn parse(&self, template: &str) -> ParsedTemplate {
        if let Some(parsed) = self.parsed.lock().get(template) {
            return parsed.clone();
        }
        let parsed = Arc::new(Template::parse(template));
        self.parsed.lock().put(template.to_string(), parsed.clone());
        parsed
    }
}
