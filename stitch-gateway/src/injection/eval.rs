//! Evaluation of parsed template expressions over a JSON scope.
//!
//! `undefined` is modelled as `None`. Values borrowed from the scope stay borrowed until they
//! are returned, so reading `source.id` does not copy `source`.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::time::Instant;

use itertools::Itertools;
use serde_json::Number;

use super::TemplateError;
use super::globals;
use super::globals::Builtin;
use super::parser::Access;
use super::parser::AccessKind;
use super::parser::BinaryOp;
use super::parser::Element;
use super::parser::Expr;
use super::parser::LogicalOp;
use super::parser::Property;
use super::parser::PropertyKey;
use super::parser::TemplatePart;
use super::parser::UnaryOp;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

/// Names that resolve to `undefined` when the scope does not define them.
pub(crate) const CONTEXT_KEYS: [&str; 11] = [
    "source",
    "args",
    "jwt",
    "headers",
    "isAnonymousAccess",
    "vars",
    "info",
    "exports",
    "error",
    "result",
    "plugins",
];

/// Integral numbers below this are emitted as JSON integers.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

type Js<'a> = Option<Cow<'a, Value>>;

/// What a member chain currently points at.
enum Current<'a> {
    Value(Js<'a>),
    Namespace(&'static str),
    Function(Builtin),
    /// A method looked up on a value, waiting for its call.
    Method(Cow<'a, Value>, String),
}

impl<'a> Current<'a> {
    fn is_nullish(&self) -> bool {
        matches!(self, Current::Value(value) if is_nullish(value.as_deref()))
    }

    fn into_value(self) -> Result<Js<'a>, TemplateError> {
        match self {
            Current::Value(value) => Ok(value),
            _ => Err(TemplateError::FunctionValue),
        }
    }
}

pub(crate) struct Evaluator<'a> {
    scope: &'a Object,
    deadline: Instant,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(scope: &'a Object, deadline: Instant) -> Self {
        Self { scope, deadline }
    }

    pub(crate) fn evaluate(&self, expr: &Expr) -> Result<Option<Value>, TemplateError> {
        Ok(self.eval(expr)?.map(Cow::into_owned))
    }

    fn eval(&self, expr: &Expr) -> Result<Js<'a>, TemplateError> {
        if Instant::now() >= self.deadline {
            return Err(TemplateError::Timeout);
        }
        Ok(match expr {
            Expr::Null => owned(Value::Null),
            Expr::Undefined => None,
            Expr::Bool(b) => owned(Value::Bool(*b)),
            Expr::Number(n) => owned(number_value(*n)?),
            Expr::String(s) => owned(Value::String(s.clone())),
            Expr::Template(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        TemplatePart::Text(text) => out.push_str(text),
                        TemplatePart::Expr(expr) => {
                            out.push_str(&to_js_string(self.eval(expr)?.as_deref()))
                        }
                    }
                }
                owned(Value::String(out))
            }
            Expr::Ident(name) => self.resolve(name)?.into_value()?,
            Expr::Array(elements) => owned(Value::Array(self.array(elements)?)),
            Expr::Object(properties) => owned(Value::Object(self.object(properties)?)),
            Expr::Chain(base, accesses) => self.chain(base, accesses)?.into_value()?,
            Expr::New(callee, arguments) => {
                let function = globals::function(callee).ok_or_else(|| {
                    TemplateError::NotAFunction {
                        callee: callee.clone(),
                    }
                })?;
                function(&self.arguments(arguments)?)?.map(Cow::Owned)
            }
            Expr::Unary(op, operand) => owned(self.unary(*op, operand)?),
            Expr::Binary(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                owned(binary(*op, left.as_deref(), right.as_deref())?)
            }
            Expr::Logical(op, left, right) => {
                let left = self.eval(left)?;
                let settled = match op {
                    LogicalOp::And => !truthy(left.as_deref()),
                    LogicalOp::Or => truthy(left.as_deref()),
                    LogicalOp::Nullish => !is_nullish(left.as_deref()),
                };
                if settled { left } else { self.eval(right)? }
            }
            Expr::Conditional(test, consequent, alternate) => {
                if truthy(self.eval(test)?.as_deref()) {
                    self.eval(consequent)?
                } else {
                    self.eval(alternate)?
                }
            }
        })
    }

    fn resolve(&self, name: &str) -> Result<Current<'a>, TemplateError> {
        if let Some(value) = self.scope.get(name) {
            return Ok(Current::Value(Some(Cow::Borrowed(value))));
        }
        if let Some(function) = globals::function(name) {
            return Ok(Current::Function(function));
        }
        if let Some(namespace) = globals::namespace(name) {
            return Ok(Current::Namespace(namespace));
        }
        if CONTEXT_KEYS.contains(&name) {
            return Ok(Current::Value(None));
        }
        Err(TemplateError::UndefinedIdentifier {
            name: name.to_string(),
        })
    }

    fn chain(&self, base: &Expr, accesses: &[Access]) -> Result<Current<'a>, TemplateError> {
        let mut current = match base {
            Expr::Ident(name) => self.resolve(name)?,
            other => Current::Value(self.eval(other)?),
        };
        for (i, access) in accesses.iter().enumerate() {
            if access.optional && current.is_nullish() {
                return Ok(Current::Value(None));
            }
            let next_is_call = matches!(
                accesses.get(i + 1),
                Some(Access {
                    kind: AccessKind::Call(_),
                    ..
                })
            );
            current = match &access.kind {
                AccessKind::Property(name) => member(current, name, next_is_call)?,
                AccessKind::Index(expr) => {
                    let key = property_key(self.eval(expr)?.as_deref());
                    member(current, &key, next_is_call)?
                }
                AccessKind::Call(arguments) => {
                    let arguments = self.arguments(arguments)?;
                    Current::Value(call(current, &arguments)?.map(Cow::Owned))
                }
            };
        }
        Ok(current)
    }

    fn arguments(&self, arguments: &[Expr]) -> Result<Vec<Option<Value>>, TemplateError> {
        arguments
            .iter()
            .map(|argument| Ok(self.eval(argument)?.map(Cow::into_owned)))
            .collect()
    }

    fn unary(&self, op: UnaryOp, operand: &Expr) -> Result<Value, TemplateError> {
        Ok(match op {
            UnaryOp::Not => Value::Bool(!truthy(self.eval(operand)?.as_deref())),
            UnaryOp::Neg => number_value(-to_number(self.eval(operand)?.as_deref()))?,
            UnaryOp::Plus => number_value(to_number(self.eval(operand)?.as_deref()))?,
            UnaryOp::TypeOf => Value::String(self.type_of(operand)?.to_string()),
        })
    }

    fn type_of(&self, operand: &Expr) -> Result<&'static str, TemplateError> {
        let current = match operand {
            Expr::Ident(name) => match self.resolve(name) {
                Ok(current) => current,
                Err(TemplateError::UndefinedIdentifier { .. }) => return Ok("undefined"),
                Err(error) => return Err(error),
            },
            Expr::Chain(base, accesses) => self.chain(base, accesses)?,
            other => Current::Value(self.eval(other)?),
        };
        Ok(match current {
            Current::Value(value) => type_name(value.as_deref()),
            Current::Namespace(_) => "object",
            Current::Function(_) | Current::Method(..) => "function",
        })
    }

    fn array(&self, elements: &[Element]) -> Result<Vec<Value>, TemplateError> {
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Item(expr) => items.push(
                    self.eval(expr)?
                        .map(Cow::into_owned)
                        .unwrap_or(Value::Null),
                ),
                Element::Spread(expr) => match self.eval(expr)?.as_deref() {
                    Some(Value::Array(values)) => items.extend(values.iter().cloned()),
                    Some(Value::String(s)) => {
                        items.extend(s.chars().map(|c| Value::String(c.to_string())))
                    }
                    other => {
                        return Err(TemplateError::InvalidArgument {
                            function: "spread",
                            message: format!("{} is not iterable", to_js_string(other)),
                        });
                    }
                },
            }
        }
        Ok(items)
    }

    fn object(&self, properties: &[Property]) -> Result<Object, TemplateError> {
        let mut object = Object::new();
        for property in properties {
            match property {
                Property::Entry(key, value) => {
                    let key = match key {
                        PropertyKey::Static(key) => key.clone(),
                        PropertyKey::Computed(expr) => property_key(self.eval(expr)?.as_deref()),
                    };
                    // Keys holding undefined do not survive serialization.
                    if let Some(value) = self.eval(value)? {
                        object.insert(key, value.into_owned());
                    }
                }
                Property::Shorthand(name) => {
                    if let Some(value) = self.resolve(name)?.into_value()? {
                        object.insert(name.clone(), value.into_owned());
                    }
                }
                Property::Spread(expr) => match self.eval(expr)?.as_deref() {
                    Some(Value::Object(spread)) => {
                        object.extend(spread.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    Some(Value::Array(items)) => object.extend(
                        items
                            .iter()
                            .enumerate()
                            .map(|(i, v)| (i.to_string(), v.clone())),
                    ),
                    Some(Value::String(s)) => object.extend(
                        s.chars()
                            .enumerate()
                            .map(|(i, c)| (i.to_string(), Value::String(c.to_string()))),
                    ),
                    _ => {}
                },
            }
        }
        Ok(object)
    }
}

fn owned<'a>(value: Value) -> Js<'a> {
    Some(Cow::Owned(value))
}

fn member<'a>(
    current: Current<'a>,
    key: &str,
    next_is_call: bool,
) -> Result<Current<'a>, TemplateError> {
    match current {
        Current::Value(None) => Err(TemplateError::PropertyOfNullish {
            receiver: "undefined",
            property: key.to_string(),
        }),
        Current::Value(Some(value)) => {
            if value.is_null() {
                return Err(TemplateError::PropertyOfNullish {
                    receiver: "null",
                    property: key.to_string(),
                });
            }
            if next_is_call && globals::has_method(&value, key) {
                return Ok(Current::Method(value, key.to_string()));
            }
            Ok(Current::Value(property(value, key)))
        }
        Current::Namespace(namespace) => Ok(globals::namespace_function(namespace, key)
            .map(Current::Function)
            .unwrap_or(Current::Value(None))),
        Current::Function(_) | Current::Method(..) => Ok(Current::Value(None)),
    }
}

fn call(current: Current<'_>, arguments: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    match current {
        Current::Function(function) => function(arguments),
        Current::Method(receiver, name) => globals::call_method(&receiver, &name, arguments),
        Current::Namespace(namespace) => Err(TemplateError::NotAFunction {
            callee: namespace.to_string(),
        }),
        Current::Value(value) => Err(TemplateError::NotAFunction {
            callee: to_js_string(value.as_deref()),
        }),
    }
}

fn property<'a>(value: Cow<'a, Value>, key: &str) -> Js<'a> {
    match value {
        Cow::Borrowed(value) => property_of(value, key),
        Cow::Owned(value) => property_of(&value, key).map(|p| Cow::Owned(p.into_owned())),
    }
}

fn property_of<'v>(value: &'v Value, key: &str) -> Option<Cow<'v, Value>> {
    match value {
        Value::Object(object) => object.get(key).map(Cow::Borrowed),
        Value::Array(items) if key == "length" => Some(Cow::Owned(Value::from(items.len()))),
        Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .map(Cow::Borrowed),
        Value::String(s) if key == "length" => {
            Some(Cow::Owned(Value::from(s.encode_utf16().count())))
        }
        Value::String(s) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| s.chars().nth(index))
            .map(|c| Cow::Owned(Value::String(c.to_string()))),
        _ => None,
    }
}

fn binary(op: BinaryOp, left: Option<&Value>, right: Option<&Value>) -> Result<Value, TemplateError> {
    Ok(match op {
        BinaryOp::Add if is_string_like(left) || is_string_like(right) => {
            Value::String(to_js_string(left) + &to_js_string(right))
        }
        BinaryOp::Add => number_value(to_number(left) + to_number(right))?,
        BinaryOp::Sub => number_value(to_number(left) - to_number(right))?,
        BinaryOp::Mul => number_value(to_number(left) * to_number(right))?,
        BinaryOp::Div => number_value(to_number(left) / to_number(right))?,
        BinaryOp::Rem => number_value(to_number(left) % to_number(right))?,
        BinaryOp::StrictEq => Value::Bool(strict_equals(left, right)),
        BinaryOp::StrictNe => Value::Bool(!strict_equals(left, right)),
        BinaryOp::LooseEq => Value::Bool(loose_equals(left, right)),
        BinaryOp::LooseNe => Value::Bool(!loose_equals(left, right)),
        BinaryOp::Lt => Value::Bool(compare(left, right) == Some(Ordering::Less)),
        BinaryOp::Gt => Value::Bool(compare(left, right) == Some(Ordering::Greater)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        )),
    })
}

fn is_string_like(value: Option<&Value>) -> bool {
    matches!(
        value,
        Some(Value::String(_) | Value::Array(_) | Value::Object(_))
    )
}

fn compare(left: Option<&Value>, right: Option<&Value>) -> Option<Ordering> {
    if is_string_like(left) && is_string_like(right) {
        return Some(to_js_string(left).cmp(&to_js_string(right)));
    }
    to_number(left).partial_cmp(&to_number(right))
}

pub(crate) fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

pub(crate) fn truthy(value: Option<&Value>) -> bool {
    value.is_some_and(|value| value.is_truthy())
}

pub(crate) fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Null | Value::Array(_) | Value::Object(_)) => "object",
    }
}

pub(crate) fn strict_equals(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None, None) => true,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn loose_equals(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(a), Some(b)) if std::mem::discriminant(a) == std::mem::discriminant(b) => {
            strict_equals(left, right)
        }
        (Some(Value::String(_)), Some(Value::Array(_) | Value::Object(_)))
        | (Some(Value::Array(_) | Value::Object(_)), Some(Value::String(_))) => {
            to_js_string(left) == to_js_string(right)
        }
        _ => to_number(left) == to_number(right),
    }
}

/// JavaScript `String(value)`.
pub(crate) fn to_js_string(value: Option<&Value>) -> String {
    match value {
        None => "undefined".to_string(),
        Some(Value::Null) => "null".to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) => i.to_string(),
            None => number_to_string(n.as_f64().unwrap_or(f64::NAN)),
        },
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => to_js_string(Some(other)),
            })
            .join(","),
        Some(Value::Object(_)) => "[object Object]".to_string(),
    }
}

/// JavaScript `Number(value)`.
pub(crate) fn to_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => f64::from(u8::from(*b)),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => string_to_number(s),
        Some(array @ Value::Array(_)) => string_to_number(&to_js_string(Some(array))),
        Some(Value::Object(_)) => f64::NAN,
    }
}

pub(crate) fn string_to_number(s: &str) -> f64 {
    let s = s.trim();
    match s {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                return u64::from_str_radix(hex, 16)
                    .map(|n| n as f64)
                    .unwrap_or(f64::NAN);
            }
            if s
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
            {
                s.parse().unwrap_or(f64::NAN)
            } else {
                f64::NAN
            }
        }
    }
}

pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        (n as i64).to_string()
    } else {
        n.to_string()
    }
}

/// Converts a computed number to JSON. NaN and infinities have no JSON form.
pub(crate) fn number_value(n: f64) -> Result<Value, TemplateError> {
    if !n.is_finite() {
        return Err(TemplateError::NotFinite);
    }
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Ok(Value::from(n as i64));
    }
    Number::from_f64(n)
        .map(Value::Number)
        .ok_or(TemplateError::NotFinite)
}

pub(crate) fn property_key(value: Option<&Value>) -> String {
    to_js_string(value)
}
