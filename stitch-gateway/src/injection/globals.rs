//! Global functions and value methods available to template expressions.

use indexmap::IndexMap;
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;

use super::TemplateError;
use super::eval::number_value;
use super::eval::property_key;
use super::eval::strict_equals;
use super::eval::string_to_number;
use super::eval::to_js_string;
use super::eval::to_number;
use super::eval::truthy;
use crate::json_ext::Object;
use crate::json_ext::Value;

pub(crate) type Builtin = fn(&[Option<Value>]) -> Result<Option<Value>, TemplateError>;

static FUNCTIONS: Lazy<IndexMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut functions: IndexMap<&'static str, Builtin> = IndexMap::new();
    functions.insert("String", string);
    functions.insert("Number", number);
    functions.insert("Boolean", boolean);
    functions.insert("parseInt", parse_int);
    functions.insert("parseFloat", parse_float);
    functions.insert("encodeURIComponent", encode_uri_component);
    functions.insert("decodeURIComponent", decode_uri_component);
    functions.insert("Error", error);
    functions
});

static NAMESPACES: Lazy<IndexMap<&'static str, IndexMap<&'static str, Builtin>>> =
    Lazy::new(|| {
        let mut namespaces = IndexMap::new();

        let mut json: IndexMap<&'static str, Builtin> = IndexMap::new();
        json.insert("stringify", json_stringify);
        json.insert("parse", json_parse);
        namespaces.insert("JSON", json);

        let mut math: IndexMap<&'static str, Builtin> = IndexMap::new();
        math.insert("min", math_min);
        math.insert("max", math_max);
        math.insert("floor", |args| math_unary(args, f64::floor));
        math.insert("ceil", |args| math_unary(args, f64::ceil));
        math.insert("round", |args| math_unary(args, |n| (n + 0.5).floor()));
        math.insert("trunc", |args| math_unary(args, f64::trunc));
        math.insert("abs", |args| math_unary(args, f64::abs));
        math.insert("pow", |args| {
            number_value(to_number(arg(args, 0)).powf(to_number(arg(args, 1)))).map(Some)
        });
        namespaces.insert("Math", math);

        let mut object: IndexMap<&'static str, Builtin> = IndexMap::new();
        object.insert("keys", object_keys);
        object.insert("values", object_values);
        object.insert("entries", object_entries);
        namespaces.insert("Object", object);

        let mut array: IndexMap<&'static str, Builtin> = IndexMap::new();
        array.insert("isArray", |args| {
            Ok(Some(Value::Bool(matches!(arg(args, 0), Some(Value::Array(_))))))
        });
        namespaces.insert("Array", array);

        namespaces
    });

static FLOAT_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?(Infinity|\d+\.?\d*(?:[eE][+-]?\d+)?|\.\d+(?:[eE][+-]?\d+)?)")
        .expect("valid regex")
});

const STRING_METHODS: [&str; 18] = [
    "toUpperCase",
    "toLowerCase",
    "trim",
    "trimStart",
    "trimEnd",
    "includes",
    "startsWith",
    "endsWith",
    "split",
    "slice",
    "substring",
    "indexOf",
    "replace",
    "replaceAll",
    "concat",
    "charAt",
    "padStart",
    "toString",
];
const ARRAY_METHODS: [&str; 6] = ["includes", "indexOf", "join", "slice", "concat", "toString"];
const NUMBER_METHODS: [&str; 2] = ["toString", "toFixed"];

pub(crate) fn function(name: &str) -> Option<Builtin> {
    FUNCTIONS.get(name).copied()
}

pub(crate) fn namespace(name: &str) -> Option<&'static str> {
    NAMESPACES.get_key_value(name).map(|(name, _)| *name)
}

pub(crate) fn namespace_function(namespace: &str, name: &str) -> Option<Builtin> {
    NAMESPACES.get(namespace)?.get(name).copied()
}

pub(crate) fn has_method(receiver: &Value, name: &str) -> bool {
    match receiver {
        Value::String(_) => STRING_METHODS.contains(&name),
        Value::Array(_) => ARRAY_METHODS.contains(&name),
        Value::Number(_) => NUMBER_METHODS.contains(&name),
        Value::Bool(_) => name == "toString",
        Value::Object(_) => name == "hasOwnProperty",
        Value::Null => false,
    }
}

pub(crate) fn call_method(
    receiver: &Value,
    name: &str,
    args: &[Option<Value>],
) -> Result<Option<Value>, TemplateError> {
    match receiver {
        Value::String(s) => string_method(s, name, args),
        Value::Array(items) => array_method(items, name, args),
        Value::Number(_) if name == "toFixed" => {
            let digits = to_number(arg(args, 0));
            let digits = if digits.is_nan() { 0 } else { digits.clamp(0.0, 100.0) as usize };
            Ok(Some(Value::String(format!(
                "{:.*}",
                digits,
                to_number(Some(receiver))
            ))))
        }
        Value::Number(_) | Value::Bool(_) if name == "toString" => {
            Ok(Some(Value::String(to_js_string(Some(receiver)))))
        }
        Value::Object(object) if name == "hasOwnProperty" => Ok(Some(Value::Bool(
            object.contains_key(&property_key(arg(args, 0))),
        ))),
        _ => Err(TemplateError::NotAFunction {
            callee: name.to_string(),
        }),
    }
}

fn arg(args: &[Option<Value>], index: usize) -> Option<&Value> {
    args.get(index).and_then(Option::as_ref)
}

fn string_arg(args: &[Option<Value>], index: usize) -> String {
    to_js_string(arg(args, index))
}

/// Resolves a possibly negative `slice` bound against `len`.
fn relative_index(index: Option<&Value>, len: usize, default: usize) -> usize {
    let Some(index) = index else {
        return default;
    };
    let n = to_number(Some(index)).trunc();
    if n.is_nan() {
        0
    } else if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        (n as usize).min(len)
    }
}

fn string_method(
    s: &str,
    name: &str,
    args: &[Option<Value>],
) -> Result<Option<Value>, TemplateError> {
    let string = |s: String| -> Result<Option<Value>, TemplateError> { Ok(Some(Value::String(s))) };
    let boolean = |b: bool| -> Result<Option<Value>, TemplateError> { Ok(Some(Value::Bool(b))) };
    match name {
        "toUpperCase" => string(s.to_uppercase()),
        "toLowerCase" => string(s.to_lowercase()),
        "trim" => string(s.trim().to_string()),
        "trimStart" => string(s.trim_start().to_string()),
        "trimEnd" => string(s.trim_end().to_string()),
        "includes" => boolean(s.contains(&string_arg(args, 0))),
        "startsWith" => boolean(s.starts_with(&string_arg(args, 0))),
        "endsWith" => boolean(s.ends_with(&string_arg(args, 0))),
        "split" => Ok(Some(Value::Array(match arg(args, 0) {
            None => vec![Value::String(s.to_string())],
            Some(separator) => {
                let separator = to_js_string(Some(separator));
                if separator.is_empty() {
                    s.chars().map(|c| Value::String(c.to_string())).collect()
                } else {
                    s.split(separator.as_str())
                        .map(|part| Value::String(part.to_string()))
                        .collect()
                }
            }
        }))),
        "slice" | "substring" => {
            let chars = s.chars().collect::<Vec<_>>();
            let start = relative_index(arg(args, 0), chars.len(), 0);
            let end = relative_index(arg(args, 1), chars.len(), chars.len());
            let (start, end) = if name == "substring" && start > end {
                (end, start)
            } else {
                (start, end)
            };
            string(if start < end {
                chars[start..end].iter().collect()
            } else {
                String::new()
            })
        }
        "indexOf" => Ok(Some(Value::from(
            s.find(&string_arg(args, 0))
                .map(|byte| s[..byte].chars().count() as i64)
                .unwrap_or(-1),
        ))),
        "replace" => string(s.replacen(&string_arg(args, 0), &string_arg(args, 1), 1)),
        "replaceAll" => string(s.replace(&string_arg(args, 0), &string_arg(args, 1))),
        "concat" => string(
            std::iter::once(s.to_string())
                .chain(args.iter().map(|a| to_js_string(a.as_ref())))
                .collect(),
        ),
        "charAt" => {
            let index = relative_index(arg(args, 0), usize::MAX, 0);
            string(s.chars().nth(index).map(String::from).unwrap_or_default())
        }
        "padStart" => {
            let target = to_number(arg(args, 0));
            let target = if target.is_nan() { 0 } else { target.max(0.0) as usize };
            let pad = match arg(args, 1) {
                None => " ".to_string(),
                Some(pad) => to_js_string(Some(pad)),
            };
            let len = s.chars().count();
            if len >= target || pad.is_empty() {
                return string(s.to_string());
            }
            let padding = pad.chars().cycle().take(target - len).collect::<String>();
            string(padding + s)
        }
        "toString" => string(s.to_string()),
        _ => Err(TemplateError::NotAFunction {
            callee: name.to_string(),
        }),
    }
}

fn array_method(
    items: &[Value],
    name: &str,
    args: &[Option<Value>],
) -> Result<Option<Value>, TemplateError> {
    let join = |separator: &str| {
        items
            .iter()
            .map(|item| match item {
                Value::Null => String::new(),
                other => to_js_string(Some(other)),
            })
            .join(separator)
    };
    Ok(Some(match name {
        "includes" => Value::Bool(
            items
                .iter()
                .any(|item| strict_equals(Some(item), arg(args, 0))),
        ),
        "indexOf" => Value::from(
            items
                .iter()
                .position(|item| strict_equals(Some(item), arg(args, 0)))
                .map(|index| index as i64)
                .unwrap_or(-1),
        ),
        "join" => Value::String(match arg(args, 0) {
            None => join(","),
            Some(separator) => join(&to_js_string(Some(separator))),
        }),
        "toString" => Value::String(join(",")),
        "slice" => {
            let start = relative_index(arg(args, 0), items.len(), 0);
            let end = relative_index(arg(args, 1), items.len(), items.len());
            Value::Array(if start < end {
                items[start..end].to_vec()
            } else {
                Vec::new()
            })
        }
        "concat" => {
            let mut concatenated = items.to_vec();
            for argument in args {
                match argument {
                    Some(Value::Array(more)) => concatenated.extend(more.iter().cloned()),
                    Some(other) => concatenated.push(other.clone()),
                    None => concatenated.push(Value::Null),
                }
            }
            Value::Array(concatenated)
        }
        _ => {
            return Err(TemplateError::NotAFunction {
                callee: name.to_string(),
            });
        }
    }))
}

fn string(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    Ok(Some(Value::String(if args.is_empty() {
        String::new()
    } else {
        string_arg(args, 0)
    })))
}

fn number(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    if args.is_empty() {
        return Ok(Some(Value::from(0)));
    }
    number_value(to_number(arg(args, 0))).map(Some)
}

fn boolean(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    Ok(Some(Value::Bool(truthy(arg(args, 0)))))
}

fn parse_int(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let input = string_arg(args, 0);
    let input = input.trim();
    let (negative, input) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input.strip_prefix('+').unwrap_or(input)),
    };
    let radix = match to_number(arg(args, 1)) {
        n if n.is_nan() || n == 0.0 => 10,
        n => n as u32,
    };
    if !(2..=36).contains(&radix) {
        return Err(TemplateError::NotFinite);
    }
    let (radix, input) = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) if radix == 16 || arg(args, 1).is_none() => (16, hex),
        _ => (radix, input),
    };
    let digits = input
        .chars()
        .take_while(|c| c.is_digit(radix))
        .collect::<String>();
    let parsed = i64::from_str_radix(&digits, radix).map_err(|_| TemplateError::NotFinite)?;
    number_value(if negative { -(parsed as f64) } else { parsed as f64 }).map(Some)
}

fn parse_float(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let input = string_arg(args, 0);
    let prefix = FLOAT_PREFIX
        .find(input.trim_start())
        .map(|m| m.as_str())
        .ok_or(TemplateError::NotFinite)?;
    number_value(string_to_number(prefix)).map(Some)
}

fn is_uri_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

fn encode_uri_component(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let input = string_arg(args, 0);
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        if is_uri_unreserved(byte) {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    Ok(Some(Value::String(encoded)))
}

fn decode_uri_component(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let input = string_arg(args, 0);
    let malformed = || TemplateError::InvalidArgument {
        function: "decodeURIComponent",
        message: "URI malformed".to_string(),
    };
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = input.get(i + 1..i + 3).ok_or_else(malformed)?;
            decoded.push(u8::from_str_radix(hex, 16).map_err(|_| malformed())?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded)
        .map(|s| Some(Value::String(s)))
        .map_err(|_| malformed())
}

fn error(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let mut error = Object::new();
    error.insert(
        "message".to_string(),
        Value::String(match arg(args, 0) {
            None => String::new(),
            Some(message) => to_js_string(Some(message)),
        }),
    );
    error.insert("name".to_string(), Value::String("Error".to_string()));
    Ok(Some(Value::Object(error)))
}

fn json_stringify(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let Some(value) = arg(args, 0) else {
        return Ok(None);
    };
    let pretty = truthy(arg(args, 2));
    let serialized = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    serialized
        .map(|s| Some(Value::String(s)))
        .map_err(|e| TemplateError::InvalidArgument {
            function: "JSON.stringify",
            message: e.to_string(),
        })
}

fn json_parse(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    serde_json::from_str(&string_arg(args, 0))
        .map(Some)
        .map_err(|e| TemplateError::InvalidArgument {
            function: "JSON.parse",
            message: e.to_string(),
        })
}

fn math_unary(args: &[Option<Value>], f: fn(f64) -> f64) -> Result<Option<Value>, TemplateError> {
    number_value(f(to_number(arg(args, 0)))).map(Some)
}

fn math_min(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let min = args
        .iter()
        .map(|a| to_number(a.as_ref()))
        .fold(f64::INFINITY, |acc, n| if n.is_nan() || n < acc { n } else { acc });
    number_value(min).map(Some)
}

fn math_max(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    let max = args
        .iter()
        .map(|a| to_number(a.as_ref()))
        .fold(f64::NEG_INFINITY, |acc, n| if n.is_nan() || n > acc { n } else { acc });
    number_value(max).map(Some)
}

fn entries(value: Option<&Value>) -> Result<Vec<(String, Value)>, TemplateError> {
    match value {
        Some(Value::Object(object)) => Ok(object
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect()),
        Some(Value::String(s)) => Ok(s
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::String(c.to_string())))
            .collect()),
        None | Some(Value::Null) => Err(TemplateError::InvalidArgument {
            function: "Object",
            message: "cannot convert undefined or null to object".to_string(),
        }),
        Some(_) => Ok(Vec::new()),
    }
}

fn object_keys(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    Ok(Some(Value::Array(
        entries(arg(args, 0))?
            .into_iter()
            .map(|(k, _)| Value::String(k))
            .collect(),
    )))
}

fn object_values(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    Ok(Some(Value::Array(
        entries(arg(args, 0))?.into_iter().map(|(_, v)| v).collect(),
    )))
}

fn object_entries(args: &[Option<Value>]) -> Result<Option<Value>, TemplateError> {
    Ok(Some(Value::Array(
        entries(arg(args, 0))?
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
            .collect(),
    )))
}
