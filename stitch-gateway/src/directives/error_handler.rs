use serde::Deserialize;

use super::Next;
use crate::error::FieldError;
use crate::execution::FieldContext;
use crate::injection::TemplateEngine;
use crate::json_ext::Object;
use crate::json_ext::Value;
use crate::json_ext::ValueExt;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CatchError {
    condition: Option<String>,
    #[serde(default)]
    return_value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ThrowError {
    condition: Option<String>,
    error_to_throw: Option<String>,
}

/// `@errorHandler(catchError, throwError)`
///
/// `catchError` turns an error raised beneath into a value when its condition holds for
/// `error`. `throwError` turns a resolved value into an error when its condition holds for
/// `result`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorHandler {
    catch_error: Option<CatchError>,
    throw_error: Option<ThrowError>,
}

impl ErrorHandler {
    pub(super) async fn resolve<'a>(
        &'a self,
        field: &'a FieldContext<'a>,
        next: Next<'a>,
    ) -> Result<Value, FieldError> {
        match next.run(field).await {
            Ok(result) => match &self.throw_error {
                Some(throw) => throw.apply(field, result),
                None => Ok(result),
            },
            Err(error) => match &self.catch_error {
                Some(catch) => catch.apply(field, error),
                None => Err(error),
            },
        }
    }
}

impl CatchError {
    fn apply(&self, field: &FieldContext<'_>, error: FieldError) -> Result<Value, FieldError> {
        let scope = field.scope_with("error", error.to_template_value());
        let caught = condition_met(field.engine(), self.condition.as_deref(), &scope);
        if !caught {
            return Err(error);
        }
        tracing::debug!(path = %field.path, %error, "error caught by @errorHandler");
        Ok(match &self.return_value {
            value if !value.is_truthy() => Value::Null,
            Value::String(template) => field.engine().evaluate(template, &scope),
            value => value.clone(),
        })
    }
}

impl ThrowError {
    fn apply(&self, field: &FieldContext<'_>, result: Value) -> Result<Value, FieldError> {
        let scope = field.scope_with("result", result);
        if !condition_met(field.engine(), self.condition.as_deref(), &scope) {
            return Ok(take_result(scope));
        }
        let error_to_throw = match self.error_to_throw.as_deref() {
            Some(error_to_throw) if !error_to_throw.is_empty() => error_to_throw,
            _ => {
                return Err(FieldError::Thrown {
                    message: String::new(),
                    extensions: Object::new(),
                });
            }
        };
        Err(match field.engine().evaluate(error_to_throw, &scope) {
            Value::Object(mut error) => FieldError::Thrown {
                message: match error.remove("message") {
                    Some(Value::String(message)) => message,
                    Some(other) => other.to_string(),
                    None => "Error".to_string(),
                },
                extensions: match error.remove("extensions") {
                    Some(Value::Object(extensions)) => extensions,
                    _ => Object::new(),
                },
            },
            Value::String(message) => FieldError::Thrown {
                message,
                extensions: Object::new(),
            },
            other => FieldError::Thrown {
                message: other.to_string(),
                extensions: Object::new(),
            },
        })
    }
}

/// A missing or empty condition always holds. Otherwise the condition must evaluate to a truthy
/// value that differs from its own text: a template that fails to evaluate, or a literal
/// without placeholders, comes back unchanged and does not hold.
fn condition_met(engine: &TemplateEngine, condition: Option<&str>, scope: &Object) -> bool {
    let Some(condition) = condition.filter(|condition| !condition.is_empty()) else {
        return true;
    };
    let value = engine.evaluate(condition, scope);
    value.is_truthy() && value.as_str() != Some(condition)
}

fn take_result(mut scope: Object) -> Value {
    scope.remove("result").unwrap_or(Value::Null)
}
