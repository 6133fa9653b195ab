//! The validation and coercion pipeline.
//!
//! Every write runs the merged record through [`Validator::validate`],
//! which walks the resolved props and, per field:
//!
//! 1. coerces the raw JSON value to the prop's declared type (numeric
//!    strings to numbers, truthy strings to booleans, and so on)
//! 2. applies the scalar checks from the prop's `options` (required,
//!    enum values, min/max, length bounds, pattern)
//! 3. runs the prop's composite validators (`email`, `url`, `phone`,
//!    `json`, `date_range`)
//!
//! Array props apply the scalar rules to every element. Object props with
//! a declared class recurse into the nested map. Errors are collected per
//! field and reported together - the pass never short-circuits.
//!
//! Relation target existence is NOT checked here; it needs storage access
//! and belongs to the engine's write pipeline.

mod extra;

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use crate::error::FieldError;
use crate::meta::{DataType, PropDef, PropOptions, Registry};
use crate::object::ObjectMap;

/// Maximum nesting depth for object-typed props.
const MAX_OBJECT_DEPTH: usize = 8;

/// Schema-aware validator.
///
/// Borrows the registry so object-typed props can resolve their declared
/// class for recursive validation.
pub struct Validator<'a> {
    registry: &'a Registry,
}

impl<'a> Validator<'a> {
    /// Creates a validator over the given registry.
    pub fn new(registry: &'a Registry) -> Self {
        Self { registry }
    }

    /// Validates and coerces `object` in place against the resolved props.
    ///
    /// Returns the collected field errors; an empty vector means the
    /// record is valid and every value has been replaced by its canonical
    /// coerced form.
    pub fn validate(&self, props: &[PropDef], object: &mut ObjectMap) -> Vec<FieldError> {
        self.validate_at(props, object, "", 0)
    }

    fn validate_at(
        &self,
        props: &[PropDef],
        object: &mut ObjectMap,
        prefix: &str,
        depth: usize,
    ) -> Vec<FieldError> {
        let mut errors = Vec::new();

        for prop in props {
            let path = if prefix.is_empty() {
                prop.key.clone()
            } else {
                format!("{}.{}", prefix, prop.key)
            };

            let Some(value) = object.get(&prop.key).cloned().filter(|v| !v.is_null()) else {
                if prop.required {
                    errors.push(FieldError::required(path));
                }
                continue;
            };

            match self.coerce_value(prop, value, &path, depth) {
                Ok(coerced) => {
                    for name in &prop.validators {
                        if let Some(err) = extra::run(name, &path, &coerced) {
                            errors.push(err);
                        }
                    }
                    object.insert(prop.key.clone(), coerced);
                }
                Err(mut errs) => errors.append(&mut errs),
            }
        }

        errors
    }

    /// Coerces one field value, honoring `is_array`.
    fn coerce_value(
        &self,
        prop: &PropDef,
        value: Value,
        path: &str,
        depth: usize,
    ) -> Result<Value, Vec<FieldError>> {
        if prop.is_array {
            let items = match value {
                Value::Array(items) => items,
                // Relations accept a scalar id where a list is declared.
                scalar if prop.data_type == DataType::Relation => vec![scalar],
                _ => {
                    return Err(vec![FieldError::new(
                        path,
                        "not_array",
                        format!("{} must be an array", path),
                    )])
                }
            };

            let mut coerced = Vec::with_capacity(items.len());
            let mut errors = Vec::new();
            for (i, item) in items.into_iter().enumerate() {
                let item_path = format!("{}[{}]", path, i);
                match self.coerce_scalar(prop, item, &item_path, depth) {
                    Ok(value) => coerced.push(value),
                    Err(mut errs) => errors.append(&mut errs),
                }
            }
            if errors.is_empty() {
                Ok(Value::Array(coerced))
            } else {
                Err(errors)
            }
        } else {
            self.coerce_scalar(prop, value, path, depth)
        }
    }

    /// Coerces a scalar value to the prop's declared type and applies the
    /// option checks.
    fn coerce_scalar(
        &self,
        prop: &PropDef,
        value: Value,
        path: &str,
        depth: usize,
    ) -> Result<Value, Vec<FieldError>> {
        let options = &prop.options;
        match prop.data_type {
            DataType::String => coerce_string(value, path, options).map_err(|e| vec![e]),
            DataType::Integer => coerce_integer(value, path, options).map_err(|e| vec![e]),
            DataType::Float => coerce_float(value, path, options).map_err(|e| vec![e]),
            DataType::Boolean => coerce_boolean(value, path).map_err(|e| vec![e]),
            DataType::Function => match value {
                Value::String(_) => Ok(value),
                _ => Err(vec![FieldError::new(
                    path,
                    "type",
                    format!("{} must be a function body string", path),
                )]),
            },
            DataType::Relation => coerce_relation_id(value, path).map_err(|e| vec![e]),
            DataType::Object => self.coerce_object(prop, value, path, depth),
        }
    }

    fn coerce_object(
        &self,
        prop: &PropDef,
        value: Value,
        path: &str,
        depth: usize,
    ) -> Result<Value, Vec<FieldError>> {
        // Without a declared class the prop is a free-form JSON container
        // (this is what `@prop.options` and `@class.unique` rely on).
        let Some(class_id) = prop.object_class_id.first() else {
            return Ok(value);
        };

        let mut map = match value {
            Value::Object(map) => map,
            // A JSON string that decodes to a map is accepted and unpacked.
            Value::String(text) => match serde_json::from_str::<Value>(&text) {
                Ok(Value::Object(map)) => map,
                _ => {
                    return Err(vec![FieldError::new(
                        path,
                        "type",
                        format!("{} must decode to an object", path),
                    )])
                }
            },
            _ => {
                return Err(vec![FieldError::new(
                    path,
                    "type",
                    format!("{} must be an object", path),
                )])
            }
        };

        // Recursive validation against the declared class.
        if depth >= MAX_OBJECT_DEPTH {
            return Err(vec![FieldError::new(
                path,
                "nesting",
                format!("{} exceeds the object nesting limit", path),
            )]);
        }
        match self.registry.props_of(class_id) {
            Ok(nested_props) => {
                let errors = self.validate_at(&nested_props, &mut map, path, depth + 1);
                if !errors.is_empty() {
                    return Err(errors);
                }
            }
            Err(e) => {
                warn!(class = class_id, error = %e, "Object prop references unresolvable class");
                return Err(vec![FieldError::new(
                    path,
                    "unknown_class",
                    format!("{} declares unknown class '{}'", path, class_id),
                )]);
            }
        }

        Ok(Value::Object(map))
    }
}

// ============================================================================
// Scalar coercions
// ============================================================================

fn coerce_string(
    value: Value,
    path: &str,
    options: &PropOptions,
) -> Result<Value, FieldError> {
    let text = match value {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            return Err(FieldError::new(
                path,
                "type",
                format!("{} must be a string", path),
            ))
        }
    };

    let chars = text.chars().count();
    if let Some(min) = options.min_length {
        if chars < min {
            return Err(FieldError::new(
                path,
                "min_length",
                format!("{} must be at least {} characters", path, min),
            ));
        }
    }
    if let Some(max) = options.max_length {
        if chars > max {
            return Err(FieldError::new(
                path,
                "max_length",
                format!("{} must be at most {} characters", path, max),
            ));
        }
    }
    if let Some(ref pattern) = options.pattern {
        match Regex::new(pattern) {
            Ok(re) => {
                if !re.is_match(&text) {
                    return Err(FieldError::new(
                        path,
                        "pattern",
                        format!("{} does not match pattern {}", path, pattern),
                    ));
                }
            }
            Err(_) => {
                return Err(FieldError::new(
                    path,
                    "invalid_pattern",
                    format!("{} has an invalid pattern in its schema", path),
                ))
            }
        }
    }
    check_enum(&Value::String(text.clone()), path, options)?;

    Ok(Value::String(text))
}

fn coerce_integer(
    value: Value,
    path: &str,
    options: &PropOptions,
) -> Result<Value, FieldError> {
    let type_err = || {
        FieldError::new(
            path,
            "type",
            format!("{} must be an integer", path),
        )
    };

    let n: i64 = match value {
        Value::Number(ref num) => {
            if let Some(i) = num.as_i64() {
                i
            } else if let Some(f) = num.as_f64() {
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    f as i64
                } else {
                    return Err(type_err());
                }
            } else {
                return Err(type_err());
            }
        }
        Value::String(ref s) => s.trim().parse::<i64>().map_err(|_| type_err())?,
        _ => return Err(type_err()),
    };

    check_range(n as f64, path, options)?;
    check_enum(&Value::from(n), path, options)?;
    Ok(Value::from(n))
}

fn coerce_float(value: Value, path: &str, options: &PropOptions) -> Result<Value, FieldError> {
    let type_err = || FieldError::new(path, "type", format!("{} must be a number", path));

    let f: f64 = match value {
        Value::Number(ref num) => num.as_f64().ok_or_else(type_err)?,
        Value::String(ref s) => {
            let parsed = s.trim().parse::<f64>().map_err(|_| type_err())?;
            if parsed.is_nan() || parsed.is_infinite() {
                return Err(type_err());
            }
            parsed
        }
        _ => return Err(type_err()),
    };

    check_range(f, path, options)?;
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(type_err)
}

fn coerce_boolean(value: Value, path: &str) -> Result<Value, FieldError> {
    let b = match value {
        Value::Bool(b) => b,
        Value::Number(ref n) if n.as_i64() == Some(1) => true,
        Value::Number(ref n) if n.as_i64() == Some(0) => false,
        Value::String(ref s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => {
                return Err(FieldError::new(
                    path,
                    "type",
                    format!("{} must be a boolean", path),
                ))
            }
        },
        _ => {
            return Err(FieldError::new(
                path,
                "type",
                format!("{} must be a boolean", path),
            ))
        }
    };
    Ok(Value::Bool(b))
}

fn coerce_relation_id(value: Value, path: &str) -> Result<Value, FieldError> {
    match value {
        Value::String(ref s) if !s.is_empty() => Ok(value),
        _ => Err(FieldError::new(
            path,
            "type",
            format!("{} must be a target object id", path),
        )),
    }
}

fn check_range(n: f64, path: &str, options: &PropOptions) -> Result<(), FieldError> {
    if let Some(min) = options.min {
        if n < min {
            return Err(FieldError::new(
                path,
                "min",
                format!("{} must be >= {}", path, min),
            ));
        }
    }
    if let Some(max) = options.max {
        if n > max {
            return Err(FieldError::new(
                path,
                "max",
                format!("{} must be <= {}", path, max),
            ));
        }
    }
    Ok(())
}

fn check_enum(value: &Value, path: &str, options: &PropOptions) -> Result<(), FieldError> {
    if let Some(ref allowed) = options.values {
        if !allowed.iter().any(|v| v == value) {
            return Err(FieldError::new(
                path,
                "enum",
                format!("{} must be one of the allowed values", path),
            ));
        }
    }
    Ok(())
}
