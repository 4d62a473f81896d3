//! Force scheduler models and parameter resolution.
//!
//! A force scheduler describes its parameters as a tree of fields: leaf
//! parameters carry a `fullName`, layout groups nest further fields. Forcing
//! a build needs a flat parameter map, so the tree is flattened here into
//! fixed values (sent as-is) and editable fields (asked from the operator).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ForemanError;

/// Field names supplied by the client itself, never by the operator.
pub const RESERVED_FIELDS: [&str; 2] = ["username", "owner"];

/// Deepest nesting accepted in a field tree.
pub const MAX_FIELD_DEPTH: usize = 32;

/// Field type whose value always comes from its default.
const FIXED_TYPE: &str = "fixed";

/// A node of a force scheduler's parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForceField {
    /// Parameter name as sent to the scheduler. Only addressable fields have one.
    #[serde(rename = "fullName", default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,

    /// Short name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Display label.
    #[serde(default)]
    pub label: String,

    /// Parameter type (`text`, `int`, `bool`, `fixed`, `nested`, ...).
    #[serde(rename = "type", default)]
    pub field_type: String,

    /// Whether a value must be supplied.
    #[serde(default)]
    pub required: bool,

    /// Default value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Hidden from the force form.
    #[serde(default)]
    pub hide: bool,

    /// Nested fields of a group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<ForceField>,
}

impl ForceField {
    /// The parameter name, if this field is addressable.
    pub fn parameter_name(&self) -> Option<&str> {
        self.full_name.as_deref().filter(|name| !name.is_empty())
    }

    /// True for `fixed` fields.
    pub fn is_fixed(&self) -> bool {
        self.field_type == FIXED_TYPE
    }
}

/// A force scheduler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForceScheduler {
    /// Scheduler name, used in the endpoint path.
    pub name: String,

    /// Display label.
    #[serde(default)]
    pub label: String,

    /// Names of the builders this scheduler can trigger.
    #[serde(default)]
    pub builder_names: Vec<String>,

    /// Label of the force button.
    #[serde(default)]
    pub button_name: Option<String>,

    /// Parameter tree.
    #[serde(default)]
    pub all_fields: Vec<ForceField>,
}

impl ForceScheduler {
    /// True if this scheduler can trigger the named builder.
    pub fn targets(&self, builder_name: &str) -> bool {
        self.builder_names.iter().any(|name| name == builder_name)
    }

    /// Display label, falling back to the name.
    pub fn display_label(&self) -> &str {
        if self.label.is_empty() {
            &self.name
        } else {
            &self.label
        }
    }
}

/// An operator-editable parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct EditableField {
    /// Parameter name.
    pub name: String,
    /// Label shown when asking for the value.
    pub label: String,
    /// Current (default) value.
    pub value: Option<Value>,
    /// Whether the parameter must be supplied.
    pub required: bool,
}

impl EditableField {
    /// The current value rendered as text for a prompt.
    pub fn value_text(&self) -> Option<String> {
        self.value.as_ref().map(value_to_text)
    }
}

/// A force scheduler's parameters, flattened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedFields {
    /// Values of `fixed` fields, sent unchanged.
    pub fixed: Map<String, Value>,
    /// Fields the operator fills in, in presentation order.
    pub editable: Vec<EditableField>,
    /// Hidden non-fixed fields. They are neither defaulted nor asked for.
    pub omitted: Vec<String>,
}

/// Collects every addressable field of a tree in depth-first encounter order.
///
/// # Errors
///
/// Returns `ForemanError::Protocol` if the tree nests deeper than
/// [`MAX_FIELD_DEPTH`].
pub fn addressable_fields(fields: &[ForceField]) -> Result<Vec<&ForceField>, ForemanError> {
    let mut found = Vec::new();
    let mut stack: Vec<(&ForceField, usize)> = fields.iter().rev().map(|f| (f, 1)).collect();

    while let Some((field, depth)) = stack.pop() {
        if depth > MAX_FIELD_DEPTH {
            return Err(ForemanError::protocol(format!(
                "force field tree nested deeper than {} levels",
                MAX_FIELD_DEPTH
            )));
        }
        if field.parameter_name().is_some() {
            found.push(field);
        }
        stack.extend(field.fields.iter().rev().map(|f| (f, depth + 1)));
    }

    Ok(found)
}

/// Splits a field tree into fixed values and editable fields.
///
/// Reserved names (`username`, `owner`) are skipped.
///
/// # Errors
///
/// Propagates the depth error of [`addressable_fields`].
pub fn resolve_fields(fields: &[ForceField]) -> Result<ResolvedFields, ForemanError> {
    let mut resolved = ResolvedFields::default();

    for field in addressable_fields(fields)? {
        let Some(name) = field.parameter_name() else {
            continue;
        };
        if RESERVED_FIELDS.contains(&name) {
            continue;
        }

        if field.is_fixed() {
            if let Some(default) = &field.default {
                resolved.fixed.insert(name.to_string(), default.clone());
            }
        } else if !field.hide {
            resolved.editable.push(EditableField {
                name: name.to_string(),
                label: field.label.clone(),
                value: field.default.clone(),
                required: field.required,
            });
        } else {
            tracing::debug!(field = %name, "Skipping hidden force field without fixed value");
            resolved.omitted.push(name.to_string());
        }
    }

    Ok(resolved)
}

impl ResolvedFields {
    /// Names of required editable fields with no value in `values` and no default.
    pub fn missing_required(&self, values: &HashMap<String, String>) -> Vec<&str> {
        self.editable
            .iter()
            .filter(|f| f.required)
            .filter(|f| match values.get(&f.name) {
                Some(v) => v.is_empty(),
                None => f.value.as_ref().map_or(true, |d| value_to_text(d).is_empty()),
            })
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Names in `values` that are not editable fields, sorted.
    ///
    /// Fixed, hidden, reserved and unknown names all end up here.
    pub fn unexpected_values<'a>(&self, values: &'a HashMap<String, String>) -> Vec<&'a str> {
        let mut names: Vec<&str> = values
            .keys()
            .map(String::as_str)
            .filter(|name| !self.editable.iter().any(|f| f.name == *name))
            .collect();
        names.sort_unstable();
        names
    }

    /// Builds the parameter map sent to the scheduler.
    ///
    /// Fixed values first, then editable defaults, then the `values` of
    /// editable fields on top. Other entries of `values` are ignored.
    /// `builderid` and `owner` are written last and cannot be overridden.
    pub fn parameters(
        &self,
        values: &HashMap<String, String>,
        builderid: u64,
        owner: &str,
    ) -> Map<String, Value> {
        let mut params = self.fixed.clone();

        for field in &self.editable {
            if let Some(default) = &field.value {
                params.insert(field.name.clone(), default.clone());
            }
        }
        for field in &self.editable {
            if let Some(value) = values.get(&field.name) {
                params.insert(field.name.clone(), Value::String(value.clone()));
            }
        }

        params.insert("builderid".to_string(), Value::from(builderid));
        params.insert("owner".to_string(), Value::String(owner.to_string()));
        params
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
