//! Operator parameter schemas and validated parameter sets.
//!
//! Each operator type declares a [`ParameterSchema`]; the resolver validates
//! the raw values of a graph node against it before the operator is created.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{ResolutionError, ResolutionResult};

/// A raw parameter value as written in a graph file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Bool(_) => ParamKind::Bool,
            Self::Int(_) => ParamKind::Int,
            Self::Float(_) => ParamKind::Float,
            Self::Text(_) => ParamKind::Text,
            Self::List(_) => ParamKind::List,
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        Self::List(v)
    }
}

impl From<Vec<&str>> for ParamValue {
    fn from(v: Vec<&str>) -> Self {
        Self::List(v.into_iter().map(String::from).collect())
    }
}

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Bool,
    Int,
    Float,
    Text,
    List,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::List => "list",
        }
    }

    /// Accept `value` for this kind, widening ints where a float is declared.
    fn coerce(&self, value: &ParamValue) -> Option<ParamValue> {
        match (self, value) {
            (Self::Float, ParamValue::Int(v)) => Some(ParamValue::Float(*v as f64)),
            (kind, value) if value.kind() == *kind => Some(value.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one operator parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub mandatory: bool,
    pub default: Option<ParamValue>,
    pub description: String,
}

impl ParamDescriptor {
    /// A parameter that must be supplied.
    pub fn mandatory(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            mandatory: true,
            default: None,
            description: String::new(),
        }
    }

    /// An optional parameter. When `default` is `None` an absent parameter is
    /// simply missing from the validated set.
    pub fn optional(name: impl Into<String>, kind: ParamKind, default: Option<ParamValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            mandatory: false,
            default,
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// The full parameter declaration of an operator type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    params: Vec<ParamDescriptor>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, param: ParamDescriptor) -> Self {
        self.params.push(param);
        self
    }

    pub fn descriptors(&self) -> &[ParamDescriptor] {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamDescriptor> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validate supplied values for `operator` and fill in defaults.
    pub fn validate(
        &self,
        operator: &str,
        supplied: &HashMap<String, ParamValue>,
    ) -> ResolutionResult<Parameters> {
        let mut names: Vec<&String> = supplied.keys().collect();
        names.sort();
        if let Some(unknown) = names.into_iter().find(|name| self.get(name).is_none()) {
            return Err(ResolutionError::invalid_parameter(
                operator,
                unknown.as_str(),
                "unknown parameter",
            ));
        }

        let mut values = BTreeMap::new();
        for param in &self.params {
            match supplied.get(&param.name) {
                Some(value) => {
                    let coerced = param.kind.coerce(value).ok_or_else(|| {
                        ResolutionError::invalid_parameter(
                            operator,
                            param.name.as_str(),
                            format!("expected {}, got {}", param.kind, value.kind()),
                        )
                    })?;
                    values.insert(param.name.clone(), coerced);
                }
                None if param.mandatory => {
                    return Err(ResolutionError::invalid_parameter(
                        operator,
                        param.name.as_str(),
                        "missing mandatory parameter",
                    ));
                }
                None => {
                    if let Some(default) = &param.default {
                        values.insert(param.name.clone(), default.clone());
                    }
                }
            }
        }

        Ok(Parameters { values })
    }
}

/// A validated parameter set with typed getters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: BTreeMap<String, ParamValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value without schema validation.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ParamValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ParamValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Int(v)) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ParamValue::Text(v)) => Some(v),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&[String]> {
        match self.values.get(name) {
            Some(ParamValue::List(v)) => Some(v),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
