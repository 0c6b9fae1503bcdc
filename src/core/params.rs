//! Protocol parameters
//!
//! A [`ParameterSet`] is built from user input, validated once against the
//! protocol's [`ParamDecl`] list, and then shared read-only by every step.

use crate::error::{PipelineError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Path(PathBuf),
    /// Name of an input record set
    Reference(String),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Path(_) => ParamKind::Path,
            ParamValue::Reference(_) => ParamKind::Reference,
            ParamValue::Text(_) => ParamKind::Text,
        }
    }

    /// Convert to `kind` where the conversion loses nothing
    fn coerce(self, kind: ParamKind) -> Option<ParamValue> {
        match (self, kind) {
            (v, k) if v.kind() == k => Some(v),
            (ParamValue::Int(i), ParamKind::Float) => Some(ParamValue::Float(i as f64)),
            (ParamValue::Float(f), ParamKind::Int) if f.fract() == 0.0 => {
                Some(ParamValue::Int(f as i64))
            }
            (ParamValue::Text(s), ParamKind::Path) => Some(ParamValue::Path(PathBuf::from(s))),
            (ParamValue::Text(s), ParamKind::Reference) => Some(ParamValue::Reference(s)),
            (ParamValue::Int(i), ParamKind::Text) => Some(ParamValue::Text(i.to_string())),
            (ParamValue::Text(s), ParamKind::Bool) => match s.to_ascii_lowercase().as_str() {
                "true" | "yes" => Some(ParamValue::Bool(true)),
                "false" | "no" => Some(ParamValue::Bool(false)),
                _ => None,
            },
            _ => None,
        }
    }

    /// Parse a YAML value: scalars map directly, `{path: ..}` and `{ref: ..}`
    /// select the path and reference kinds
    pub fn from_yaml(value: &serde_yaml::Value) -> Result<Self> {
        use serde_yaml::Value as Y;
        match value {
            Y::Bool(b) => Ok(ParamValue::Bool(*b)),
            Y::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(ParamValue::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(ParamValue::Float(f))
                } else {
                    Err(PipelineError::config(format!("unsupported number: {}", n)))
                }
            }
            Y::String(s) => Ok(ParamValue::Text(s.clone())),
            Y::Mapping(map) if map.len() == 1 => {
                let (key, inner) = map
                    .iter()
                    .next()
                    .ok_or_else(|| PipelineError::config("empty parameter mapping"))?;
                let inner = inner
                    .as_str()
                    .ok_or_else(|| PipelineError::config("path/ref values must be strings"))?;
                match key.as_str() {
                    Some("path") => Ok(ParamValue::Path(PathBuf::from(inner))),
                    Some("ref") => Ok(ParamValue::Reference(inner.to_string())),
                    _ => Err(PipelineError::config(format!(
                        "unsupported parameter mapping key: {:?}",
                        key
                    ))),
                }
            }
            other => Err(PipelineError::config(format!(
                "unsupported parameter value: {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Path(p) => write!(f, "{}", p.display()),
            ParamValue::Reference(r) => write!(f, "@{}", r),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    Path,
    Reference,
    Text,
}

/// Enabling condition: the declaration applies only when another parameter
/// holds the given value
#[derive(Debug, Clone, PartialEq)]
pub struct ParamCondition {
    pub param: String,
    pub equals: ParamValue,
}

/// Declaration of a protocol parameter
#[derive(Debug, Clone)]
pub struct ParamDecl {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    pub required: bool,
    pub condition: Option<ParamCondition>,
}

impl ParamDecl {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            condition: None,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Float)
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Bool)
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Path)
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Reference)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Text)
    }

    pub fn default(mut self, value: ParamValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Only applies when `param` equals `value`
    pub fn when(mut self, param: impl Into<String>, value: ParamValue) -> Self {
        self.condition = Some(ParamCondition {
            param: param.into(),
            equals: value,
        });
        self
    }
}

/// Immutable map of parameter name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    values: BTreeMap<String, ParamValue>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    /// Build from a YAML mapping of name to value
    pub fn from_yaml_mapping(mapping: &serde_yaml::Mapping) -> Result<Self> {
        let mut set = Self::new();
        for (key, value) in mapping {
            let name = key
                .as_str()
                .ok_or_else(|| PipelineError::config("parameter names must be strings"))?;
            let value = ParamValue::from_yaml(value)
                .map_err(|e| PipelineError::config(format!("parameter '{}': {}", name, e)))?;
            set.insert(name, value);
        }
        Ok(set)
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.values.iter()
    }

    fn require(&self, name: &str) -> Result<&ParamValue> {
        self.values
            .get(name)
            .ok_or_else(|| PipelineError::config(format!("missing parameter '{}'", name)))
    }

    fn wrong_kind(name: &str, expected: &str, found: &ParamValue) -> PipelineError {
        PipelineError::config(format!(
            "parameter '{}' must be {}, got {:?}",
            name, expected, found
        ))
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        match self.require(name)? {
            ParamValue::Int(v) => Ok(*v),
            other => Err(Self::wrong_kind(name, "an integer", other)),
        }
    }

    pub fn get_float(&self, name: &str) -> Result<f64> {
        match self.require(name)? {
            ParamValue::Float(v) => Ok(*v),
            ParamValue::Int(v) => Ok(*v as f64),
            other => Err(Self::wrong_kind(name, "a number", other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool> {
        match self.require(name)? {
            ParamValue::Bool(v) => Ok(*v),
            other => Err(Self::wrong_kind(name, "a boolean", other)),
        }
    }

    pub fn get_path(&self, name: &str) -> Result<&Path> {
        match self.require(name)? {
            ParamValue::Path(p) => Ok(p),
            other => Err(Self::wrong_kind(name, "a path", other)),
        }
    }

    pub fn get_reference(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            ParamValue::Reference(r) => Ok(r),
            other => Err(Self::wrong_kind(name, "an input reference", other)),
        }
    }

    pub fn get_text(&self, name: &str) -> Result<&str> {
        match self.require(name)? {
            ParamValue::Text(s) => Ok(s),
            other => Err(Self::wrong_kind(name, "text", other)),
        }
    }

    /// Optional boolean, false when unset
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(ParamValue::Bool(true)))
    }

    /// Parse an integer list such as `"1,3,6-9,12"`
    pub fn get_int_list(&self, name: &str) -> Result<Vec<i64>> {
        match self.require(name)? {
            ParamValue::Text(s) => parse_int_list(s)
                .map_err(|e| PipelineError::config(format!("parameter '{}': {}", name, e))),
            ParamValue::Int(v) => Ok(vec![*v]),
            other => Err(Self::wrong_kind(name, "an integer list", other)),
        }
    }

    /// Apply defaults and coercions from `decls` and reject missing required
    /// parameters. Returns the validated set.
    pub fn validate(&self, decls: &[ParamDecl]) -> Result<ParameterSet> {
        let mut values = self.values.clone();

        for decl in decls {
            if let Some(value) = values.remove(&decl.name) {
                let kind = value.kind();
                let coerced = value.coerce(decl.kind).ok_or_else(|| {
                    PipelineError::config(format!(
                        "parameter '{}' expects {:?}, got {:?}",
                        decl.name, decl.kind, kind
                    ))
                })?;
                values.insert(decl.name.clone(), coerced);
            } else if let Some(default) = &decl.default {
                values.insert(decl.name.clone(), default.clone());
            }
        }

        for decl in decls {
            if !decl.required || values.contains_key(&decl.name) {
                continue;
            }
            let enabled = match &decl.condition {
                Some(cond) => values.get(&cond.param) == Some(&cond.equals),
                None => true,
            };
            if enabled {
                return Err(PipelineError::config(format!(
                    "missing required parameter '{}'",
                    decl.name
                )));
            }
        }

        for name in values.keys() {
            if !decls.iter().any(|d| &d.name == name) {
                warn!("Ignoring undeclared parameter '{}'", name);
            }
        }

        Ok(ParameterSet { values })
    }
}

/// Parse `"1,3,6-9,12"` into `[1, 3, 6, 7, 8, 9, 12]`
pub fn parse_int_list(text: &str) -> std::result::Result<Vec<i64>, String> {
    let range = Regex::new(r"^\s*(-?\d+)\s*-\s*(-?\d+)\s*$").map_err(|e| e.to_string())?;
    let mut out = Vec::new();

    for part in text.split(',').filter(|p| !p.trim().is_empty()) {
        if let Some(caps) = range.captures(part) {
            let start: i64 = caps[1].parse().map_err(|_| format!("bad range '{}'", part))?;
            let end: i64 = caps[2].parse().map_err(|_| format!("bad range '{}'", part))?;
            if end < start {
                return Err(format!("descending range '{}'", part.trim()));
            }
            out.extend(start..=end);
        } else {
            let value = part
                .trim()
                .parse()
                .map_err(|_| format!("'{}' is not an integer", part.trim()))?;
            out.push(value);
        }
    }

    Ok(out)
}
