//! Pipeline stage expressions, parsed from their JSON form.

use crate::error::{Fault, FaultResult};
use crate::utils::json_path;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Match,
    Project,
    AddFields,
    Group,
    Sort,
}

impl StageKind {
    pub fn from_operator(operator: &str) -> FaultResult<Self> {
        match operator {
            "$match" => Ok(Self::Match),
            "$project" => Ok(Self::Project),
            "$addFields" => Ok(Self::AddFields),
            "$group" => Ok(Self::Group),
            "$sort" => Ok(Self::Sort),
            other => Err(query_error(format!("Unsupported pipeline stage '{}'.", other))),
        }
    }

    /// Stages whose results expose the presence of values rather than the
    /// values themselves.
    pub fn is_selective(&self) -> bool {
        matches!(self, Self::Match | Self::Group)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Match => "$match",
            Self::Project => "$project",
            Self::AddFields => "$addFields",
            Self::Group => "$group",
            Self::Sort => "$sort",
        };
        f.write_str(name)
    }
}

pub(crate) fn query_error<S: Into<String>>(reason: S) -> Fault {
    Fault::invalid_argument("query").with_reason(reason)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectionExpr {
    /// `1` or `true`: the property at the output path.
    Include,
    /// `"$a.b"`
    Field(String),
    /// `"$$ROOT"`
    Variable(String),
    Literal(Value),
    Document(Vec<(String, ProjectionExpr)>),
    Array(Vec<ProjectionExpr>),
    Operator { name: String, args: Vec<ProjectionExpr> },
}

impl ProjectionExpr {
    pub fn parse(value: &Value) -> FaultResult<Self> {
        match value {
            Value::Bool(true) => Ok(Self::Include),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Self::Include),
            Value::Bool(false) => Err(query_error("Exclusions are not supported.")),
            Value::Number(n) if n.as_i64() == Some(0) => Err(query_error("Exclusions are not supported.")),
            Value::String(s) if s.starts_with("$$") => Ok(Self::Variable(s[2..].to_string())),
            Value::String(s) if s.starts_with('$') => {
                let path = json_path::normalize(&s[1..]);
                if path.is_empty() {
                    return Err(query_error("Empty field reference."));
                }
                Ok(Self::Field(path))
            }
            Value::Array(items) => items.iter().map(Self::parse).collect::<FaultResult<_>>().map(Self::Array),
            Value::Object(map) => {
                let mut keys = map.keys();
                if let (Some(key), None) = (keys.next(), keys.next()) {
                    if key == "$literal" {
                        return Ok(Self::Literal(map[key].clone()));
                    }
                    if let Some(name) = key.strip_prefix('$') {
                        let args = match &map[key] {
                            Value::Array(items) => items.iter().map(Self::parse_argument).collect::<FaultResult<_>>()?,
                            other => vec![Self::parse_argument(other)?],
                        };
                        return Ok(Self::Operator {
                            name: name.to_string(),
                            args,
                        });
                    }
                }
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    if key.starts_with('$') || key.contains('.') {
                        return Err(query_error(format!("Invalid field name '{}'.", key)));
                    }
                    fields.push((key.clone(), Self::parse(value)?));
                }
                Ok(Self::Document(fields))
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Operator arguments: numbers and booleans are values, not inclusions.
    fn parse_argument(value: &Value) -> FaultResult<Self> {
        match value {
            Value::Bool(_) | Value::Number(_) | Value::Null => Ok(Self::Literal(value.clone())),
            other => Self::parse(other),
        }
    }
}
