//! List-or-map normalization and environment interpolation

use super::config::ListOrDict;
use crate::error::{BerthError, Result};
use regex::{Captures, Regex};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use tracing::warn;

/// Source of variable values for interpolation
pub trait Environment: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl Environment for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Normalize a list of `KEY=VALUE` strings or a map into a string map
///
/// List entries split on the first `=`. An entry without a value is kept
/// as an empty string only when `reserve_empty` is set. Map values are
/// stringified; `null` becomes an empty string.
pub fn normalize_dict(src: &ListOrDict, reserve_empty: bool) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    match src {
        ListOrDict::List(items) => {
            for item in items {
                let (key, value) = match item.split_once('=') {
                    Some((k, v)) => (k, v),
                    None => (item.as_str(), ""),
                };
                if !value.is_empty() {
                    result.insert(key.to_string(), value.to_string());
                } else if reserve_empty {
                    result.insert(key.to_string(), String::new());
                }
            }
        }
        ListOrDict::Dict(map) => {
            for (key, value) in map {
                let value = value.as_ref().map(|v| v.to_string()).unwrap_or_default();
                result.insert(key.clone(), value);
            }
        }
    }
    result
}

fn interpolation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\$\$|\$([_a-zA-Z][_a-zA-Z0-9]*)|\$\{([_a-zA-Z][_a-zA-Z0-9]*)(?:(:?[?\-+])([^{}]*))?\}",
        )
        .expect("valid interpolation regex")
    })
}

/// Expands `$VAR` and `${VAR...}` against an [`Environment`]
///
/// Unset variables referenced without an operator expand to an empty string
/// and leave a diagnostic behind.
pub struct Interpolator<'a> {
    env: &'a dyn Environment,
    diagnostics: Vec<String>,
}

impl<'a> Interpolator<'a> {
    pub fn new(env: &'a dyn Environment) -> Self {
        Self {
            env,
            diagnostics: Vec::new(),
        }
    }

    /// Diagnostics collected so far
    pub fn diagnostics(&self) -> &[String] {
        &self.diagnostics
    }

    pub fn into_diagnostics(self) -> Vec<String> {
        self.diagnostics
    }

    /// Expand every variable reference in a string
    ///
    /// Substituted text is not expanded again. `$$` yields a literal `$`.
    pub fn interpolate(&mut self, src: &str) -> Result<String> {
        let re = interpolation_regex();
        let mut out = String::with_capacity(src.len());
        let mut last = 0;
        for caps in re.captures_iter(src) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&src[last..whole.start()]);
            out.push_str(&self.expand(&caps)?);
            last = whole.end();
        }
        out.push_str(&src[last..]);
        Ok(out)
    }

    fn expand(&mut self, caps: &Captures<'_>) -> Result<String> {
        let Some(name) = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()) else {
            // `$$`
            return Ok("$".to_string());
        };
        let value = self.env.var(name);
        let Some(operator) = caps.get(3).map(|m| m.as_str()) else {
            return Ok(match value {
                Some(v) => v,
                None => {
                    let message = format!("Environment variable {} is not set", name);
                    warn!("{}", message);
                    self.diagnostics.push(message);
                    String::new()
                }
            });
        };
        let word = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let set_and_nonempty = value.as_deref().is_some_and(|v| !v.is_empty());

        match operator {
            "-" => Ok(value.unwrap_or_else(|| word.to_string())),
            ":-" => Ok(if set_and_nonempty {
                value.unwrap_or_default()
            } else {
                word.to_string()
            }),
            "+" => Ok(if value.is_some() {
                word.to_string()
            } else {
                String::new()
            }),
            ":+" => Ok(if set_and_nonempty {
                word.to_string()
            } else {
                String::new()
            }),
            "?" => value.ok_or_else(|| BerthError::MissingVariable {
                name: name.to_string(),
                message: if word.is_empty() {
                    "is not set".to_string()
                } else {
                    word.to_string()
                },
            }),
            ":?" => {
                if set_and_nonempty {
                    Ok(value.unwrap_or_default())
                } else {
                    Err(BerthError::MissingVariable {
                        name: name.to_string(),
                        message: if word.is_empty() {
                            "is empty or not set".to_string()
                        } else {
                            word.to_string()
                        },
                    })
                }
            }
            _ => Ok(String::new()),
        }
    }

    /// Interpolate every string leaf of a value; map keys are left alone
    pub fn traverse(&mut self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.interpolate(s)?),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.traverse(item))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.traverse(item)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }
}

/// Interpolate a single string
pub fn interpolate(src: &str, env: &dyn Environment) -> Result<String> {
    Interpolator::new(env).interpolate(src)
}

/// Interpolate every string inside a value
pub fn traverse_interpolate(value: &Value, env: &dyn Environment) -> Result<Value> {
    Interpolator::new(env).traverse(value)
}
