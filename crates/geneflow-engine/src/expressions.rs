//! Template expression evaluator.
//!
//! Step templates and map URIs use `${...}` expressions with these scopes:
//! - `${workflow.inputs.<key>}` — a workflow input value
//! - `${workflow.parameters.<key>}` — a workflow parameter value
//! - `${step.<name>.output}` — the output URI of a dependency step
//! - `${1}` — the current map item's filename
//! - `${2}` — the filename without its extension
//!
//! `${i}` is accepted as an alias of `${1}`.

use std::collections::BTreeMap;
use std::io;

use regex::Regex;

use crate::error::{EngineError, Result};

/// Values available to a step's template expressions.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// Workflow input key -> value URI (staged for the step's context).
    pub inputs: BTreeMap<String, String>,

    /// Workflow parameter key -> rendered scalar.
    pub parameters: BTreeMap<String, String>,

    /// Dependency step name -> output URI.
    pub step_outputs: BTreeMap<String, String>,

    /// Current map item filename, when iterating a map URI.
    pub filename: Option<String>,
}

impl TemplateContext {
    pub fn with_filename(&self, filename: &str) -> TemplateContext {
        let mut ctx = self.clone();
        ctx.filename = Some(filename.to_string());
        ctx
    }
}

/// Substitute every `${...}` occurrence in `text`.
pub fn evaluate(text: &str, ctx: &TemplateContext) -> Result<String> {
    let expr_pattern = Regex::new(r"\$\{\s*([^}]+?)\s*\}")
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    let mut errors = Vec::new();

    for cap in expr_pattern.captures_iter(text) {
        let whole = cap.get(0).unwrap();
        let expr = &cap[1];
        result.push_str(&text[last..whole.start()]);
        match evaluate_single(expr, ctx) {
            Ok(value) => result.push_str(&value),
            Err(err) => errors.push(err.to_string()),
        }
        last = whole.end();
    }
    result.push_str(&text[last..]);

    if !errors.is_empty() {
        return Err(EngineError::Template(errors.join("; ")));
    }

    Ok(result)
}

fn evaluate_single(expr: &str, ctx: &TemplateContext) -> Result<String> {
    // positional map-item substitutions
    match expr {
        "1" | "i" => {
            return ctx.filename.clone().ok_or_else(|| {
                EngineError::Template(format!(
                    "'${{{}}}' is only valid inside a mapped step",
                    expr
                ))
            });
        }
        "2" => {
            let filename = ctx.filename.as_deref().ok_or_else(|| {
                EngineError::Template(
                    "'${2}' is only valid inside a mapped step".to_string(),
                )
            })?;
            return Ok(strip_extension(filename));
        }
        _ => {}
    }

    let parts: Vec<&str> = expr.split('.').collect();
    match parts.as_slice() {
        ["workflow", "inputs", key] => ctx.inputs.get(*key).cloned().ok_or_else(|| {
            EngineError::Template(format!("workflow input '{}' not found", key))
        }),
        ["workflow", "parameters", key] => {
            ctx.parameters.get(*key).cloned().ok_or_else(|| {
                EngineError::Template(format!("workflow parameter '{}' not found", key))
            })
        }
        ["step", name, "output"] => ctx.step_outputs.get(*name).cloned().ok_or_else(|| {
            EngineError::Template(format!(
                "step '{}' is not a dependency of this step",
                name
            ))
        }),
        _ => Err(EngineError::Template(format!(
            "unrecognized expression '${{{}}}'",
            expr
        ))),
    }
}

/// Filename without its last extension ("reads.fastq" -> "reads").
pub fn strip_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}
