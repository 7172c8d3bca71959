// Copyright (c) 2026 Taskpilot Contributors
// SPDX-License-Identifier: AGPL-3.0
//! # Step Input Templates
//!
//! Step inputs may reference outputs of earlier steps through `{{path}}`
//! placeholders. A path is `seg(.seg)*` where each segment is
//! `name([index])*`, e.g. `step1.result.items[0].id`. The first segment names a
//! working memory entry (`step<N>` or `context`).
//!
//! | Placeholder position | Substitution |
//! |----------------------|--------------|
//! | the whole string (`"{{step1.items}}"`) | the referenced JSON value, type preserved |
//! | embedded (`"Issue {{step1.number}} opened"`) | strings raw, other values as compact JSON |
//!
//! Resolution is strict: a path that does not resolve is a
//! [`StepError::UnresolvedReference`], never an empty string.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::domain::run::StepError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"));

static WHOLE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{\s*([^{}]+?)\s*\}\}$").expect("placeholder pattern is valid"));

static STEP_ROOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^step([0-9]+)$").expect("step root pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Split a path into key and index segments. `None` on malformed syntax.
fn parse_path(path: &str) -> Option<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (name, mut rest) = match part.find('[') {
            Some(pos) => part.split_at(pos),
            None => (part, ""),
        };
        if name.is_empty() {
            return None;
        }
        segments.push(Segment::Key(name));
        while !rest.is_empty() {
            let close = rest.find(']')?;
            if !rest.starts_with('[') {
                return None;
            }
            let index = rest[1..close].parse::<usize>().ok()?;
            segments.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Some(segments)
}

/// Look a path up against a lookup function for the root segment.
pub fn lookup<'a, F>(path: &str, root: F) -> Option<&'a Value>
where
    F: FnOnce(&str) -> Option<&'a Value>,
{
    let segments = parse_path(path)?;
    let mut iter = segments.into_iter();
    let mut current = match iter.next()? {
        Segment::Key(name) => root(name)?,
        Segment::Index(_) => return None,
    };
    for segment in iter {
        current = match segment {
            Segment::Key(name) => current.as_object()?.get(name)?,
            Segment::Index(i) => current.as_array()?.get(i)?,
        };
    }
    Some(current)
}

/// Resolve every placeholder in `input`, recursing through arrays and object
/// values. Object keys are never templated.
pub fn resolve<'a, F>(input: &Value, root: &F) -> Result<Value, StepError>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    match input {
        Value::String(s) => resolve_string(s, root),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, root))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, root)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string<'a, F>(s: &str, root: &F) -> Result<Value, StepError>
where
    F: Fn(&str) -> Option<&'a Value>,
{
    if let Some(caps) = WHOLE_PLACEHOLDER.captures(s) {
        let path = &caps[1];
        return lookup(path, root)
            .cloned()
            .ok_or_else(|| unresolved(path));
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(s) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = lookup(path.as_str(), root).ok_or_else(|| unresolved(path.as_str()))?;
        out.push_str(&s[last..whole.start()]);
        match value {
            Value::String(text) => out.push_str(text),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

fn unresolved(path: &str) -> StepError {
    StepError::UnresolvedReference {
        path: path.to_string(),
    }
}

/// Every placeholder path appearing anywhere in `input`.
pub fn referenced_paths(input: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_paths(input, &mut paths);
    paths
}

fn collect_paths(input: &Value, paths: &mut Vec<String>) {
    match input {
        Value::String(s) => {
            paths.extend(PLACEHOLDER.captures_iter(s).map(|c| c[1].to_string()));
        }
        Value::Array(items) => items.iter().for_each(|v| collect_paths(v, paths)),
        Value::Object(map) => map.values().for_each(|v| collect_paths(v, paths)),
        _ => {}
    }
}

/// Step number named by the root segment of a path, if it is `step<N>`.
pub fn root_step_number(path: &str) -> Option<u32> {
    let root = path.split(['.', '[']).next()?;
    STEP_ROOT.captures(root)?.get(1)?.as_str().parse().ok()
}
