//! YAML DSL compiler for SOP flows.
//!
//! Turns a procedure document into a flat [`FlowDefinition`]: nested loop
//! and branch bodies are hoisted into the top-level step map and wired back
//! together with explicit transitions.

use crate::error::WorkflowError;
use crate::workflow::expression::is_truthy;
use crate::workflow::types::{FlowDefinition, StepConfig, StepDefinition, StepKind, Transition};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Localized keyword synonyms, normalized to their internal spelling.
const KEYWORDS: &[(&str, &str)] = &[
    ("步骤", "steps"),
    ("名称", "name"),
    ("描述", "description"),
    ("分支", "branch"),
    ("如果", "if"),
    ("否则", "else"),
    ("循环", "loop"),
    ("遍历", "iterate"),
    ("等待", "wait"),
    ("跳转", "jump"),
    ("断言", "assert"),
    ("条件", "condition"),
    ("终止", "terminate"),
    ("目标", "target"),
    ("原因", "reason"),
    ("子步骤", "children"),
    ("类型", "type"),
    ("配置", "config"),
    ("失败跳转", "onFail"),
    ("重试", "retry"),
    ("次数", "count"),
    ("下一步", "next"),
    ("去", "go"),
];

/// Keys the compiler interprets; everything else is forwarded to `extra`.
const CONSUMED_KEYS: &[&str] = &[
    "steps", "children", "name", "type", "next", "if", "else", "condition", "onFail", "target",
    "iterate", "go", "assert", "wait", "jump", "terminate", "branch", "reason", "auto",
];

const UNNAMED: &str = "unnamed";

/// Compile a YAML flow document into a transition graph.
///
/// Fails when the text is not YAML, the root is not a mapping, `steps` is
/// not a list, or a step name is declared twice anywhere in the document.
pub fn parse_flow(text: &str) -> Result<FlowDefinition, WorkflowError> {
    let raw: Value = serde_yaml::from_str(text).map_err(|e| WorkflowError::Parse {
        message: e.to_string(),
    })?;
    let Value::Object(root) = normalize(raw) else {
        return Err(WorkflowError::Parse {
            message: "Invalid YAML: expected a mapping".to_string(),
        });
    };

    let name = root
        .get("name")
        .and_then(scalar_text)
        .unwrap_or_else(|| "unnamed flow".to_string());
    let description = root
        .get("description")
        .and_then(scalar_text)
        .unwrap_or_default();
    let Some(Value::Array(raw_steps)) = root.get("steps") else {
        return Err(WorkflowError::Parse {
            message: "Invalid flow: missing \"steps\" list".to_string(),
        });
    };

    let duplicates = duplicate_names(raw_steps);
    if !duplicates.is_empty() {
        return Err(WorkflowError::Parse {
            message: format!("Duplicate step names: {}", duplicates.join(", ")),
        });
    }

    let mut steps = IndexMap::new();
    flatten_steps(raw_steps, &mut steps, None);
    let entry = steps.keys().next().cloned().unwrap_or_default();

    debug!(flow = %name, steps = steps.len(), entry = %entry, "Compiled flow");
    Ok(FlowDefinition {
        name,
        description,
        steps,
        entry,
    })
}

fn normalize_key(key: &str) -> String {
    KEYWORDS
        .iter()
        .find(|(synonym, _)| *synonym == key)
        .map(|(_, internal)| (*internal).to_string())
        .unwrap_or_else(|| key.to_string())
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (normalize_key(&k), normalize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        other => other,
    }
}

/// Render a falsy-aware scalar as text: strings as-is, numbers and booleans
/// through their JSON form. Null, empty and non-scalar values yield `None`.
fn scalar_text(value: &Value) -> Option<String> {
    if !is_truthy(value) {
        return None;
    }
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(_) | Value::Bool(_) => Some(value.to_string()),
        _ => None,
    }
}

/// Split one raw list item into its step name and body mapping.
fn parse_raw_step(raw: &Value) -> (String, Map<String, Value>) {
    let map = match normalize(raw.clone()) {
        Value::String(name) => return (name, Map::new()),
        Value::Object(map) => map,
        _ => return (UNNAMED.to_string(), Map::new()),
    };

    if let Some(name) = map.get("name") {
        let name = match name {
            Value::String(s) => s.clone(),
            Value::Null => UNNAMED.to_string(),
            other => other.to_string(),
        };
        return (name, map);
    }

    if map.len() == 1 {
        if let Some((name, body)) = map.iter().next() {
            match body {
                Value::Null => return (name.clone(), Map::new()),
                Value::Object(body) => return (name.clone(), body.clone()),
                _ => {}
            }
        }
    }

    (UNNAMED.to_string(), map)
}

fn children_of(body: &Map<String, Value>) -> &[Value] {
    for key in ["steps", "children"] {
        if let Some(Value::Array(items)) = body.get(key) {
            if !items.is_empty() {
                return items;
            }
        }
    }
    &[]
}

fn collect_names(raw_steps: &[Value], names: &mut Vec<String>) {
    for raw in raw_steps {
        let (name, body) = parse_raw_step(raw);
        names.push(name);
        collect_names(children_of(&body), names);
    }
}

/// Names declared more than once, in first-seen order.
fn duplicate_names(raw_steps: &[Value]) -> Vec<String> {
    let mut names = Vec::new();
    collect_names(raw_steps, &mut names);

    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name)
        .collect()
}

fn infer_kind(body: &Map<String, Value>) -> StepKind {
    if let Some(explicit) = body.get("type") {
        let text = explicit.as_str().map(str::to_string).unwrap_or_else(|| explicit.to_string());
        return match text.parse() {
            Ok(kind) => kind,
            Err(e) => {
                warn!(step_type = %text, error = %e, "Unknown step type, treating as task");
                StepKind::Task
            }
        };
    }

    let has = |key: &str| body.contains_key(key);
    if has("branch") || (has("if") && !has("children") && !has("steps")) {
        StepKind::Branch
    } else if has("loop") || has("iterate") {
        StepKind::Loop
    } else if has("wait") {
        StepKind::Wait
    } else if has("jump") || (has("target") && !has("condition")) {
        StepKind::Jump
    } else if has("assert") || has("condition") {
        StepKind::Assert
    } else if has("terminate") {
        StepKind::Terminate
    } else {
        StepKind::Task
    }
}

/// First truthy value among `keys`, as text.
fn first_text(body: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| body.get(*key).and_then(scalar_text))
}

/// Flatten `raw_steps` into `out`. `continuation` is where control goes
/// after the last step of this list.
fn flatten_steps(
    raw_steps: &[Value],
    out: &mut IndexMap<String, StepDefinition>,
    continuation: Option<&str>,
) {
    let parsed: Vec<(String, Map<String, Value>)> = raw_steps.iter().map(parse_raw_step).collect();

    for (idx, (name, body)) in parsed.iter().enumerate() {
        let implicit_next = parsed
            .get(idx + 1)
            .map(|(next, _)| next.as_str())
            .or(continuation);
        let kind = infer_kind(body);
        let children = children_of(body);
        let first_child = children.first().map(|raw| parse_raw_step(raw).0);

        let mut config = StepConfig::new(kind);
        let mut transitions = Vec::new();

        match kind {
            StepKind::Wait => config.wait = true,
            StepKind::Terminate => {
                config.terminate = true;
                config.reason = first_text(body, &["reason"]);
            }
            _ => {}
        }

        // Children first, then explicit `next`, then per-kind sugar.
        let mut nested: Option<Option<&str>> = None;
        match (kind, &first_child) {
            (StepKind::Loop, Some(first)) => {
                config.iterate = first_text(body, &["iterate"]);
                transitions.push(Transition::to(first.clone()));
                if let Some(next) = implicit_next {
                    transitions.push(Transition::to(next));
                }
                nested = Some(Some(name.as_str()));
            }
            (StepKind::Branch, Some(first)) => {
                config.auto = true;
                match first_text(body, &["if", "condition"]) {
                    Some(condition) => transitions.push(Transition::when(first.clone(), condition)),
                    None => transitions.push(Transition::to(first.clone())),
                }
                if let Some(next) = implicit_next {
                    transitions.push(Transition::to(next));
                }
                nested = Some(implicit_next);
            }
            _ if body.contains_key("next") => {
                explicit_transitions(&body["next"], &mut transitions);
            }
            (StepKind::Terminate, _) => {}
            (StepKind::Assert, _) => {
                config.auto = true;
                let condition = first_text(body, &["condition", "assert"]);
                let fail_target = first_text(body, &["onFail", "target"]);
                match condition {
                    Some(condition) => {
                        if let Some(next) = implicit_next {
                            transitions.push(Transition::when(next, condition));
                        }
                        if let Some(fail) = fail_target {
                            transitions.push(Transition::to(fail));
                        }
                    }
                    None => {
                        if let Some(next) = implicit_next {
                            transitions.push(Transition::to(next));
                        }
                    }
                }
            }
            (StepKind::Jump, _) => {
                config.auto = true;
                let target = first_text(body, &["target"]).or_else(|| {
                    body.get("jump").and_then(Value::as_str).map(str::to_string)
                });
                if let Some(target) = target {
                    transitions.push(Transition::to(target));
                }
            }
            _ => {
                if let Some(next) = implicit_next {
                    transitions.push(Transition::to(next));
                }
            }
        }

        for (key, value) in body {
            if key == "auto" {
                config.auto |= is_truthy(value);
            } else if !CONSUMED_KEYS.contains(&key.as_str()) {
                config.extra.insert(key.clone(), value.clone());
            }
        }

        out.insert(
            name.clone(),
            StepDefinition::new(name.clone(), config).with_transitions(transitions),
        );

        if let Some(child_continuation) = nested {
            flatten_steps(children, out, child_continuation);
        }
    }
}

/// Explicit `next:` accepts a step name or a list of names and
/// `{if|condition, go|target}` mappings.
fn explicit_transitions(next: &Value, transitions: &mut Vec<Transition>) {
    match next {
        Value::String(target) => transitions.push(Transition::to(target.clone())),
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(map) => {
                        let Some(target) = first_text(map, &["go", "target"]) else {
                            continue;
                        };
                        transitions.push(Transition {
                            target,
                            condition: first_text(map, &["if", "condition"]),
                        });
                    }
                    Value::String(target) => transitions.push(Transition::to(target.clone())),
                    _ => {}
                }
            }
        }
        _ => {}
    }
}
