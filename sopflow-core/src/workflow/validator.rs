//! Static analysis of compiled flows.
//!
//! Checks:
//! - The flow has steps and a valid entry point
//! - Every transition target exists
//! - Every step is reachable from the entry
//! - Non-terminate steps have an outgoing transition
//! - Loop headers have both a body and an exit transition

use crate::workflow::types::FlowDefinition;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Error,
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "ERROR"),
            DiagnosticLevel::Warning => write!(f, "WARNING"),
        }
    }
}

/// A single finding reported by [`validate_flow`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagnosticLevel, message: impl Into<String>, step: Option<&str>) -> Self {
        Self {
            level,
            message: message.into(),
            step: step.map(str::to_string),
        }
    }

    pub fn error(message: impl Into<String>, step: Option<&str>) -> Self {
        Self::new(DiagnosticLevel::Error, message, step)
    }

    pub fn warning(message: impl Into<String>, step: Option<&str>) -> Self {
        Self::new(DiagnosticLevel::Warning, message, step)
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagnosticLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}: [{}] {}", self.level, step, self.message),
            None => write!(f, "{}: {}", self.level, self.message),
        }
    }
}

/// True when any diagnostic is error-level.
pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

/// Run every static check on a compiled flow.
pub fn validate_flow(flow: &FlowDefinition) -> Vec<Diagnostic> {
    if flow.steps.is_empty() {
        return vec![Diagnostic::error("Flow has no steps", None)];
    }
    if flow.entry.is_empty() || !flow.contains(&flow.entry) {
        return vec![Diagnostic::error("Flow has no valid entry point", None)];
    }

    let mut diagnostics = Vec::new();
    check_targets(flow, &mut diagnostics);
    check_reachability(flow, &mut diagnostics);
    check_dead_ends(flow, &mut diagnostics);
    check_loops(flow, &mut diagnostics);
    diagnostics
}

fn check_targets(flow: &FlowDefinition, out: &mut Vec<Diagnostic>) {
    for step in flow.steps.values() {
        for transition in &step.transitions {
            if !flow.contains(&transition.target) {
                out.push(Diagnostic::error(
                    format!("Transition target not found: '{}'", transition.target),
                    Some(&step.name),
                ));
            }
        }
    }
}

fn check_reachability(flow: &FlowDefinition, out: &mut Vec<Diagnostic>) {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([flow.entry.as_str()]);

    while let Some(current) = queue.pop_front() {
        if !reachable.insert(current) {
            continue;
        }
        if let Some(step) = flow.step(current) {
            for transition in &step.transitions {
                if !reachable.contains(transition.target.as_str()) {
                    queue.push_back(&transition.target);
                }
            }
        }
    }

    for name in flow.steps.keys() {
        if !reachable.contains(name.as_str()) {
            out.push(Diagnostic::warning(
                "Step is unreachable from the start",
                Some(name),
            ));
        }
    }
}

fn check_dead_ends(flow: &FlowDefinition, out: &mut Vec<Diagnostic>) {
    for step in flow.steps.values() {
        if step.config.terminate {
            continue;
        }
        if step.transitions.is_empty() {
            out.push(Diagnostic::warning(
                "Step has no outgoing transitions (dead end)",
                Some(&step.name),
            ));
        }
    }
}

fn check_loops(flow: &FlowDefinition, out: &mut Vec<Diagnostic>) {
    for step in flow.steps.values() {
        if !step.config.is_loop_header() {
            continue;
        }
        match step.transitions.len() {
            0 => out.push(Diagnostic::error("Loop has no transitions", Some(&step.name))),
            1 => out.push(Diagnostic::error(
                "Loop has no body steps (empty loop)",
                Some(&step.name),
            )),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::parse_flow;
    use crate::workflow::types::{StepConfig, StepDefinition, StepKind, Transition};
    use indexmap::IndexMap;

    fn flow_of(steps: Vec<StepDefinition>) -> FlowDefinition {
        let entry = steps.first().map(|s| s.name.clone()).unwrap_or_default();
        let mut map = IndexMap::new();
        for step in steps {
            map.insert(step.name.clone(), step);
        }
        FlowDefinition {
            name: "test".into(),
            description: String::new(),
            steps: map,
            entry,
        }
    }

    #[test]
    fn test_diagnostic_display() {
        let d = Diagnostic::error("Transition target not found: 'x'", Some("a"));
        assert_eq!(d.to_string(), "ERROR: [a] Transition target not found: 'x'");
        let d = Diagnostic::warning("Flow looks odd", None);
        assert_eq!(d.to_string(), "WARNING: Flow looks odd");
    }

    #[test]
    fn test_empty_flow_reports_single_error() {
        let flow = flow_of(vec![]);
        let diags = validate_flow(&flow);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "Flow has no steps");
        assert!(has_errors(&diags));
    }

    #[test]
    fn test_missing_entry_stops_further_checks() {
        let mut flow = flow_of(vec![StepDefinition::new("a", StepConfig::default())
            .with_transitions(vec![Transition::to("ghost")])]);
        flow.entry = "nowhere".into();
        let diags = validate_flow(&flow);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "Flow has no valid entry point");
    }

    #[test]
    fn test_unknown_target_is_error() {
        let flow = flow_of(vec![StepDefinition::new("a", StepConfig::default())
            .with_transitions(vec![Transition::to("ghost")])]);
        let diags = validate_flow(&flow);
        assert!(diags.iter().any(|d| d.is_error()
            && d.step.as_deref() == Some("a")
            && d.message.contains("'ghost'")));
    }

    #[test]
    fn test_unreachable_step_is_warning() {
        let flow = parse_flow(
            r#"
name: t
steps:
  - a:
      next: c
  - b
  - c
"#,
        )
        .unwrap();
        let diags = validate_flow(&flow);
        assert!(!has_errors(&diags));
        let unreachable: Vec<_> = diags
            .iter()
            .filter(|d| d.message == "Step is unreachable from the start")
            .collect();
        assert_eq!(unreachable.len(), 1);
        assert_eq!(unreachable[0].step.as_deref(), Some("b"));
    }

    #[test]
    fn test_dead_end_warning_skips_terminate() {
        let flow = parse_flow(
            r#"
name: t
steps:
  - a
  - finish:
      terminate: true
"#,
        )
        .unwrap();
        let diags = validate_flow(&flow);
        assert!(diags.is_empty(), "unexpected: {diags:?}");

        let flow = flow_of(vec![StepDefinition::new("solo", StepConfig::default())]);
        let diags = validate_flow(&flow);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].level, DiagnosticLevel::Warning);
        assert!(diags[0].message.contains("dead end"));
    }

    #[test]
    fn test_loop_without_exit_is_error() {
        let mut config = StepConfig::new(StepKind::Loop);
        config.iterate = Some("items".into());
        let flow = flow_of(vec![
            StepDefinition::new("l", config.clone()).with_transitions(vec![Transition::to("body")]),
            StepDefinition::new("body", StepConfig::default())
                .with_transitions(vec![Transition::to("l")]),
        ]);
        let diags = validate_flow(&flow);
        assert!(diags
            .iter()
            .any(|d| d.is_error() && d.message == "Loop has no body steps (empty loop)"));

        let flow = flow_of(vec![StepDefinition::new("l", config)]);
        let diags = validate_flow(&flow);
        assert!(diags
            .iter()
            .any(|d| d.is_error() && d.message == "Loop has no transitions"));
    }

    #[test]
    fn test_well_formed_loop_flow_is_clean() {
        let flow = parse_flow(
            r#"
name: t
steps:
  - setup
  - each:
      loop: true
      iterate: setup.items
      children:
        - work
  - finish:
      terminate: true
"#,
        )
        .unwrap();
        assert!(validate_flow(&flow).is_empty());
    }
}
