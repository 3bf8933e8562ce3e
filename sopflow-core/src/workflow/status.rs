//! Read-only status report for callers driving a run.

use crate::workflow::expression::{ConditionKind, render_template};
use crate::workflow::registry::{CapabilityHook, EditPolicy, HookKind};
use crate::workflow::types::{
    FlowDefinition, HistoryEntry, PendingDecision, Transition, WorkflowState, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

const DECISION_HINT: &str = "This step has conditions that need an external decision. \
     Evaluate them, then submit with {\"_goto\": \"<step>\"} to choose a path.";

/// Hook details surfaced for the current step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookInfo {
    pub name: String,
    pub kinds: Vec<HookKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edit_policy: Option<EditPolicy>,
}

/// Snapshot of the live run, as returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub flow_name: String,
    pub current_step: String,
    /// Active loops outermost first, then the step: `each[2/3] > edit`.
    pub display_path: String,
    pub total_steps: usize,
    pub status: WorkflowStatus,
    pub elapsed: String,
    pub last_action: Option<HistoryEntry>,
    pub allowed_actions: Vec<&'static str>,
    pub data: Map<String, Value>,
    pub summary: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_decisions: Vec<PendingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<HookInfo>,
}

impl StatusReport {
    pub(crate) fn build(
        flow: &FlowDefinition,
        state: &WorkflowState,
        last_action: Option<HistoryEntry>,
        hook: Option<&CapabilityHook>,
        now: DateTime<Utc>,
    ) -> Self {
        let display_path = display_path(state);
        let elapsed = format_elapsed(state.started_at, now);

        let mut summary = vec![format!("{} > {}", flow.name, display_path)];
        if state.status == WorkflowStatus::Waiting {
            summary.push("waiting for approval".to_string());
        }
        summary.push(format!("elapsed {elapsed}"));
        if let Some(last) = &last_action {
            summary.push(format!("last: {}", last.action));
        }

        let pending_decisions = flow
            .step(&state.current_step)
            .map(|step| deferred_decisions(&step.transitions))
            .unwrap_or_default();
        let decision_hint = (!pending_decisions.is_empty()).then(|| DECISION_HINT.to_string());

        let hook = hook.map(|hook| HookInfo {
            name: hook.name.clone(),
            kinds: hook.sorted_kinds(),
            instructions: (!hook.instructions.is_empty())
                .then(|| render_template(&hook.instructions, &state.data)),
            edit_policy: hook.edit_policy.clone(),
        });

        Self {
            flow_name: flow.name.clone(),
            current_step: state.current_step.clone(),
            display_path,
            total_steps: flow.steps.len(),
            status: state.status,
            elapsed,
            last_action,
            allowed_actions: allowed_actions(state.status),
            data: state.data.clone(),
            summary: summary.join(", "),
            pending_decisions,
            decision_hint,
            hook,
        }
    }
}

/// Operations whose status guard passes in `status`.
pub fn allowed_actions(status: WorkflowStatus) -> Vec<&'static str> {
    let mut actions = match status {
        WorkflowStatus::Running => vec!["submit", "skip", "stop"],
        WorkflowStatus::Waiting => vec!["approve", "reject", "skip", "stop"],
        WorkflowStatus::Stopped => vec!["resume"],
        WorkflowStatus::Done => vec![],
    };
    actions.extend(["back", "goto", "retry"]);
    actions
}

pub fn display_path(state: &WorkflowState) -> String {
    let mut parts: Vec<String> = state
        .loop_state
        .iter()
        .map(|(name, counter)| format!("{}[{}/{}]", name, counter.index + 1, counter.count))
        .collect();
    parts.push(state.current_step.clone());
    parts.join(" > ")
}

/// Guarded transitions the evaluator cannot decide on its own.
pub fn deferred_decisions(transitions: &[Transition]) -> Vec<PendingDecision> {
    transitions
        .iter()
        .filter_map(|t| {
            let condition = t.condition.as_ref()?;
            (ConditionKind::classify(condition) == ConditionKind::Deferred).then(|| {
                PendingDecision {
                    target: t.target.clone(),
                    condition: condition.clone(),
                }
            })
        })
        .collect()
}

fn format_elapsed(started_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - started_at).num_seconds().max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("{hours}h{minutes:02}m")
    } else {
        format!("{minutes}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parser::parse_flow;
    use crate::workflow::registry::PolicyTag;
    use crate::workflow::types::LoopCounter;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_format_elapsed() {
        let start = Utc::now();
        assert_eq!(format_elapsed(start, start + Duration::seconds(59)), "0m");
        assert_eq!(format_elapsed(start, start + Duration::minutes(42)), "42m");
        assert_eq!(
            format_elapsed(start, start + Duration::minutes(125)),
            "2h05m"
        );
        assert_eq!(format_elapsed(start, start - Duration::minutes(5)), "0m");
    }

    #[test]
    fn test_display_path_nested_loops() {
        let mut state = WorkflowState::new("demo", "edit", Map::new());
        state
            .loop_state
            .insert("modules".into(), LoopCounter { index: 0, count: 2 });
        state
            .loop_state
            .insert("files".into(), LoopCounter { index: 2, count: 3 });
        assert_eq!(display_path(&state), "modules[1/2] > files[3/3] > edit");
    }

    #[test]
    fn test_allowed_actions_follow_status() {
        assert!(allowed_actions(WorkflowStatus::Running).contains(&"submit"));
        assert!(!allowed_actions(WorkflowStatus::Running).contains(&"approve"));
        assert!(allowed_actions(WorkflowStatus::Waiting).contains(&"approve"));
        assert_eq!(
            allowed_actions(WorkflowStatus::Stopped),
            vec!["resume", "back", "goto", "retry"]
        );
        assert_eq!(allowed_actions(WorkflowStatus::Done), vec!["back", "goto", "retry"]);
    }

    #[test]
    fn test_build_report_with_hook_and_pending() {
        let flow = parse_flow(
            r#"
name: review flow
steps:
  - review:
      next:
        - if: the change is risky
          go: deep_review
        - if: review.ok == true
          go: merge
  - deep_review
  - merge
"#,
        )
        .unwrap();
        let mut data = Map::new();
        data.insert("ticket".into(), json!({"id": 7}));
        let state = WorkflowState::new("review flow", "review", data);
        let hook = CapabilityHook::new("review")
            .with_kinds([HookKind::Validate, HookKind::Auto])
            .with_instructions("Review ticket #{{ ticket.id }}")
            .with_edit_policy(EditPolicy::new(PolicyTag::Block));

        let report =
            StatusReport::build(&flow, &state, None, Some(&hook), state.started_at);
        assert_eq!(report.display_path, "review");
        assert_eq!(report.total_steps, 3);
        assert_eq!(report.summary, "review flow > review, elapsed 0m");
        assert_eq!(
            report.pending_decisions,
            vec![PendingDecision {
                target: "deep_review".into(),
                condition: "the change is risky".into(),
            }]
        );
        assert!(report.decision_hint.is_some());

        let hook = report.hook.unwrap();
        assert_eq!(hook.kinds, vec![HookKind::Auto, HookKind::Validate]);
        assert_eq!(hook.instructions.as_deref(), Some("Review ticket #7"));
        assert_eq!(hook.edit_policy.unwrap().default, PolicyTag::Block);
    }
}
