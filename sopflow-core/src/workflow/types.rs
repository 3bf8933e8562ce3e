//! Workflow type definitions for the sopflow engine.
//!
//! Defines the compiled transition graph (flows, steps, transitions), the
//! durable runtime state, history rows, and the result type returned by
//! every executor operation.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A directed, optionally guarded edge between two steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub target: String,
    /// `None` marks the default transition, tried after every guarded one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Transition {
    /// An unconditional (default) transition.
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: None,
        }
    }

    /// A transition guarded by `condition`.
    pub fn when(target: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            condition: Some(condition.into()),
        }
    }

    pub fn is_default(&self) -> bool {
        self.condition.is_none()
    }
}

/// The structural kind a step was compiled as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    #[default]
    Task,
    Wait,
    Branch,
    Loop,
    Jump,
    Assert,
    Terminate,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Task => write!(f, "task"),
            StepKind::Wait => write!(f, "wait"),
            StepKind::Branch => write!(f, "branch"),
            StepKind::Loop => write!(f, "loop"),
            StepKind::Jump => write!(f, "jump"),
            StepKind::Assert => write!(f, "assert"),
            StepKind::Terminate => write!(f, "terminate"),
        }
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "task" => Ok(StepKind::Task),
            "wait" => Ok(StepKind::Wait),
            "branch" => Ok(StepKind::Branch),
            "loop" => Ok(StepKind::Loop),
            "jump" => Ok(StepKind::Jump),
            "assert" => Ok(StepKind::Assert),
            "terminate" => Ok(StepKind::Terminate),
            other => Err(format!("unknown step type '{other}'")),
        }
    }
}

/// Engine-facing configuration of a step.
///
/// The flags are what the executor acts on; `extra` carries every key the
/// compiler did not consume so capability hooks can read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub kind: StepKind,
    /// Arrival pauses the workflow until approve/reject.
    #[serde(default)]
    pub wait: bool,
    /// Arrival ends the workflow.
    #[serde(default)]
    pub terminate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Marks a loop header; the expression must resolve to a list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterate: Option<String>,
    /// The step resolves its own transitions on arrival.
    #[serde(default)]
    pub auto: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl StepConfig {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn is_loop_header(&self) -> bool {
        self.iterate.is_some()
    }
}

/// A named node in the flattened workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    #[serde(default)]
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, config: StepConfig) -> Self {
        Self {
            name: name.into(),
            transitions: Vec::new(),
            config,
        }
    }

    pub fn with_transitions(mut self, transitions: Vec<Transition>) -> Self {
        self.transitions = transitions;
        self
    }
}

/// A compiled workflow: a flat name → step map plus its entry point.
///
/// Steps keep their declaration order, so the entry is always the first
/// step of the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: IndexMap<String, StepDefinition>,
    pub entry: String,
}

impl FlowDefinition {
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }
}

/// Status of the live workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Waiting,
    Stopped,
    Done,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Waiting => write!(f, "waiting"),
            WorkflowStatus::Stopped => write!(f, "stopped"),
            WorkflowStatus::Done => write!(f, "done"),
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowStatus::Running),
            "waiting" => Ok(WorkflowStatus::Waiting),
            "stopped" => Ok(WorkflowStatus::Stopped),
            "done" => Ok(WorkflowStatus::Done),
            other => Err(format!("unknown workflow status '{other}'")),
        }
    }
}

/// Iteration counters for one active loop header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopCounter {
    pub index: usize,
    pub count: usize,
}

/// Durable runtime state of the single live workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub flow_name: String,
    pub current_step: String,
    pub status: WorkflowStatus,
    /// Last payload submitted for each step name. Submissions overwrite.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Active loops keyed by header name, outermost first.
    #[serde(default)]
    pub loop_state: IndexMap<String, LoopCounter>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Create a fresh state positioned at `entry`.
    pub fn new(
        flow_name: impl Into<String>,
        entry: impl Into<String>,
        initial_data: Map<String, Value>,
    ) -> Self {
        Self {
            flow_name: flow_name.into(),
            current_step: entry.into(),
            status: WorkflowStatus::Running,
            data: initial_data,
            loop_state: IndexMap::new(),
            started_at: Utc::now(),
        }
    }
}

/// The kind of operation recorded in a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Start,
    Submit,
    Transition,
    Terminate,
    Skip,
    Retry,
    Approve,
    Reject,
    Goto,
    Back,
    Stop,
    Resume,
    Restore,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HistoryAction::Start => "start",
            HistoryAction::Submit => "submit",
            HistoryAction::Transition => "transition",
            HistoryAction::Terminate => "terminate",
            HistoryAction::Skip => "skip",
            HistoryAction::Retry => "retry",
            HistoryAction::Approve => "approve",
            HistoryAction::Reject => "reject",
            HistoryAction::Goto => "goto",
            HistoryAction::Back => "back",
            HistoryAction::Stop => "stop",
            HistoryAction::Resume => "resume",
            HistoryAction::Restore => "restore",
        };
        f.write_str(name)
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(HistoryAction::Start),
            "submit" => Ok(HistoryAction::Submit),
            "transition" => Ok(HistoryAction::Transition),
            "terminate" => Ok(HistoryAction::Terminate),
            "skip" => Ok(HistoryAction::Skip),
            "retry" => Ok(HistoryAction::Retry),
            "approve" => Ok(HistoryAction::Approve),
            "reject" => Ok(HistoryAction::Reject),
            "goto" => Ok(HistoryAction::Goto),
            "back" => Ok(HistoryAction::Back),
            "stop" => Ok(HistoryAction::Stop),
            "resume" => Ok(HistoryAction::Resume),
            "restore" => Ok(HistoryAction::Restore),
            other => Err(format!("unknown history action '{other}'")),
        }
    }
}

/// One append-only row of the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub flow_name: String,
    pub step_path: String,
    pub action: HistoryAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Metadata of a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub name: String,
    pub flow_name: String,
    pub created_at: DateTime<Utc>,
}

/// A transition whose guard needs an external decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub target: String,
    pub condition: String,
}

/// Outcome of a mutating executor operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpResult {
    pub succeeded: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_step: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_decisions: Vec<PendingDecision>,
}

impl OpResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            message: message.into(),
            new_step: None,
            pending_decisions: Vec::new(),
        }
    }

    pub fn ok_at(message: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            new_step: Some(step.into()),
            ..Self::ok(message)
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            message: message.into(),
            new_step: None,
            pending_decisions: Vec::new(),
        }
    }

    pub fn with_pending(mut self, pending: Vec<PendingDecision>) -> Self {
        self.pending_decisions = pending;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_status_display_and_parse() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Waiting,
            WorkflowStatus::Stopped,
            WorkflowStatus::Done,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<WorkflowStatus>().unwrap(), status);
        }
        assert!("paused".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_history_action_display_matches_serde() {
        let action = HistoryAction::Terminate;
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(json, format!("\"{}\"", action));
        assert_eq!("restore".parse::<HistoryAction>().unwrap(), HistoryAction::Restore);
    }

    #[test]
    fn test_step_kind_parse_rejects_unknown() {
        assert_eq!("loop".parse::<StepKind>().unwrap(), StepKind::Loop);
        assert!("parallel".parse::<StepKind>().is_err());
    }

    #[test]
    fn test_workflow_state_new_is_running_without_loops() {
        let state = WorkflowState::new("demo", "first", Map::new());
        assert_eq!(state.status, WorkflowStatus::Running);
        assert_eq!(state.current_step, "first");
        assert!(state.loop_state.is_empty());
        assert!(state.data.is_empty());
    }

    #[test]
    fn test_workflow_state_json_keeps_loop_order() {
        let mut state = WorkflowState::new("demo", "inner_body", Map::new());
        state
            .loop_state
            .insert("outer".into(), LoopCounter { index: 1, count: 3 });
        state
            .loop_state
            .insert("inner".into(), LoopCounter { index: 0, count: 2 });
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        let keys: Vec<_> = back.loop_state.keys().cloned().collect();
        assert_eq!(keys, vec!["outer".to_string(), "inner".to_string()]);
    }

    #[test]
    fn test_op_result_constructors() {
        let ok = OpResult::ok_at("Advanced to: b", "b");
        assert!(ok.succeeded);
        assert_eq!(ok.new_step.as_deref(), Some("b"));

        let fail = OpResult::fail("nope");
        assert!(!fail.succeeded);
        assert!(fail.new_step.is_none());
        assert!(fail.pending_decisions.is_empty());
    }

    #[test]
    fn test_op_result_serializes_without_empty_fields() {
        let json = serde_json::to_value(OpResult::ok("done")).unwrap();
        assert_eq!(json, serde_json::json!({"succeeded": true, "message": "done"}));
    }
}
