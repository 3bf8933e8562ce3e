//! Workflow engine for sopflow.
//!
//! Compiles the YAML procedure DSL into a flat state machine, validates it,
//! and drives a single durable run through it against a SQLite store.

pub mod executor;
pub mod expression;
pub mod parser;
pub mod registry;
pub mod status;
pub mod store;
pub mod types;
pub mod validator;

pub use executor::{Command, GOTO_KEY, WorkflowExecutor};
pub use expression::{ConditionKind, evaluate, evaluate_condition, is_truthy, render_template};
pub use parser::parse_flow;
pub use registry::{
    CapabilityHook, CapabilityRegistry, CheckFn, EditPolicy, EditPolicyPattern, FieldType,
    HookKind, HookSource, PolicyTag, StaticHookSource,
};
pub use status::{HookInfo, StatusReport};
pub use store::StateStore;
pub use types::{
    CheckpointInfo, FlowDefinition, HistoryAction, HistoryEntry, LoopCounter, OpResult,
    PendingDecision, StepConfig, StepDefinition, StepKind, Transition, WorkflowState,
    WorkflowStatus,
};
pub use validator::{Diagnostic, DiagnosticLevel, has_errors, validate_flow};
