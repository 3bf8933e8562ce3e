//! Workflow executor: drives the live run through a compiled flow.
//!
//! Every mutating operation reads the live state from the store, applies its
//! status guard, and writes the result back before returning. Expected
//! refusals (wrong status, rejected output, no matching transition) come
//! back as failed [`OpResult`]s; only storage faults and compile errors are
//! `Err`.

use crate::config::ExecutorConfig;
use crate::error::WorkflowError;
use crate::workflow::expression::{ConditionKind, evaluate, evaluate_condition};
use crate::workflow::parser::parse_flow;
use crate::workflow::registry::{CapabilityRegistry, HookKind};
use crate::workflow::status::{StatusReport, deferred_decisions};
use crate::workflow::store::StateStore;
use crate::workflow::types::{
    CheckpointInfo, FlowDefinition, HistoryAction, HistoryEntry, LoopCounter, OpResult,
    StepDefinition, WorkflowState, WorkflowStatus,
};
use crate::workflow::validator::{Diagnostic, has_errors, validate_flow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

/// Payload key naming an explicit next step.
pub const GOTO_KEY: &str = "_goto";

/// A mutating operation, for callers that dispatch from serialized input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Start {
        definition: String,
        #[serde(default)]
        initial_data: Map<String, Value>,
    },
    Submit {
        #[serde(default)]
        payload: Map<String, Value>,
    },
    Approve {
        #[serde(default)]
        payload: Map<String, Value>,
    },
    Reject {
        #[serde(default)]
        reason: Option<String>,
    },
    Skip {
        #[serde(default)]
        reason: Option<String>,
    },
    Retry,
    Goto {
        target: String,
    },
    Back,
    Stop,
    Resume,
    SaveCheckpoint {
        name: String,
    },
    RestoreCheckpoint {
        name: String,
    },
    Reset,
}

/// Owns the compiled flow, the store and the hook registry for a session.
pub struct WorkflowExecutor {
    store: StateStore,
    registry: CapabilityRegistry,
    config: ExecutorConfig,
    flow: Option<FlowDefinition>,
}

impl WorkflowExecutor {
    pub fn new(store: StateStore, registry: CapabilityRegistry, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            flow: None,
        }
    }

    pub fn flow(&self) -> Option<&FlowDefinition> {
        self.flow.as_ref()
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CapabilityRegistry {
        &mut self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Compile and validate `definition`, binding it for this session.
    ///
    /// Error-level diagnostics reject the flow; warnings are logged and
    /// returned.
    pub fn load(&mut self, definition: &str) -> Result<Vec<Diagnostic>, WorkflowError> {
        let flow = parse_flow(definition)?;
        let diagnostics = validate_flow(&flow);
        if has_errors(&diagnostics) {
            let errors: Vec<Diagnostic> =
                diagnostics.into_iter().filter(Diagnostic::is_error).collect();
            warn!(flow = %flow.name, errors = errors.len(), "Flow failed validation");
            return Err(WorkflowError::Validation { errors });
        }
        for diagnostic in &diagnostics {
            warn!(flow = %flow.name, %diagnostic, "Flow validation warning");
        }
        info!(flow = %flow.name, steps = flow.steps.len(), "Loaded flow");
        self.flow = Some(flow);
        Ok(diagnostics)
    }

    /// Load `definition` and begin a new run at its entry step.
    pub fn start(
        &mut self,
        definition: &str,
        initial_data: Map<String, Value>,
    ) -> Result<OpResult, WorkflowError> {
        if let Some(active) = self.store.current_state()? {
            if active.status != WorkflowStatus::Done {
                return Ok(refuse(
                    "start",
                    format!(
                        "Workflow \"{}\" is still active at \"{}\". Finish it or reset before starting another.",
                        active.flow_name, active.current_step
                    ),
                ));
            }
        }

        self.load(definition)?;
        let Some(flow) = self.flow.as_ref() else {
            return Ok(OpResult::fail("No flow loaded."));
        };

        let mut state = WorkflowState::new(&flow.name, &flow.entry, initial_data);
        self.store.save_state(&state)?;
        self.store
            .append_history(&flow.name, &flow.entry, HistoryAction::Start, None)?;
        info!(flow = %flow.name, entry = %flow.entry, "Started workflow");

        let entry = flow.entry.clone();
        let mut result = self.arrive(flow, &mut state, &entry, 0, false)?;
        result.message = format!("Flow \"{}\" started: {}", flow.name, result.message);
        Ok(result)
    }

    /// Record output for the current step and move on.
    pub fn submit(&mut self, payload: Map<String, Value>) -> Result<OpResult, WorkflowError> {
        let Some(state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        match state.status {
            WorkflowStatus::Done => {
                return Ok(refuse(
                    "submit",
                    "Workflow is already completed. Use goto to jump to a step if you need to revisit.",
                ));
            }
            WorkflowStatus::Stopped => {
                return Ok(refuse(
                    "submit",
                    "Workflow is stopped. Use resume before submitting.",
                ));
            }
            WorkflowStatus::Waiting => {
                return Ok(refuse(
                    "submit",
                    format!(
                        "Step \"{}\" is waiting for approval. Use approve to continue or reject to send it back.",
                        state.current_step
                    ),
                ));
            }
            WorkflowStatus::Running => {}
        }
        self.record_output(state, payload, false)
    }

    /// Approve a waiting step, then submit `payload` for it.
    ///
    /// The gate only opens once the output passes every check `submit`
    /// applies; a refused approval leaves the step waiting.
    pub fn approve(&mut self, payload: Map<String, Value>) -> Result<OpResult, WorkflowError> {
        let Some(state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        if state.status != WorkflowStatus::Waiting {
            return Ok(not_waiting(&state));
        }
        self.record_output(state, payload, true)
    }

    /// Reject a waiting step. The run stays where it is.
    pub fn reject(&mut self, reason: Option<&str>) -> Result<OpResult, WorkflowError> {
        let Some(state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        if state.status != WorkflowStatus::Waiting {
            return Ok(not_waiting(&state));
        }
        self.store.append_history(
            &state.flow_name,
            &state.current_step,
            HistoryAction::Reject,
            reason,
        )?;
        info!(step = %state.current_step, reason = ?reason, "Rejected waiting step");
        Ok(OpResult::ok_at(
            format!("Rejected: {}", reason.unwrap_or("no reason given")),
            state.current_step,
        ))
    }

    /// Leave the current step without output and resolve its transitions.
    pub fn skip(&mut self, reason: Option<&str>) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        match state.status {
            WorkflowStatus::Done => {
                return Ok(refuse(
                    "skip",
                    "Workflow is already completed. Use goto to jump to a step if you need to revisit.",
                ));
            }
            WorkflowStatus::Stopped => {
                return Ok(refuse("skip", "Workflow is stopped. Use resume first."));
            }
            WorkflowStatus::Running | WorkflowStatus::Waiting => {}
        }

        let flow = match self.bound_flow(&state) {
            Ok(flow) => flow,
            Err(refused) => return Ok(refused),
        };
        let Some(step) = flow.step(&state.current_step) else {
            return Ok(refuse(
                "skip",
                format!("Current step \"{}\" not found in flow.", state.current_step),
            ));
        };

        self.store.append_history(
            &state.flow_name,
            &step.name,
            HistoryAction::Skip,
            reason,
        )?;
        state.status = WorkflowStatus::Running;
        self.store.save_state(&state)?;
        debug!(step = %step.name, reason = ?reason, "Skipping step");
        self.follow_transitions(flow, &mut state, step, 0)
    }

    /// Stay on the current step and mark the run running again.
    pub fn retry(&mut self) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        state.status = WorkflowStatus::Running;
        self.store.save_state(&state)?;
        self.store.append_history(
            &state.flow_name,
            &state.current_step,
            HistoryAction::Retry,
            None,
        )?;
        Ok(OpResult::ok_at(
            format!(
                "Retrying step \"{}\". Please attempt it again.",
                state.current_step
            ),
            state.current_step,
        ))
    }

    /// Jump to any step. No output is recorded and no hook runs.
    pub fn goto(&mut self, target: &str) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        let flow = match self.bound_flow(&state) {
            Ok(flow) => flow,
            Err(refused) => return Ok(refused),
        };
        if !flow.contains(target) {
            return Ok(refuse(
                "goto",
                format!(
                    "Step \"{}\" not found. Available steps: {}",
                    target,
                    flow.step_names().join(", ")
                ),
            ));
        }

        state.current_step = target.to_string();
        state.status = WorkflowStatus::Running;
        self.store.save_state(&state)?;
        self.store
            .append_history(&state.flow_name, target, HistoryAction::Goto, None)?;
        info!(target = %target, "Jumped to step");
        Ok(OpResult::ok_at(format!("Jumped to: {target}"), target))
    }

    /// Return to the most recent step in history that differs from the current one.
    pub fn back(&mut self) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        let history = self.store.history(self.config.back_scan_limit)?;
        let previous = history.into_iter().find(|entry| {
            entry.step_path != state.current_step
                && self
                    .flow
                    .as_ref()
                    .is_none_or(|flow| flow.contains(&entry.step_path))
        });

        let Some(previous) = previous else {
            return Ok(refuse(
                "back",
                "Cannot go back: no previous step in history.",
            ));
        };

        state.current_step = previous.step_path;
        state.status = WorkflowStatus::Running;
        self.store.save_state(&state)?;
        self.store.append_history(
            &state.flow_name,
            &state.current_step,
            HistoryAction::Back,
            None,
        )?;
        info!(target = %state.current_step, "Moved back");
        Ok(OpResult::ok_at(
            format!("Moved back to: {}", state.current_step),
            state.current_step,
        ))
    }

    pub fn stop(&mut self) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        match state.status {
            WorkflowStatus::Done => return Ok(refuse("stop", "Workflow already completed.")),
            WorkflowStatus::Stopped => return Ok(refuse("stop", "Workflow already stopped.")),
            WorkflowStatus::Running | WorkflowStatus::Waiting => {}
        }
        state.status = WorkflowStatus::Stopped;
        self.store.save_state(&state)?;
        self.store.append_history(
            &state.flow_name,
            &state.current_step,
            HistoryAction::Stop,
            None,
        )?;
        info!(step = %state.current_step, "Stopped workflow");
        Ok(OpResult::ok_at(
            format!("Workflow stopped at: {}", state.current_step),
            state.current_step,
        ))
    }

    pub fn resume(&mut self) -> Result<OpResult, WorkflowError> {
        let Some(mut state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        if state.status != WorkflowStatus::Stopped {
            return Ok(refuse(
                "resume",
                format!("Cannot resume: status is {}.", state.status),
            ));
        }
        let flow = match self.bound_flow(&state) {
            Ok(flow) => flow,
            Err(refused) => return Ok(refused),
        };
        let waits = flow
            .step(&state.current_step)
            .is_some_and(|step| step.config.wait);
        state.status = if waits {
            WorkflowStatus::Waiting
        } else {
            WorkflowStatus::Running
        };
        self.store.save_state(&state)?;
        self.store.append_history(
            &state.flow_name,
            &state.current_step,
            HistoryAction::Resume,
            None,
        )?;
        info!(step = %state.current_step, status = %state.status, "Resumed workflow");
        Ok(OpResult::ok_at(
            format!("Resumed at: {}", state.current_step),
            state.current_step,
        ))
    }

    /// Status of the live run, or `None` when nothing is active.
    pub fn get_status(&self) -> Result<Option<StatusReport>, WorkflowError> {
        let Some(state) = self.store.current_state()? else {
            return Ok(None);
        };
        let flow = self
            .flow
            .as_ref()
            .filter(|flow| flow.name == state.flow_name)
            .ok_or_else(|| WorkflowError::FlowNotLoaded {
                flow_name: state.flow_name.clone(),
            })?;
        let last_action = self.store.history(1)?.into_iter().next();
        let hook = flow
            .contains(&state.current_step)
            .then(|| self.registry.get(&state.current_step))
            .flatten();
        Ok(Some(StatusReport::build(
            flow,
            &state,
            last_action,
            hook.as_deref(),
            Utc::now(),
        )))
    }

    /// Newest-first history. `None` uses the configured default limit.
    pub fn get_history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, WorkflowError> {
        let limit = limit.unwrap_or(self.config.default_history_limit);
        Ok(self.store.history(limit)?)
    }

    /// Accumulated step outputs; empty when nothing is active.
    pub fn get_data(&self) -> Result<Map<String, Value>, WorkflowError> {
        Ok(self
            .store
            .current_state()?
            .map(|state| state.data)
            .unwrap_or_default())
    }

    pub fn save_checkpoint(&mut self, name: &str) -> Result<OpResult, WorkflowError> {
        let Some(state) = self.store.current_state()? else {
            return Ok(no_active_workflow());
        };
        self.store.save_checkpoint(name, &state)?;
        info!(checkpoint = %name, step = %state.current_step, "Saved checkpoint");
        Ok(OpResult::ok_at(
            format!("Checkpoint saved: {name}"),
            state.current_step,
        ))
    }

    /// Read a checkpoint without touching the live run.
    pub fn load_checkpoint(&self, name: &str) -> Result<Option<WorkflowState>, WorkflowError> {
        Ok(self.store.load_checkpoint(name)?)
    }

    /// Make a checkpoint the live run.
    pub fn restore_checkpoint(&mut self, name: &str) -> Result<OpResult, WorkflowError> {
        let Some(snapshot) = self.store.load_checkpoint(name)? else {
            return Ok(refuse(
                "restore_checkpoint",
                format!("Checkpoint \"{name}\" not found."),
            ));
        };
        self.store.save_state(&snapshot)?;
        self.store.append_history(
            &snapshot.flow_name,
            &snapshot.current_step,
            HistoryAction::Restore,
            Some(name),
        )?;
        info!(checkpoint = %name, step = %snapshot.current_step, "Restored checkpoint");
        Ok(OpResult::ok_at(
            format!("Restored checkpoint \"{name}\" at: {}", snapshot.current_step),
            snapshot.current_step,
        ))
    }

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>, WorkflowError> {
        Ok(self.store.list_checkpoints()?)
    }

    /// Clear the live run and its history. Checkpoints are kept.
    pub fn reset(&mut self) -> Result<OpResult, WorkflowError> {
        self.store.reset()?;
        Ok(OpResult::ok("Workflow state reset."))
    }

    /// Run `command`, turning any error into a failed result.
    pub fn execute(&mut self, command: Command) -> OpResult {
        let result = match command {
            Command::Start {
                definition,
                initial_data,
            } => self.start(&definition, initial_data),
            Command::Submit { payload } => self.submit(payload),
            Command::Approve { payload } => self.approve(payload),
            Command::Reject { reason } => self.reject(reason.as_deref()),
            Command::Skip { reason } => self.skip(reason.as_deref()),
            Command::Retry => self.retry(),
            Command::Goto { target } => self.goto(&target),
            Command::Back => self.back(),
            Command::Stop => self.stop(),
            Command::Resume => self.resume(),
            Command::SaveCheckpoint { name } => self.save_checkpoint(&name),
            Command::RestoreCheckpoint { name } => self.restore_checkpoint(&name),
            Command::Reset => self.reset(),
        };
        match result {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Workflow operation failed");
                OpResult::fail(e.to_string())
            }
        }
    }

    // --- Private ---

    /// Shared tail of `submit` and `approve`. Every refusal happens before
    /// anything is written, so a refused approval keeps the step waiting.
    fn record_output(
        &self,
        mut state: WorkflowState,
        mut payload: Map<String, Value>,
        approving: bool,
    ) -> Result<OpResult, WorkflowError> {
        let op = if approving { "approve" } else { "submit" };
        let flow = match self.bound_flow(&state) {
            Ok(flow) => flow,
            Err(refused) => return Ok(refused),
        };
        let Some(step) = flow.step(&state.current_step) else {
            return Ok(refuse(
                op,
                format!(
                    "Step \"{}\" not found in flow definition. The definition may have changed. Use goto to jump to a valid step.",
                    state.current_step
                ),
            ));
        };

        // A null or empty `_goto` means "no explicit choice".
        let goto_target = match payload.remove(GOTO_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(s.trim().to_string()),
            Some(other) => Some(other.to_string()),
        };
        if let Some(target) = &goto_target {
            if !flow.contains(target) {
                return Ok(refuse(
                    op,
                    format!(
                        "{GOTO_KEY} target \"{}\" not found. Available steps: {}",
                        target,
                        flow.step_names().join(", ")
                    ),
                ));
            }
        }

        if let Some(hook) = self.registry.get(&step.name) {
            if hook.has_kind(HookKind::Validate) && hook.check.is_some() {
                if let Err(reason) = hook.run_check(&Value::Object(payload.clone())) {
                    return Ok(refuse(
                        op,
                        format!(
                            "Output rejected by step \"{}\": {}. Please fix the issues and resubmit.",
                            step.name, reason
                        ),
                    ));
                }
            }
            if hook.has_kind(HookKind::Archive) {
                if let Some(table) = &hook.archive_table {
                    let schema = hook.output_schema.as_ref();
                    let archived = self
                        .store
                        .ensure_archive_table(table, schema)
                        .and_then(|()| self.store.insert_archive_row(table, schema, &payload));
                    if let Err(e) = archived {
                        error!(step = %step.name, table = %table, error = %e, "Archive write failed");
                        return Ok(OpResult::fail(format!("Failed to archive output: {e}")));
                    }
                }
            }
        }

        if approving {
            self.store.append_history(
                &state.flow_name,
                &step.name,
                HistoryAction::Approve,
                None,
            )?;
            info!(step = %step.name, "Approved waiting step");
        }

        let recorded = serde_json::to_string(&payload).map_err(crate::error::StoreError::from)?;
        state.status = WorkflowStatus::Running;
        state
            .data
            .insert(step.name.clone(), Value::Object(payload));
        self.store.save_state(&state)?;
        self.store.append_history(
            &state.flow_name,
            &step.name,
            HistoryAction::Submit,
            Some(&recorded),
        )?;
        debug!(step = %step.name, goto = ?goto_target, "Recorded step output");

        match goto_target {
            Some(target) => self.arrive(flow, &mut state, &target, 0, true),
            None => self.follow_transitions(flow, &mut state, step, 0),
        }
    }

    /// The loaded flow, if it is the one the live run belongs to.
    fn bound_flow(&self, state: &WorkflowState) -> Result<&FlowDefinition, OpResult> {
        match &self.flow {
            Some(flow) if flow.name == state.flow_name => Ok(flow),
            Some(flow) => Err(OpResult::fail(format!(
                "Loaded flow \"{}\" does not match the active workflow \"{}\". Load the matching definition first.",
                flow.name, state.flow_name
            ))),
            None => Err(OpResult::fail(format!(
                "No flow loaded for workflow \"{}\". Load its definition first.",
                state.flow_name
            ))),
        }
    }

    /// Data plus the current index of every active loop.
    fn context(state: &WorkflowState) -> Map<String, Value> {
        let mut ctx = state.data.clone();
        for (name, counter) in &state.loop_state {
            ctx.insert(name.clone(), Value::from(counter.index));
        }
        ctx
    }

    fn should_auto_advance(step: &StepDefinition) -> bool {
        step.config.auto
            && !step.config.wait
            && step.transitions.iter().all(|t| {
                t.condition
                    .as_deref()
                    .is_none_or(|c| ConditionKind::classify(c) != ConditionKind::Deferred)
            })
    }

    fn capability_holds(&self, condition: &str, state: &WorkflowState) -> bool {
        let name = condition.trim().trim_start_matches('@');
        match self.registry.get(name) {
            Some(hook) if hook.check.is_some() => {
                hook.run_check(&Value::Object(state.data.clone())).is_ok()
            }
            _ => false,
        }
    }

    /// Pick the next step from `step`'s transitions.
    fn follow_transitions(
        &self,
        flow: &FlowDefinition,
        state: &mut WorkflowState,
        step: &StepDefinition,
        depth: usize,
    ) -> Result<OpResult, WorkflowError> {
        if step.config.is_loop_header() {
            return self.handle_loop(flow, state, step, depth);
        }

        let ctx = Self::context(state);
        for transition in &step.transitions {
            let Some(condition) = transition.condition.as_deref() else {
                continue;
            };
            let fired = match ConditionKind::classify(condition) {
                ConditionKind::Expression => evaluate_condition(condition, &ctx),
                ConditionKind::Capability => self.capability_holds(condition, state),
                ConditionKind::Deferred => false,
            };
            debug!(step = %step.name, condition = %condition, fired, "Evaluated transition guard");
            if fired {
                return self.arrive(flow, state, &transition.target, depth, true);
            }
        }

        let pending = deferred_decisions(&step.transitions);
        if !pending.is_empty() {
            let options = pending
                .iter()
                .map(|d| format!("\"{}\"", d.target))
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(OpResult::ok_at(
                format!(
                    "Step \"{}\" has conditions that need an external decision. Evaluate them and submit with {{\"{GOTO_KEY}\": <one of {options}>}} to choose a path.",
                    step.name
                ),
                &step.name,
            )
            .with_pending(pending));
        }

        if let Some(default) = step.transitions.iter().find(|t| t.is_default()) {
            return self.arrive(flow, state, &default.target, depth, true);
        }

        if step.transitions.is_empty() {
            state.status = WorkflowStatus::Done;
            self.store.save_state(state)?;
            info!(step = %step.name, "Workflow completed");
            return Ok(OpResult::ok(
                "Workflow completed: no more transitions from this step.",
            ));
        }

        Ok(refuse(
            "submit",
            format!(
                "No matching transition from step \"{}\". None of the conditions were met and there is no default path.",
                step.name
            ),
        ))
    }

    /// Enter `target`, applying loop, terminate, wait and auto semantics.
    fn arrive(
        &self,
        flow: &FlowDefinition,
        state: &mut WorkflowState,
        target: &str,
        depth: usize,
        record: bool,
    ) -> Result<OpResult, WorkflowError> {
        if depth > self.config.max_auto_steps {
            warn!(step = %state.current_step, limit = self.config.max_auto_steps, "Auto-advance limit reached");
            return Ok(OpResult::fail(format!(
                "Auto-advance stopped at \"{}\" after {} steps. Check the flow for a cycle of automatic steps.",
                state.current_step, self.config.max_auto_steps
            )));
        }

        let Some(step) = flow.step(target) else {
            return Ok(OpResult::fail(format!(
                "Target step \"{target}\" not found in the flow. The definition may have changed."
            )));
        };

        if step.config.is_loop_header() {
            return self.handle_loop(flow, state, step, depth);
        }

        if step.config.terminate {
            let reason = step
                .config
                .reason
                .clone()
                .unwrap_or_else(|| "workflow completed".to_string());
            state.current_step = step.name.clone();
            state.status = WorkflowStatus::Done;
            self.store.save_state(state)?;
            self.store.append_history(
                &state.flow_name,
                &step.name,
                HistoryAction::Terminate,
                Some(&reason),
            )?;
            info!(step = %step.name, reason = %reason, "Workflow terminated");
            return Ok(OpResult::ok_at(
                format!("Workflow completed: {reason}"),
                &step.name,
            ));
        }

        state.current_step = step.name.clone();
        state.status = if step.config.wait {
            WorkflowStatus::Waiting
        } else {
            WorkflowStatus::Running
        };
        self.store.save_state(state)?;
        if record {
            self.store.append_history(
                &state.flow_name,
                &step.name,
                HistoryAction::Transition,
                None,
            )?;
        }
        debug!(step = %step.name, status = %state.status, "Arrived at step");

        if Self::should_auto_advance(step) {
            return self.follow_transitions(flow, state, step, depth + 1);
        }

        Ok(OpResult::ok_at(format!("Advanced to: {}", step.name), &step.name))
    }

    fn handle_loop(
        &self,
        flow: &FlowDefinition,
        state: &mut WorkflowState,
        header: &StepDefinition,
        depth: usize,
    ) -> Result<OpResult, WorkflowError> {
        let Some(body) = header.transitions.first() else {
            return self.leave_loop(flow, state, header, depth, "Loop has no body");
        };

        match state.loop_state.get(&header.name).copied() {
            None => {
                let iterate = header.config.iterate.as_deref().unwrap_or_default();
                let count = match evaluate(iterate, &Self::context(state)) {
                    Value::Array(items) => items.len(),
                    _ => 0,
                };
                if count == 0 {
                    debug!(loop_name = %header.name, "Loop skipped (empty)");
                    return self.leave_loop(flow, state, header, depth, "Loop skipped (empty)");
                }
                state
                    .loop_state
                    .insert(header.name.clone(), LoopCounter { index: 0, count });
                self.store.save_state(state)?;
                debug!(loop_name = %header.name, count, "Entered loop");
                self.arrive(flow, state, &body.target, depth + 1, true)
            }
            Some(counter) if counter.index + 1 < counter.count => {
                let index = counter.index + 1;
                state.loop_state.insert(
                    header.name.clone(),
                    LoopCounter {
                        index,
                        count: counter.count,
                    },
                );
                self.store.save_state(state)?;
                debug!(loop_name = %header.name, index, count = counter.count, "Next loop iteration");
                self.arrive(flow, state, &body.target, depth + 1, true)
            }
            Some(counter) => {
                state.loop_state.shift_remove(&header.name);
                self.store.save_state(state)?;
                debug!(loop_name = %header.name, count = counter.count, "Loop completed");
                self.leave_loop(flow, state, header, depth, "Loop completed")
            }
        }
    }

    /// Take the loop's exit transition, or end the run at the header.
    fn leave_loop(
        &self,
        flow: &FlowDefinition,
        state: &mut WorkflowState,
        header: &StepDefinition,
        depth: usize,
        label: &str,
    ) -> Result<OpResult, WorkflowError> {
        if let Some(exit) = header.transitions.get(1) {
            return self.arrive(flow, state, &exit.target, depth + 1, true);
        }
        state.current_step = header.name.clone();
        state.status = WorkflowStatus::Done;
        self.store.save_state(state)?;
        info!(loop_name = %header.name, "Workflow completed at loop exit");
        Ok(OpResult::ok(format!("{label}: {}", header.name)))
    }
}

fn no_active_workflow() -> OpResult {
    OpResult::fail("No active workflow. Start one first.")
}

fn not_waiting(state: &WorkflowState) -> OpResult {
    refuse(
        "approve",
        format!(
            "Step \"{}\" is not waiting for approval (status: {}).",
            state.current_step, state.status
        ),
    )
}

fn refuse(op: &'static str, message: impl Into<String>) -> OpResult {
    let message = message.into();
    warn!(op, message = %message, "Operation refused");
    OpResult::fail(message)
}
