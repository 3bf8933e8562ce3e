//! Capability Registry: step-keyed hooks that extend the executor.
//!
//! A hook named after a step can validate or archive that step's output,
//! carry instructions and an edit policy for the caller, or act as an
//! `@name` condition in transition guards. The core never discovers hooks
//! on its own; a [`HookSource`] hands them over.

use crate::error::WorkflowError;
use globset::Glob;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Check function attached to a hook. `Err` carries the rejection reason.
pub type CheckFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// What a hook participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Auto,
    Validate,
    Archive,
    Eval,
}

/// Declared type of an output field, used to build archive tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "string")]
    String,
    #[serde(rename = "number")]
    Number,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "string[]")]
    StringList,
}

impl FieldType {
    /// SQLite column affinity for this field.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Number => "REAL",
            FieldType::Boolean => "INTEGER",
            FieldType::String | FieldType::StringList => "TEXT",
        }
    }
}

/// Verdict for a file edit attempted while a step is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTag {
    #[default]
    Silent,
    Warn,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPolicyPattern {
    pub glob: String,
    pub policy: PolicyTag,
}

/// Per-step edit policy: ordered glob overrides on top of a default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditPolicy {
    #[serde(default)]
    pub default: PolicyTag,
    #[serde(default)]
    pub patterns: Vec<EditPolicyPattern>,
}

impl EditPolicy {
    pub fn new(default: PolicyTag) -> Self {
        Self {
            default,
            patterns: Vec::new(),
        }
    }

    pub fn with_pattern(mut self, glob: impl Into<String>, policy: PolicyTag) -> Self {
        self.patterns.push(EditPolicyPattern {
            glob: glob.into(),
            policy,
        });
        self
    }

    /// The tag of the first pattern matching `path`, or the default.
    /// Patterns that fail to compile are skipped.
    pub fn decide(&self, path: &str) -> PolicyTag {
        for pattern in &self.patterns {
            match Glob::new(&pattern.glob) {
                Ok(glob) => {
                    if glob.compile_matcher().is_match(path) {
                        return pattern.policy;
                    }
                }
                Err(e) => {
                    warn!(glob = %pattern.glob, error = %e, "Skipping invalid edit policy glob");
                }
            }
        }
        self.default
    }
}

/// A capability hook keyed by step name.
#[derive(Clone)]
pub struct CapabilityHook {
    pub name: String,
    pub kinds: HashSet<HookKind>,
    pub instructions: String,
    pub output_schema: Option<BTreeMap<String, FieldType>>,
    pub check: Option<CheckFn>,
    pub edit_policy: Option<EditPolicy>,
    pub archive_table: Option<String>,
}

impl CapabilityHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kinds: HashSet::new(),
            instructions: String::new(),
            output_schema: None,
            check: None,
            edit_policy: None,
            archive_table: None,
        }
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = HookKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_output_schema<K: Into<String>>(
        mut self,
        fields: impl IntoIterator<Item = (K, FieldType)>,
    ) -> Self {
        self.output_schema = Some(fields.into_iter().map(|(k, t)| (k.into(), t)).collect());
        self
    }

    pub fn with_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.check = Some(Arc::new(check));
        self
    }

    pub fn with_edit_policy(mut self, policy: EditPolicy) -> Self {
        self.edit_policy = Some(policy);
        self
    }

    pub fn with_archive_table(mut self, table: impl Into<String>) -> Self {
        self.archive_table = Some(table.into());
        self
    }

    pub fn has_kind(&self, kind: HookKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Declared kinds in a stable order.
    pub fn sorted_kinds(&self) -> Vec<HookKind> {
        let mut kinds: Vec<_> = self.kinds.iter().copied().collect();
        kinds.sort();
        kinds
    }

    /// Run the check, if any. A hook without a check accepts everything.
    pub fn run_check(&self, payload: &Value) -> Result<(), String> {
        match &self.check {
            Some(check) => check(payload),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for CapabilityHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityHook")
            .field("name", &self.name)
            .field("kinds", &self.sorted_kinds())
            .field("instructions", &self.instructions)
            .field("output_schema", &self.output_schema)
            .field("check", &self.check.as_ref().map(|_| "<fn>"))
            .field("edit_policy", &self.edit_policy)
            .field("archive_table", &self.archive_table)
            .finish()
    }
}

/// Supplies hooks to the registry, e.g. from a plugin directory.
pub trait HookSource {
    fn load(&self) -> Vec<CapabilityHook>;
}

/// A fixed list of hooks, for tables compiled into the host and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHookSource {
    hooks: Vec<CapabilityHook>,
}

impl StaticHookSource {
    pub fn new(hooks: Vec<CapabilityHook>) -> Self {
        Self { hooks }
    }
}

impl HookSource for StaticHookSource {
    fn load(&self) -> Vec<CapabilityHook> {
        self.hooks.clone()
    }
}

/// Process-wide table of capability hooks, keyed by step name.
#[derive(Debug, Default, Clone)]
pub struct CapabilityRegistry {
    hooks: HashMap<String, Arc<CapabilityHook>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            hooks: HashMap::new(),
        }
    }

    /// Register a hook. Returns error if a hook with the same name is already registered.
    pub fn register(&mut self, hook: CapabilityHook) -> Result<(), WorkflowError> {
        let name = hook.name.clone();
        if self.hooks.contains_key(&name) {
            return Err(WorkflowError::HookAlreadyRegistered { name });
        }
        debug!(hook = %name, kinds = ?hook.sorted_kinds(), "Registering capability hook");
        self.hooks.insert(name, Arc::new(hook));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<CapabilityHook>> {
        self.hooks.get(name).cloned()
    }

    /// Registered hook names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }

    /// Replace the whole table with what `source` yields. When the source
    /// yields a name twice the later hook wins.
    pub fn reload(&mut self, source: &dyn HookSource) {
        let mut hooks = HashMap::new();
        for hook in source.load() {
            if hooks.contains_key(&hook.name) {
                warn!(hook = %hook.name, "Hook source yielded duplicate name, keeping the later one");
            }
            hooks.insert(hook.name.clone(), Arc::new(hook));
        }
        info!(count = hooks.len(), "Reloaded capability hooks");
        self.hooks = hooks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evidence_hook() -> CapabilityHook {
        CapabilityHook::new("confirm_root_cause")
            .with_kinds([HookKind::Validate, HookKind::Archive])
            .with_output_schema([
                ("root_cause", FieldType::String),
                ("evidence", FieldType::StringList),
            ])
            .with_check(|payload| {
                if payload.get("evidence").is_some() {
                    Ok(())
                } else {
                    Err("must have log evidence".to_string())
                }
            })
            .with_archive_table("root_causes")
    }

    #[test]
    fn test_register_and_get() {
        let mut registry = CapabilityRegistry::new();
        assert!(registry.is_empty());
        registry.register(evidence_hook()).unwrap();
        assert_eq!(registry.len(), 1);

        let hook = registry.get("confirm_root_cause").unwrap();
        assert!(hook.has_kind(HookKind::Validate));
        assert!(!hook.has_kind(HookKind::Eval));
        assert_eq!(hook.archive_table.as_deref(), Some("root_causes"));
        assert!(registry.get("other").is_none());
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut registry = CapabilityRegistry::new();
        registry.register(evidence_hook()).unwrap();
        let err = registry.register(evidence_hook()).unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::HookAlreadyRegistered { ref name } if name == "confirm_root_cause"
        ));
    }

    #[test]
    fn test_run_check() {
        let hook = evidence_hook();
        assert!(hook.run_check(&json!({"evidence": ["log line"]})).is_ok());
        assert_eq!(
            hook.run_check(&json!({"root_cause": "oom"})).unwrap_err(),
            "must have log evidence"
        );
        assert!(CapabilityHook::new("bare").run_check(&json!({})).is_ok());
    }

    #[test]
    fn test_reload_replaces_table() {
        let mut registry = CapabilityRegistry::new();
        registry.register(CapabilityHook::new("stale")).unwrap();

        let source = StaticHookSource::new(vec![
            evidence_hook(),
            CapabilityHook::new("coverage_ok").with_kinds([HookKind::Eval]),
        ]);
        registry.reload(&source);

        assert_eq!(registry.names(), vec!["confirm_root_cause", "coverage_ok"]);
        assert!(registry.get("stale").is_none());

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_edit_policy_decide() {
        let policy = EditPolicy::new(PolicyTag::Warn)
            .with_pattern("src/**/*.rs", PolicyTag::Block)
            .with_pattern("docs/*", PolicyTag::Silent)
            .with_pattern("[broken", PolicyTag::Block);

        assert_eq!(policy.decide("src/engine/mod.rs"), PolicyTag::Block);
        assert_eq!(policy.decide("docs/readme.md"), PolicyTag::Silent);
        assert_eq!(policy.decide("Cargo.toml"), PolicyTag::Warn);
        assert_eq!(EditPolicy::default().decide("anything"), PolicyTag::Silent);
    }

    #[test]
    fn test_field_type_serde_and_sql() {
        let parsed: FieldType = serde_json::from_str("\"string[]\"").unwrap();
        assert_eq!(parsed, FieldType::StringList);
        assert_eq!(parsed.sql_type(), "TEXT");
        assert_eq!(FieldType::Number.sql_type(), "REAL");
        assert_eq!(FieldType::Boolean.sql_type(), "INTEGER");
    }

    #[test]
    fn test_debug_hides_check() {
        let text = format!("{:?}", evidence_hook());
        assert!(text.contains("<fn>"));
        assert!(text.contains("confirm_root_cause"));
    }
}
