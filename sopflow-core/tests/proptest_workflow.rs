//! Property-based tests for the expression evaluator and executor.

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use sopflow_core::config::ExecutorConfig;
use sopflow_core::workflow::{
    CapabilityRegistry, StateStore, WorkflowExecutor, evaluate, evaluate_condition,
    render_template,
};

fn context(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// --- Expression evaluator properties ---

proptest! {
    #[test]
    fn integer_comparisons_match_native(a in -1000i64..1000, b in -1000i64..1000) {
        let ctx = context(json!({"m": {"a": a, "b": b}}));
        prop_assert_eq!(evaluate_condition("m.a > m.b", &ctx), a > b);
        prop_assert_eq!(evaluate_condition("m.a >= m.b", &ctx), a >= b);
        prop_assert_eq!(evaluate_condition("m.a < m.b", &ctx), a < b);
        prop_assert_eq!(evaluate_condition("m.a <= m.b", &ctx), a <= b);
        prop_assert_eq!(evaluate_condition("m.a == m.b", &ctx), a == b);
        prop_assert_eq!(evaluate_condition("m.a != m.b", &ctx), a != b);
    }

    #[test]
    fn literal_on_right_matches_path(n in -500i64..500, k in -500i64..500) {
        let ctx = context(json!({"n": n}));
        let expr = format!("n >= {k}");
        prop_assert_eq!(evaluate_condition(&expr, &ctx), n >= k);
    }

    #[test]
    fn missing_paths_resolve_to_null(name in "[a-z]{1,8}") {
        let ctx = context(json!({"present": 1}));
        prop_assume!(name != "present" && name != "true" && name != "false");
        let nested = format!("{name}.deep");
        let compared = format!("{name} > 0");
        prop_assert_eq!(evaluate(&nested, &ctx), Value::Null);
        prop_assert!(!evaluate_condition(&compared, &ctx));
    }

    #[test]
    fn templates_without_markers_are_unchanged(text in "[a-zA-Z0-9 .,:!?-]{0,40}") {
        let ctx = Map::new();
        prop_assert_eq!(render_template(&text, &ctx), text);
    }

    #[test]
    fn template_substitutes_strings(word in "[a-z]{1,12}") {
        let ctx = context(json!({"v": word.clone()}));
        let expected = format!("<{word}>");
        prop_assert_eq!(render_template("<{{ v }}>", &ctx), expected);
    }
}

// --- Executor properties ---

const REPEAT_FLOW: &str = r#"
name: repeat
steps:
  - draft:
      next:
        - if: draft.stop == true
          go: finish
        - draft
  - finish
"#;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn last_submit_wins(values in prop::collection::vec(0i64..1000, 1..8)) {
        let mut exec = WorkflowExecutor::new(
            StateStore::open_in_memory().unwrap(),
            CapabilityRegistry::new(),
            ExecutorConfig::default(),
        );
        exec.start(REPEAT_FLOW, Map::new()).unwrap();
        for value in &values {
            let r = exec.submit(context(json!({"stop": false, "v": value}))).unwrap();
            prop_assert!(r.succeeded);
            prop_assert_eq!(r.new_step.as_deref(), Some("draft"));
        }
        let last = values[values.len() - 1];
        prop_assert_eq!(
            exec.get_data().unwrap()["draft"].clone(),
            json!({"stop": false, "v": last})
        );
    }

    #[test]
    fn loop_body_runs_once_per_item(count in 1usize..6) {
        let flow = r#"
name: each
steps:
  - items:
      iterate: list
      children:
        - body
  - end
"#;
        let items: Vec<usize> = (0..count).collect();
        let mut exec = WorkflowExecutor::new(
            StateStore::open_in_memory().unwrap(),
            CapabilityRegistry::new(),
            ExecutorConfig::default(),
        );
        exec.start(flow, context(json!({"list": items}))).unwrap();

        let mut runs = 0;
        while exec.store().current_state().unwrap().unwrap().current_step == "body" {
            runs += 1;
            prop_assert!(runs <= count);
            exec.submit(Map::new()).unwrap();
        }
        prop_assert_eq!(runs, count);
        let state = exec.store().current_state().unwrap().unwrap();
        prop_assert_eq!(state.current_step.as_str(), "end");
        prop_assert!(state.loop_state.is_empty());
    }
}
