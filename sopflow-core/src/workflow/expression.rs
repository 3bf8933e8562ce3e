//! Expression evaluator for transition guards and `{{ expr }}` templates.
//!
//! The grammar is flat: one binary comparison or a single
//! literal/path. Paths walk nested objects with `.` and index lists with
//! `field[n]`; anything that cannot be resolved becomes `null`.

use regex::Regex;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::LazyLock;

/// Comparison operators in the order they are searched for.
const OPERATORS: [&str; 8] = ["===", "!==", ">=", "<=", "==", "!=", ">", "<"];

static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(\.\d+)?$").expect("number pattern is valid"));
static INDEXED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\w+)\[(\d+)\]$").expect("index pattern is valid"));
static OPERATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"===|!==|==|!=|>=|<=|>|<").expect("operator pattern is valid"));
static SIMPLE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.]+(\[\d+\])?$").expect("path pattern is valid"));

/// How a transition guard gets decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionKind {
    /// `@name`: decided by the named eval hook.
    Capability,
    /// A comparison or bare path the evaluator can decide.
    Expression,
    /// Free text that needs an external decision.
    Deferred,
}

impl ConditionKind {
    pub fn classify(condition: &str) -> Self {
        let condition = condition.trim();
        if condition.starts_with('@') {
            ConditionKind::Capability
        } else if OPERATOR_RE.is_match(condition) || SIMPLE_PATH_RE.is_match(condition) {
            ConditionKind::Expression
        } else {
            ConditionKind::Deferred
        }
    }
}

/// Evaluate an expression against a context map.
pub fn evaluate(expr: &str, context: &Map<String, Value>) -> Value {
    let expr = expr.trim();

    for op in OPERATORS {
        if let Some(idx) = expr.find(op) {
            let left = evaluate(&expr[..idx], context);
            let right = evaluate(&expr[idx + op.len()..], context);
            return Value::Bool(compare(op, &left, &right));
        }
    }

    parse_literal(expr).unwrap_or_else(|| resolve_path(expr, context))
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_condition(expr: &str, context: &Map<String, Value>) -> bool {
    is_truthy(&evaluate(expr, context))
}

/// Truthiness: null, false, zero, and empty strings/lists/objects are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Replace every `{{ expr }}` span with the evaluated value.
///
/// Null renders as the empty string. An unclosed `{{` is kept verbatim.
pub fn render_template(template: &str, context: &Map<String, Value>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            break;
        };
        result.push_str(&rest[..start]);
        let value = evaluate(&after_open[..end], context);
        result.push_str(&value_to_string(&value));
        rest = &after_open[end + 2..];
    }
    result.push_str(rest);
    result
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "===" | "==" => values_equal(left, right),
        "!==" | "!=" => !values_equal(left, right),
        ">" => order(left, right) == Some(Ordering::Greater),
        "<" => order(left, right) == Some(Ordering::Less),
        ">=" => matches!(order(left, right), Some(Ordering::Greater | Ordering::Equal)),
        "<=" => matches!(order(left, right), Some(Ordering::Less | Ordering::Equal)),
        _ => false,
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        _ => left == right,
    }
}

/// Numbers order against numbers and strings against strings; any other
/// pairing has no order.
fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn parse_literal(expr: &str) -> Option<Value> {
    match expr {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }

    if NUMBER_RE.is_match(expr) {
        if expr.contains('.') {
            return expr
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number);
        }
        return match expr.parse::<i64>() {
            Ok(n) => Some(Value::from(n)),
            Err(_) => expr
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number),
        };
    }

    let quoted = expr.len() >= 2
        && ((expr.starts_with('"') && expr.ends_with('"'))
            || (expr.starts_with('\'') && expr.ends_with('\'')));
    if quoted {
        return Some(Value::String(expr[1..expr.len() - 1].to_string()));
    }

    None
}

fn resolve_path(path: &str, context: &Map<String, Value>) -> Value {
    let mut parts = path.split('.');
    let Some(first) = parts.next() else {
        return Value::Null;
    };

    let mut current = match lookup(first, context) {
        Some(value) => value,
        None => return Value::Null,
    };

    for part in parts {
        let next = match current {
            Value::Object(map) => lookup(part, map),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }

    current.clone()
}

/// Resolve one path segment, honoring a trailing `[n]` index.
fn lookup<'a>(segment: &str, map: &'a Map<String, Value>) -> Option<&'a Value> {
    match INDEXED_RE.captures(segment) {
        Some(caps) => {
            let list = map.get(&caps[1])?.as_array()?;
            let index: usize = caps[2].parse().ok()?;
            list.get(index)
        }
        None => map.get(segment),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("context must be an object"),
        }
    }

    #[test]
    fn test_classify_conditions() {
        assert_eq!(ConditionKind::classify("@coverage_ok"), ConditionKind::Capability);
        assert_eq!(ConditionKind::classify("tests.passed == true"), ConditionKind::Expression);
        assert_eq!(ConditionKind::classify("review.approved"), ConditionKind::Expression);
        assert_eq!(ConditionKind::classify("items[2]"), ConditionKind::Expression);
        assert_eq!(
            ConditionKind::classify("the design covers every case"),
            ConditionKind::Deferred
        );
    }

    #[test]
    fn test_literals() {
        let c = Map::new();
        assert_eq!(evaluate("true", &c), json!(true));
        assert_eq!(evaluate("false", &c), json!(false));
        assert_eq!(evaluate("42", &c), json!(42));
        assert_eq!(evaluate("-7", &c), json!(-7));
        assert_eq!(evaluate("2.5", &c), json!(2.5));
        assert_eq!(evaluate("'hi'", &c), json!("hi"));
        assert_eq!(evaluate("\"there\"", &c), json!("there"));
    }

    #[test]
    fn test_path_lookup() {
        let c = ctx(json!({
            "review": {"score": 8, "tags": ["a", "b"]},
            "items": [1, 2, 3]
        }));
        assert_eq!(evaluate("review.score", &c), json!(8));
        assert_eq!(evaluate("review.tags[1]", &c), json!("b"));
        assert_eq!(evaluate("items[0]", &c), json!(1));
        assert_eq!(evaluate("items[9]", &c), Value::Null);
        assert_eq!(evaluate("review.missing.deeper", &c), Value::Null);
        assert_eq!(evaluate("nothing", &c), Value::Null);
        assert_eq!(evaluate("review.score.more", &c), Value::Null);
    }

    #[test]
    fn test_equality_operators() {
        let c = ctx(json!({"test": {"passed": true, "count": 1, "name": "unit"}}));
        assert!(evaluate_condition("test.passed == true", &c));
        assert!(evaluate_condition("test.passed === true", &c));
        assert!(evaluate_condition("test.count == 1.0", &c));
        assert!(evaluate_condition("test.name != 'e2e'", &c));
        assert!(evaluate_condition("test.name !== \"e2e\"", &c));
        assert!(!evaluate_condition("test.name == 'e2e'", &c));
    }

    #[test]
    fn test_ordering_operators() {
        let c = ctx(json!({"score": 7, "grade": "b"}));
        assert!(evaluate_condition("score > 5", &c));
        assert!(evaluate_condition("score >= 7", &c));
        assert!(evaluate_condition("score <= 7.0", &c));
        assert!(!evaluate_condition("score < 7", &c));
        assert!(evaluate_condition("grade < 'c'", &c));
    }

    #[test]
    fn test_incomparable_ordering_is_false() {
        let c = ctx(json!({"score": 7, "name": "x"}));
        assert!(!evaluate_condition("name > 3", &c));
        assert!(!evaluate_condition("missing < 3", &c));
        assert!(!evaluate_condition("missing >= 0", &c));
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&Value::Null));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!(0.0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!([])));
        assert!(!is_truthy(&json!({})));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!([0])));
        assert!(is_truthy(&json!(-1)));
    }

    #[test]
    fn test_bare_path_condition() {
        let c = ctx(json!({"approved": {"ok": true}, "empty": []}));
        assert!(evaluate_condition("approved.ok", &c));
        assert!(!evaluate_condition("empty", &c));
        assert!(!evaluate_condition("absent", &c));
    }

    #[test]
    fn test_render_template() {
        let c = ctx(json!({"ticket": {"id": 42, "title": "Crash"}, "gone": null}));
        assert_eq!(
            render_template("Fix #{{ ticket.id }}: {{ticket.title}}", &c),
            "Fix #42: Crash"
        );
        assert_eq!(render_template("[{{ gone }}]", &c), "[]");
        assert_eq!(render_template("no templates", &c), "no templates");
        assert_eq!(render_template("open {{ ticket.id", &c), "open {{ ticket.id");
    }

    #[test]
    fn test_loop_index_in_context() {
        let mut c = ctx(json!({"plan": {"files": ["a.rs", "b.rs"]}}));
        c.insert("each_file".into(), json!(1));
        assert!(evaluate_condition("each_file == 1", &c));
        assert!(evaluate_condition("each_file < 2", &c));
    }
}
