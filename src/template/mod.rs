//! Template variable resolution between nodes.
//!
//! Node configuration may reference earlier outputs with `{{nodeId.path}}`
//! fragments inside string values. The resolver walks an arbitrary JSON value,
//! rebuilds arrays and objects structurally, and substitutes each reference
//! from the execution context: the first path segment names a node, the rest
//! descend into that node's output by key. A reference that cannot be
//! resolved is left in place verbatim, which also makes resolution idempotent
//! on already-resolved values.

use serde_json::{Map, Value};

use crate::workflow::ExecutionData;

/// Resolve all template references in `value` against `context`.
///
/// Pure: produces a new value, never mutates the input.
pub fn resolve(value: &Value, context: &ExecutionData) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_str(s, context)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, context)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Resolve a node's `data` map. Convenience wrapper used by the handlers.
pub fn resolve_map(data: &Map<String, Value>, context: &ExecutionData) -> Map<String, Value> {
    data.iter()
        .map(|(k, v)| (k.clone(), resolve(v, context)))
        .collect()
}

fn resolve_str(input: &str, context: &ExecutionData) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // Unterminated reference; keep the tail as-is.
            out.push_str(&rest[start..]);
            return out;
        };

        let path = after[..end].trim();
        match lookup(path, context) {
            Some(value) => out.push_str(&value_to_text(value)),
            None => out.push_str(&rest[start..start + end + 4]),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Walk `nodeId.key.key...` through the context. Any miss (unknown node,
/// missing key, descent into a non-object) resolves to `None`.
fn lookup<'a>(path: &str, context: &'a ExecutionData) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let node_id = segments.next().filter(|s| !s.is_empty())?;
    let mut current = context.get(node_id)?;
    for key in segments {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Strings substitute directly; everything else substitutes its JSON text.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionData {
        let mut ctx = ExecutionData::new();
        ctx.insert("A".into(), json!({"n": 3, "name": "alpha", "deep": {"x": true}}));
        ctx.insert("B".into(), json!({"v": 6}));
        ctx
    }

    #[test]
    fn substitutes_string_and_number_leaves() {
        let ctx = context();
        let resolved = resolve(&json!("https://example.test/{{B.v}}/{{A.name}}"), &ctx);
        assert_eq!(resolved, json!("https://example.test/6/alpha"));
    }

    #[test]
    fn non_string_values_substitute_as_json() {
        let ctx = context();
        assert_eq!(resolve(&json!("deep={{A.deep}}"), &ctx), json!("deep={\"x\":true}"));
    }

    #[test]
    fn unresolvable_references_stay_literal() {
        let ctx = context();
        assert_eq!(
            resolve(&json!("{{missing.path}} and {{A.nope.x}}"), &ctx),
            json!("{{missing.path}} and {{A.nope.x}}")
        );
    }

    #[test]
    fn structures_are_rebuilt_recursively() {
        let ctx = context();
        let input = json!({
            "url": "{{A.name}}",
            "list": ["{{B.v}}", 7, {"inner": "{{A.n}}"}],
            "flag": true
        });
        let expected = json!({
            "url": "alpha",
            "list": ["6", 7, {"inner": "3"}],
            "flag": true
        });
        assert_eq!(resolve(&input, &ctx), expected);
    }

    #[test]
    fn resolution_is_idempotent() {
        let ctx = context();
        let once = resolve(&json!({"u": "x-{{A.n}}-{{missing.k}}"}), &ctx);
        let twice = resolve(&once, &ctx);
        assert_eq!(once, twice);
    }

    #[test]
    fn unterminated_reference_is_preserved() {
        let ctx = context();
        assert_eq!(resolve(&json!("a {{B.v"), &ctx), json!("a {{B.v"));
    }

    #[test]
    fn inputs_are_not_mutated() {
        let ctx = context();
        let input = json!({"k": "{{A.n}}"});
        let snapshot = input.clone();
        let _ = resolve(&input, &ctx);
        assert_eq!(input, snapshot);
    }
}
