//! # Template Resolution and Expression Evaluation
//!
//! Suite files reference variables through the `${{ ... }}` template syntax
//! and compute derived values through a small expression language. This module
//! resolves both against a merged variable view.
//!
//! ## Template Syntax
//!
//! - `${{ user }}` — direct variable lookup
//! - `${{ auth.token }}` — exported-variable lookup (`node_id.name`), falling
//!   back to dotted-path navigation into a structured value
//! - `${{ order.items[0].sku }}` — path navigation with array indices
//!
//! ## Expression Language
//!
//! Dynamic-variable expressions evaluate against a scope object and support
//! literals, dotted paths, `+` (numeric addition or string concatenation) and
//! `==` equality. Anything unresolvable yields `None` rather than an error so
//! a failed evaluation can be skipped without aborting the batch.

use serde_json::{Map as JsonMap, Number, Value};

/// Recursively interpolates all `${{ ... }}` templates in a JSON value.
///
/// Strings are interpolated in place; arrays and objects are walked
/// recursively. Non-string leaves are returned unchanged.
pub fn interpolate_value(value: &Value, variables: &JsonMap<String, Value>) -> Value {
    match value {
        Value::String(text) => Value::String(interpolate_string(text, variables)),
        Value::Array(items) => Value::Array(items.iter().map(|item| interpolate_value(item, variables)).collect()),
        Value::Object(map) => {
            let mut interpolated = JsonMap::new();
            for (key, entry) in map {
                interpolated.insert(key.clone(), interpolate_value(entry, variables));
            }
            Value::Object(interpolated)
        }
        _ => value.clone(),
    }
}

/// Interpolates `${{ ... }}` templates in a string.
///
/// Unresolvable expressions render as empty strings; a template without a
/// closing marker is preserved as-is.
pub fn interpolate_string(input: &str, variables: &JsonMap<String, Value>) -> String {
    let mut output = String::new();
    let mut remaining = input;

    while let Some(start) = remaining.find("${{") {
        let (before, after) = remaining.split_at(start);
        output.push_str(before);

        match after.find("}}") {
            Some(end) => {
                let expression = after[3..end].trim();
                if let Some(resolved) = resolve_variable(expression, variables) {
                    output.push_str(&render_value(&resolved));
                }
                remaining = &after[end + 2..];
            }
            None => {
                output.push_str(after);
                return output;
            }
        }
    }

    output.push_str(remaining);
    output
}

/// Resolves a variable reference against the merged view.
///
/// Exact key matches win, so an imported export like `auth.token` is found
/// before any attempt to navigate a structured variable named `auth`.
pub fn resolve_variable(expression: &str, variables: &JsonMap<String, Value>) -> Option<Value> {
    if let Some(value) = variables.get(expression) {
        return Some(value.clone());
    }

    let (head, rest) = match expression.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (expression, None),
    };
    let (key, indices) = split_indices(head);
    let mut current = variables.get(key)?.clone();
    for index in indices {
        current = current.get(index)?.clone();
    }
    match rest {
        Some(rest) => lookup_path(&current, rest),
        None => Some(current),
    }
}

/// Navigates a dotted path with optional `[idx]` segments into a JSON value.
pub fn lookup_path(root: &Value, path: &str) -> Option<Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Some(root.clone());
    }

    let mut current = root;
    for segment in trimmed.split('.') {
        if segment.is_empty() {
            continue;
        }
        let (key, indices) = split_indices(segment);
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current.clone())
}

fn split_indices(segment: &str) -> (&str, Vec<usize>) {
    let mut key_end = segment.len();
    let bytes = segment.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'[' {
            key_end = i;
            break;
        }
    }
    let key = &segment[..key_end];
    let mut indices = Vec::new();
    let mut i = key_end;
    while i < bytes.len() {
        if bytes[i] != b'[' {
            break;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i] != b']' {
            i += 1;
        }
        if i <= start {
            break;
        }
        if let Ok(n) = segment[start..i].parse::<usize>() {
            indices.push(n);
        }
        i += 1;
    }
    (key, indices)
}

/// Evaluates a dynamic-variable expression against a scope object.
///
/// Handlers are tried in order: equality, concatenation/addition, then a
/// single term (literal or path). `None` means the expression referenced
/// something absent or did not parse; callers log and skip the assignment.
pub fn evaluate_expression(expression: &str, scope: &Value) -> Option<Value> {
    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(result) = evaluate_equality(trimmed, scope) {
        return Some(result);
    }
    if let Some(result) = evaluate_addition(trimmed, scope) {
        return Some(result);
    }
    evaluate_term(trimmed, scope)
}

/// Evaluates `left == right`, returning a boolean value.
fn evaluate_equality(expression: &str, scope: &Value) -> Option<Value> {
    let position = find_top_level(expression, "==")?;
    let left = evaluate_expression(&expression[..position], scope)?;
    let right = evaluate_expression(&expression[position + 2..], scope)?;
    Some(Value::Bool(left == right))
}

/// Evaluates `a + b + ...` as numeric addition when every operand is a
/// number, otherwise as string concatenation of the rendered operands.
fn evaluate_addition(expression: &str, scope: &Value) -> Option<Value> {
    let operands = split_top_level(expression, '+');
    if operands.len() < 2 {
        return None;
    }

    let values: Vec<Value> = operands
        .iter()
        .map(|operand| evaluate_expression(operand, scope))
        .collect::<Option<Vec<_>>>()?;

    if values.iter().all(Value::is_number) {
        let sum: f64 = values.iter().filter_map(Value::as_f64).sum();
        if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
            return Some(Value::Number(Number::from(sum as i64)));
        }
        return Number::from_f64(sum).map(Value::Number);
    }

    Some(Value::String(values.iter().map(render_value).collect::<Vec<_>>().concat()))
}

/// Evaluates a single term: a literal or a path into the scope object.
fn evaluate_term(term: &str, scope: &Value) -> Option<Value> {
    let trimmed = term.trim();

    // Single-quoted string literal, the common suite-file spelling.
    if trimmed.len() >= 2 && trimmed.starts_with('\'') && trimmed.ends_with('\'') {
        return Some(Value::String(trimmed[1..trimmed.len() - 1].to_string()));
    }
    // JSON literals: strings, numbers, booleans, null, arrays, objects.
    if trimmed.starts_with('"')
        || trimmed.starts_with('[')
        || trimmed.starts_with('{')
        || trimmed == "true"
        || trimmed == "false"
        || trimmed == "null"
        || trimmed.parse::<f64>().is_ok()
    {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return Some(value);
        }
    }

    let resolved = lookup_path(scope, trimmed)?;
    // An explicit null in the scope counts as undefined for assignments.
    if resolved.is_null() { None } else { Some(resolved) }
}

/// Finds `operator` at the top level of `expression`, outside any quotes.
fn find_top_level(expression: &str, operator: &str) -> Option<usize> {
    let mut in_single = false;
    let mut in_double = false;
    for (i, ch) in expression.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            _ if !in_single && !in_double && expression[i..].starts_with(operator) => return Some(i),
            _ => {}
        }
    }
    None
}

/// Splits `expression` on `separator` at the top level, outside any quotes.
fn split_top_level(expression: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut start = 0;
    for (i, ch) in expression.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            c if c == separator && !in_single && !in_double => {
                parts.push(&expression[start..i]);
                start = i + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&expression[start..]);
    parts
}

/// Renders a JSON value for string interpolation.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(boolean) => boolean.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn variables() -> JsonMap<String, Value> {
        let mut map = JsonMap::new();
        map.insert("user".into(), json!("alice"));
        map.insert("auth.token".into(), json!("tok-123"));
        map.insert("order".into(), json!({"items": [{"sku": "A-1"}, {"sku": "B-2"}]}));
        map
    }

    #[test]
    fn interpolates_direct_and_exported_names() {
        let vars = variables();
        assert_eq!(interpolate_string("hello ${{ user }}", &vars), "hello alice");
        assert_eq!(interpolate_string("Bearer ${{ auth.token }}", &vars), "Bearer tok-123");
    }

    #[test]
    fn exact_key_wins_over_path_navigation() {
        let mut vars = variables();
        vars.insert("auth".into(), json!({"token": "wrong"}));
        assert_eq!(resolve_variable("auth.token", &vars), Some(json!("tok-123")));
    }

    #[test]
    fn navigates_paths_with_indices() {
        let vars = variables();
        assert_eq!(resolve_variable("order.items[1].sku", &vars), Some(json!("B-2")));
        assert_eq!(resolve_variable("order.items[5].sku", &vars), None);
    }

    #[test]
    fn unresolvable_template_renders_empty_keeping_literal_text() {
        let vars = variables();
        assert_eq!(interpolate_string("${{ missing }}-suffix", &vars), "-suffix");
        assert_eq!(interpolate_string("a-${{ missing }}-b", &vars), "a--b");
        assert_eq!(interpolate_string("no templates here", &vars), "no templates here");
    }

    #[test]
    fn non_ascii_identifiers_evaluate_without_panicking() {
        let scope = json!({"variables": {"prénom": "Aimée", "âge": 3}});
        assert_eq!(evaluate_expression("variables.prénom", &scope), Some(json!("Aimée")));
        assert_eq!(evaluate_expression("variables.prénom == 'Aimée'", &scope), Some(json!(true)));
        assert_eq!(evaluate_expression("variables.âge + 1", &scope), Some(json!(4)));
        assert_eq!(evaluate_expression("variables.inconnu", &scope), None);
    }

    #[test]
    fn malformed_template_is_preserved() {
        let vars = variables();
        assert_eq!(interpolate_string("broken ${{ user", &vars), "broken ${{ user");
    }

    #[test]
    fn interpolates_nested_structures() {
        let vars = variables();
        let value = json!({"url": "/users/${{ user }}", "nested": {"auth": "${{ auth.token }}"}});
        let result = interpolate_value(&value, &vars);
        assert_eq!(result["url"], "/users/alice");
        assert_eq!(result["nested"]["auth"], "tok-123");
    }

    #[test]
    fn evaluates_numeric_addition() {
        let scope = json!({"variables": {"a": 2, "b": 3}});
        assert_eq!(evaluate_expression("variables.a + variables.b", &scope), Some(json!(5)));
    }

    #[test]
    fn evaluates_string_concatenation() {
        let scope = json!({"variables": {"name": "alice"}});
        assert_eq!(
            evaluate_expression("'hello ' + variables.name", &scope),
            Some(json!("hello alice"))
        );
    }

    #[test]
    fn evaluates_equality() {
        let scope = json!({"value": "prod"});
        assert_eq!(evaluate_expression("value == 'prod'", &scope), Some(json!(true)));
        assert_eq!(evaluate_expression("value == 'dev'", &scope), Some(json!(false)));
    }

    #[test]
    fn missing_reference_yields_none() {
        let scope = json!({"variables": {}});
        assert_eq!(evaluate_expression("variables.missing", &scope), None);
        assert_eq!(evaluate_expression("variables.missing + 1", &scope), None);
    }

    #[test]
    fn plus_inside_quotes_is_not_an_operator() {
        let scope = json!({});
        assert_eq!(evaluate_expression("'a + b'", &scope), Some(json!("a + b")));
    }
}
