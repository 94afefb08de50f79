//! Reference extraction from rendered templates.

use std::collections::BTreeSet;

use serde_json::Value;

/// Logical IDs and export names a rendered template points at
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct References {
    /// Targets of `Ref`, `Fn::GetAtt` and `Fn::Sub` placeholders
    pub local: BTreeSet<String>,
    /// Literal names passed to `Fn::ImportValue`
    pub imports: BTreeSet<String>,
}

/// Walk a rendered JSON value and collect everything it references
pub fn collect(value: &Value) -> References {
    let mut refs = References::default();
    walk(value, &mut refs);
    refs
}

fn walk(value: &Value, refs: &mut References) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| walk(item, refs)),
        Value::Object(map) => {
            if map.len() == 1
                && let Some((key, inner)) = map.iter().next()
                && visit_intrinsic(key, inner, refs)
            {
                return;
            }
            map.values().for_each(|v| walk(v, refs));
        }
        _ => {}
    }
}

/// Record an intrinsic function call; false if `key` is not one we track.
fn visit_intrinsic(key: &str, inner: &Value, refs: &mut References) -> bool {
    match (key, inner) {
        ("Ref", Value::String(target)) => {
            refs.local.insert(target.clone());
        }
        ("Fn::GetAtt", Value::Array(parts)) => {
            if let Some(Value::String(target)) = parts.first() {
                refs.local.insert(target.clone());
            }
        }
        ("Fn::Sub", Value::String(template)) => {
            refs.local.extend(sub_placeholders(template));
        }
        ("Fn::Sub", Value::Array(parts)) => {
            let variables: BTreeSet<String> = parts
                .get(1)
                .and_then(Value::as_object)
                .map(|vars| vars.keys().cloned().collect())
                .unwrap_or_default();
            if let Some(Value::String(template)) = parts.first() {
                refs.local
                    .extend(sub_placeholders(template).into_iter().filter(|p| !variables.contains(p)));
            }
            if let Some(vars) = parts.get(1) {
                walk(vars, refs);
            }
        }
        ("Fn::ImportValue", Value::String(name)) => {
            refs.imports.insert(name.clone());
        }
        _ => return false,
    }
    true
}

/// Resource names mentioned by `${...}` placeholders. `${!Literal}` escapes
/// are skipped and `${Res.Attr}` yields `Res`.
pub fn sub_placeholders(template: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let name = &after[..end];
        if !name.starts_with('!') && !name.is_empty() {
            let target = name.split('.').next().unwrap_or(name);
            found.push(target.to_string());
        }
        rest = &after[end + 1..];
    }
    found
}
