use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokenflow_types::format_value;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.$\[\]]+)\s*\}\}").expect("valid regex"));

/// Replace every `{{dotted.path}}` in `template` with the value found at
/// that path in `root`. Missing paths render as the empty string.
///
/// This is string templating, not formula evaluation: no operators, no
/// intrinsics, just lookups. The action system and interpretation rules use
/// it for URLs, messages and mail bodies.
pub fn substitute(template: &str, root: &Value) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            match lookup(root, &caps[1]) {
                Some(value) => format_value(&value),
                None => String::new(),
            }
        })
        .into_owned()
}

pub(crate) fn lookup(root: &Value, path: &str) -> Option<Value> {
    let mut current = root.clone();
    for segment in path.split('.') {
        // Allow `items[2]` segments alongside plain field names.
        let (field, index) = match segment.find('[') {
            Some(pos) if segment.ends_with(']') => {
                let idx: usize = segment[pos + 1..segment.len() - 1].parse().ok()?;
                (&segment[..pos], Some(idx))
            }
            _ => (segment, None),
        };

        if !field.is_empty() {
            current = current.get(field)?.clone();
        }
        if let Some(idx) = index {
            current = current.get(idx)?.clone();
        }
    }
    Some(current)
}
