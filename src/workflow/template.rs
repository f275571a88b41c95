//! Template References
//!
//! Step templates and map sources point at other values with
//! `{name->var}`:
//!
//! - `{workflow->x}`: workflow input or parameter `x`
//! - `{step->output}`: output location of parent step `step`
//!
//! Map items add positional captures `{1}`, `{2}`... Expansion replaces all
//! keys in a single left-to-right pass, so substituted text is never
//! rescanned.

use std::collections::BTreeMap;

use serde_json::Value;

/// Owner name of workflow-level inputs and parameters.
pub const WORKFLOW: &str = "workflow";

/// A parsed `{name->var}` back-reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Reference {
    pub name: String,
    pub var: String,
}

impl Reference {
    /// The literal text of the reference, used as a replacement key.
    pub fn token(&self) -> String {
        format!("{{{}->{}}}", self.name, self.var)
    }

    pub fn is_workflow(&self) -> bool {
        self.name == WORKFLOW
    }
}

/// Splits the inside of a brace pair at its last `->`.
fn split_reference(inner: &str) -> Option<Reference> {
    let (name, var) = inner.rsplit_once("->")?;
    if name.is_empty() || var.is_empty() {
        return None;
    }
    Some(Reference {
        name: name.to_string(),
        var: var.to_string(),
    })
}

/// Every back-reference found in `text`, in order of appearance.
///
/// ```
/// use pipeflow::workflow::template::references;
///
/// let refs = references("{workflow->reads}/{1}.fq -o {align->output}");
/// assert_eq!(refs.len(), 2);
/// assert_eq!(refs[1].name, "align");
/// ```
pub fn references(text: &str) -> Vec<Reference> {
    let mut found = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match after.find(|c: char| c == '{' || c == '}') {
            Some(idx) if after[idx..].starts_with('}') => {
                if let Some(reference) = split_reference(&after[..idx]) {
                    found.push(reference);
                }
                rest = &after[idx + 1..];
            }
            Some(idx) => rest = &after[idx..],
            None => break,
        }
    }

    found
}

/// Parses a string that must consist of exactly one reference.
pub fn parse_reference(text: &str) -> Option<Reference> {
    let inner = text.trim().strip_prefix('{')?.strip_suffix('}')?;
    if inner.contains(|c: char| c == '{' || c == '}') {
        return None;
    }
    split_reference(inner)
}

/// Replaces every key of `table` found in `text` in one pass.
///
/// At each position the longest matching key wins.
pub fn multiple_replace(text: &str, table: &BTreeMap<String, String>) -> String {
    if table.is_empty() {
        return text.to_string();
    }

    let mut output = String::with_capacity(text.len());
    let mut pos = 0;

    while pos < text.len() {
        let rest = &text[pos..];
        let matched = table
            .iter()
            .filter(|(key, _)| !key.is_empty() && rest.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len());

        match matched {
            Some((key, value)) => {
                output.push_str(value);
                pos += key.len();
            }
            None => {
                // rest is non-empty, so there is a next char
                let ch_len = rest.chars().next().map_or(1, char::len_utf8);
                output.push_str(&rest[..ch_len]);
                pos += ch_len;
            }
        }
    }

    output
}

/// Applies `table` to every string value of `template`; other values pass
/// through unchanged.
pub fn expand_template(
    template: &BTreeMap<String, Value>,
    table: &BTreeMap<String, String>,
) -> BTreeMap<String, Value> {
    template
        .iter()
        .map(|(key, value)| {
            let expanded = match value {
                Value::String(s) => Value::String(multiple_replace(s, table)),
                other => other.clone(),
            };
            (key.clone(), expanded)
        })
        .collect()
}
