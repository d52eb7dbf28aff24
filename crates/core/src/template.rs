//! Template-style expansion of configuration scalars
//!
//! Scalar values read from the configuration tree may embed `[% key %]`
//! tokens naming other tree entries (dotted paths navigate into nested
//! mappings). Expansion repeats until the value stops changing, so macros
//! may reference other macros. A value still changing after the pass cap
//! is a runaway self-reference and fails; tokens naming unknown or
//! non-scalar entries are left in place unchanged.

use crate::errors::{Error, Result};
use crate::value::{Map, Value};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Per-value expansion pass cap.
pub const MAX_PASSES: usize = 10;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[%\s*([A-Za-z0-9_][A-Za-z0-9_.-]*)\s*%\]").expect("expansion regex is valid")
});

/// Expand one string against the configuration root.
pub fn expand_str(root: &Map, input: &str) -> Result<String> {
    let mut current = input.to_owned();
    for _ in 0..MAX_PASSES {
        if !TOKEN.is_match(&current) {
            return Ok(current);
        }
        let next = expand_once(root, &current);
        if next == current {
            // only unresolvable tokens remain
            return Ok(current);
        }
        current = next;
    }
    if expand_once(root, &current) == current {
        return Ok(current);
    }
    Err(Error::Expansion {
        passes: MAX_PASSES,
        value: current,
    })
}

/// Expand a tree node as `get_config` reads it: strings expanded, sequences
/// element-wise, everything else returned untouched.
pub fn expand_value(root: &Map, value: &Value) -> Result<Value> {
    match value {
        Value::Str(s) => Ok(Value::Str(expand_str(root, s)?)),
        Value::Seq(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_value(root, item)?);
            }
            Ok(Value::Seq(out))
        }
        other => Ok(other.clone()),
    }
}

fn expand_once(root: &Map, input: &str) -> String {
    TOKEN
        .replace_all(input, |caps: &regex::Captures| {
            let path = &caps[1];
            match lookup_scalar(root, path) {
                Some(replacement) => replacement,
                None => {
                    debug!(token = path, "expansion token left unchanged");
                    caps[0].to_owned()
                }
            }
        })
        .into_owned()
}

/// Resolve a dotted path from the root to a scalar leaf.
fn lookup_scalar(root: &Map, path: &str) -> Option<String> {
    let mut node: Option<&Value> = None;
    let mut map = root;
    for part in path.split('.') {
        let next = map.get(part)?;
        node = Some(next);
        map = match next.as_map() {
            Some(m) => m,
            None => &EMPTY,
        };
    }
    node.and_then(Value::scalar_string)
}

static EMPTY: Lazy<Map> = Lazy::new(Map::new);

#[cfg(test)]
mod tests {
    use super::*;

    fn root(entries: &[(&str, Value)]) -> Map {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn simple_substitution() -> Result<()> {
        let root = root(&[("alpine_version", Value::from("3.20"))]);
        let out = expand_str(&root, "docker://docker.io/alpine:[% alpine_version %]")?;
        assert_eq!(out, "docker://docker.io/alpine:3.20");
        Ok(())
    }

    #[test]
    fn chained_macros_converge() -> Result<()> {
        let root = root(&[
            ("registry", Value::from("docker.io")),
            ("image", Value::from("[% registry %]/alpine")),
        ]);
        let out = expand_str(&root, "docker://[% image %]:latest")?;
        assert_eq!(out, "docker://docker.io/alpine:latest");
        Ok(())
    }

    #[test]
    fn dotted_paths_navigate_mappings() -> Result<()> {
        let mut inner = Map::new();
        inner.insert("port".into(), Value::Int(8080));
        let root = root(&[("service", Value::Map(inner))]);
        assert_eq!(expand_str(&root, "http://host:[% service.port %]")?, "http://host:8080");
        Ok(())
    }

    #[test]
    fn unknown_token_left_unchanged() -> Result<()> {
        let root = Map::new();
        let input = "ref: [% no_such_key %]";
        assert_eq!(expand_str(&root, input)?, input);
        Ok(())
    }

    #[test]
    fn non_scalar_target_left_unchanged() -> Result<()> {
        let root = root(&[("list", Value::from(vec!["a", "b"]))]);
        let input = "[% list %]";
        assert_eq!(expand_str(&root, input)?, input);
        Ok(())
    }

    #[test]
    fn self_reference_fails_at_cap() {
        let root = root(&[("loop", Value::from("x[% loop %]"))]);
        let err = expand_str(&root, "[% loop %]").unwrap_err();
        assert!(matches!(err, Error::Expansion { passes: 10, .. }));
    }

    #[test]
    fn deep_chain_within_cap_converges() -> Result<()> {
        // nine links resolve within the ten-pass cap
        let mut root = Map::new();
        root.insert("k0".into(), Value::from("done"));
        for i in 1..10 {
            root.insert(format!("k{i}"), Value::from(format!("[% k{} %]", i - 1)));
        }
        assert_eq!(expand_str(&root, "[% k9 %]")?, "done");
        Ok(())
    }

    #[test]
    fn sequences_expand_element_wise() -> Result<()> {
        let root = root(&[("v", Value::from("1"))]);
        let value = Value::from(vec!["a-[% v %]", "b"]);
        let expanded = expand_value(&root, &value)?;
        assert_eq!(expanded, Value::from(vec!["a-1", "b"]));
        Ok(())
    }
}
