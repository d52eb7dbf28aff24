//! Parameter grammar engine
//!
//! Every builder subcommand wrapper declares its command-line surface as a
//! [`Schema`]: lists of parameter names grouped by how each is rendered.
//! [`translate`] turns a named-parameter map into a positional argument
//! list in one fixed order, so the same parameters always produce the same
//! argv and the whole builder CLI surface is auditable in one place.
//!
//! Processing order: `extract`, `arg_init`, `exclusive`, `arg_flag`,
//! `arg_flag_str`, `arg_str`, `arg_array`, `arg_list`. Parameters left over
//! after all categories are a call-contract violation.

use crate::errors::{Error, Result};
use crate::value::Value;
use std::collections::BTreeMap;

/// Named parameters passed to a wrapper.
pub type Params = BTreeMap<String, Value>;

/// Build a [`Params`] map from `(name, value)` pairs.
pub fn params<const N: usize>(entries: [(&str, Value); N]) -> Params {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

/// Declarative parameter grammar for one subcommand.
#[derive(Debug, Clone, Copy)]
pub struct Schema<'a> {
    /// Removed from the parameter map and returned for the wrapper to
    /// handle specially.
    pub extract: &'a [&'a str],
    /// Literal argv prefix.
    pub arg_init: &'a [&'a str],
    /// Parameters which, when present, must be the sole remaining one.
    pub exclusive: &'a [&'a str],
    /// Booleans rendered as `--name` (omitted when false).
    pub arg_flag: &'a [&'a str],
    /// String parameters restricted to `"true"`/`"false"`, rendered as
    /// `--name value`.
    pub arg_flag_str: &'a [&'a str],
    /// Scalars rendered as `--name value`.
    pub arg_str: &'a [&'a str],
    /// Sequences rendered as repeated `--name value`.
    pub arg_array: &'a [&'a str],
    /// Sequences rendered as one `--name [ "v1", "v2" ]` list literal.
    pub arg_list: &'a [&'a str],
}

impl Schema<'static> {
    pub const EMPTY: Schema<'static> = Schema {
        extract: &[],
        arg_init: &[],
        exclusive: &[],
        arg_flag: &[],
        arg_flag_str: &[],
        arg_str: &[],
        arg_array: &[],
        arg_list: &[],
    };
}

/// Translate named parameters into `(extracted, argv_tail)`.
pub fn translate(schema: &Schema<'_>, mut params: Params) -> Result<(Params, Vec<String>)> {
    let mut extracted = Params::new();
    let mut argv: Vec<String> = Vec::new();

    for name in schema.extract {
        if let Some(value) = params.remove(*name) {
            extracted.insert((*name).to_owned(), value);
        }
    }

    argv.extend(schema.arg_init.iter().map(|lit| (*lit).to_owned()));

    for name in schema.exclusive {
        if params.contains_key(*name) && params.len() > 1 {
            return Err(Error::contract(format!("parameter '{name}' is exclusive")));
        }
    }

    for name in schema.arg_flag {
        if let Some(value) = params.remove(*name) {
            match value.as_bool() {
                Some(true) => argv.push(format!("--{name}")),
                Some(false) => {}
                None => {
                    return Err(Error::contract(format!(
                        "parameter '{name}' expects a boolean, got {}",
                        value.type_name()
                    )))
                }
            }
        }
    }

    for name in schema.arg_flag_str {
        if let Some(value) = params.remove(*name) {
            match value.as_str() {
                Some(s @ ("true" | "false")) => {
                    argv.push(format!("--{name}"));
                    argv.push(s.to_owned());
                }
                _ => {
                    return Err(Error::contract(format!(
                        "parameter '{name}' expects the string \"true\" or \"false\""
                    )))
                }
            }
        }
    }

    for name in schema.arg_str {
        if let Some(value) = params.remove(*name) {
            let rendered = value.scalar_string().ok_or_else(|| {
                Error::contract(format!(
                    "parameter '{name}' expects a scalar, got {}",
                    value.type_name()
                ))
            })?;
            argv.push(format!("--{name}"));
            argv.push(rendered);
        }
    }

    for name in schema.arg_array {
        if let Some(value) = params.remove(*name) {
            for item in into_sequence(name, value)? {
                argv.push(format!("--{name}"));
                argv.push(item);
            }
        }
    }

    for name in schema.arg_list {
        if let Some(value) = params.remove(*name) {
            let items = into_sequence(name, value)?;
            argv.push(format!("--{name}"));
            argv.push(render_list_literal(&items));
        }
    }

    if !params.is_empty() {
        let names: Vec<&str> = params.keys().map(String::as_str).collect();
        return Err(Error::contract(format!(
            "unexpected parameter(s): {}",
            names.join(", ")
        )));
    }

    Ok((extracted, argv))
}

/// Sequence categories accept a lone scalar as a one-element sequence.
fn into_sequence(name: &str, value: Value) -> Result<Vec<String>> {
    match value {
        Value::Seq(items) => items
            .iter()
            .map(|item| {
                item.scalar_string().ok_or_else(|| {
                    Error::contract(format!(
                        "parameter '{name}' expects scalar elements, got {}",
                        item.type_name()
                    ))
                })
            })
            .collect(),
        scalar if scalar.is_scalar() => Ok(vec![scalar
            .scalar_string()
            .unwrap_or_default()]),
        other => Err(Error::contract(format!(
            "parameter '{name}' expects a scalar or sequence, got {}",
            other.type_name()
        ))),
    }
}

/// The builder's list-literal form, e.g. `[ "sh", "-c", "date" ]`.
fn render_list_literal(items: &[String]) -> String {
    let quoted: Vec<String> = items
        .iter()
        .map(|item| serde_json::Value::from(item.as_str()).to_string())
        .collect();
    format!("[ {} ]", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: Schema<'static> = Schema {
        extract: &["image"],
        arg_init: &["--add-history"],
        exclusive: &["all"],
        arg_flag: &["quiet", "all"],
        arg_flag_str: &["tls-verify"],
        arg_str: &["format", "user"],
        arg_array: &["env", "volume"],
        arg_list: &["entrypoint"],
    };

    #[test]
    fn category_order_is_fixed() {
        let params = params([
            ("entrypoint", Value::from(vec!["sh", "-c"])),
            ("env", Value::from(vec!["A=1", "B=2"])),
            ("format", Value::from("oci")),
            ("image", Value::from("img:latest")),
            ("quiet", Value::from(true)),
            ("tls-verify", Value::from("false")),
        ]);
        let (extracted, argv) = translate(&SCHEMA, params).unwrap();
        assert_eq!(extracted.get("image"), Some(&Value::from("img:latest")));
        assert_eq!(
            argv,
            vec![
                "--add-history",
                "--quiet",
                "--tls-verify",
                "false",
                "--format",
                "oci",
                "--env",
                "A=1",
                "--env",
                "B=2",
                "--entrypoint",
                "[ \"sh\", \"-c\" ]",
            ]
        );
    }

    #[test]
    fn translate_is_deterministic() {
        let build = || {
            params([
                ("env", Value::from(vec!["X=1"])),
                ("user", Value::from("build")),
                ("volume", Value::from("/cache")),
            ])
        };
        let (_, first) = translate(&SCHEMA, build()).unwrap();
        let (_, second) = translate(&SCHEMA, build()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn scalar_promoted_to_singleton_sequence() {
        let scalar = params([("env", Value::from("A=1"))]);
        let seq = params([("env", Value::from(vec!["A=1"]))]);
        let (_, from_scalar) = translate(&SCHEMA, scalar).unwrap();
        let (_, from_seq) = translate(&SCHEMA, seq).unwrap();
        assert_eq!(from_scalar, from_seq);
    }

    #[test]
    fn exclusive_violation_fails_before_emitting() {
        let err = translate(
            &SCHEMA,
            params([("all", Value::from(true)), ("quiet", Value::from(true))]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'all' is exclusive"));
    }

    #[test]
    fn exclusive_alone_is_rendered_by_its_category() {
        let (_, argv) = translate(&SCHEMA, params([("all", Value::from(true))])).unwrap();
        assert_eq!(argv, vec!["--add-history", "--all"]);
    }

    #[test]
    fn unknown_parameter_is_a_contract_error() {
        let err = translate(&SCHEMA, params([("bogus", Value::from(1))])).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn scalar_category_rejects_sequences() {
        let err = translate(&SCHEMA, params([("user", Value::from(vec!["a", "b"]))])).unwrap_err();
        assert!(err.to_string().contains("'user' expects a scalar"));
    }

    #[test]
    fn flag_category_rejects_non_booleans() {
        let err = translate(&SCHEMA, params([("quiet", Value::from("yes"))])).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn flag_str_rejects_other_strings() {
        let err = translate(&SCHEMA, params([("tls-verify", Value::from("maybe"))])).unwrap_err();
        assert!(matches!(err, Error::Contract { .. }));
    }

    #[test]
    fn false_flag_is_omitted() {
        let (_, argv) = translate(&SCHEMA, params([("quiet", Value::from(false))])).unwrap();
        assert_eq!(argv, vec!["--add-history"]);
    }

    #[test]
    fn list_literal_escapes_quotes() {
        let items = vec!["say \"hi\"".to_owned()];
        assert_eq!(render_list_literal(&items), "[ \"say \\\"hi\\\"\" ]");
    }

    #[test]
    fn params_are_fully_consumed_on_success() {
        let input = params([("quiet", Value::from(true)), ("image", Value::from("x"))]);
        let (extracted, argv) = translate(&SCHEMA, input).unwrap();
        // nothing unaccounted for: one extracted, the rest rendered
        assert_eq!(extracted.len(), 1);
        assert_eq!(argv, vec!["--add-history", "--quiet"]);
    }
}
