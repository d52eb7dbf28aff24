//! Pipeline file loading
//!
//! The `stagehand` binary drives pipelines described entirely in YAML: the
//! file names the stages, and each stage's build callback is synthesized
//! from its `script` entry (a command, or a list of commands, run in the
//! stage's working container). Pipelines needing real callback logic link
//! `stagehand-core` from their own binary instead.
//!
//! Only enough of the file is read here to learn the stage set; the
//! orchestrator loads the same file again as the configuration tree, so
//! top-level keys stay available to template expansion and the freshness
//! gate sees the file's modification time.

use anyhow::{bail, Context, Result};
use stagehand_core::value::Map;
use stagehand_core::{InitConfig, Params, Stage, StageSpec, Value};
use std::path::{Path, PathBuf};

const DEFAULT_CANDIDATES: [&str; 2] = ["stagehand.yml", "stagehand.yaml"];

/// Build the init-config for the pipeline file named by `--config` (or the
/// conventional defaults).
pub fn load_pipeline() -> Result<InitConfig> {
    let path = pipeline_path()?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read pipeline file {}", path.display()))?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("cannot parse pipeline file {}", path.display()))?;
    let doc = match doc {
        mapping @ serde_yaml::Value::Mapping(_) => mapping,
        serde_yaml::Value::Sequence(mut items)
            if items.first().map(serde_yaml::Value::is_mapping) == Some(true) =>
        {
            items.swap_remove(0)
        }
        _ => bail!("{}: pipeline file must be a mapping", path.display()),
    };
    let root = match Value::from_yaml(doc, "") {
        Ok(Value::Map(map)) => map,
        Ok(_) => bail!("{}: pipeline file must be a mapping", path.display()),
        Err(err) => bail!("{}: {err}", path.display()),
    };

    let basename = root
        .get("basename")
        .and_then(Value::as_str)
        .filter(|basename| !basename.is_empty())
        .with_context(|| format!("{}: pipeline file must set 'basename'", path.display()))?;
    let stages = match root.get("stages") {
        Some(Value::Map(stages)) => stages,
        Some(_) => bail!("{}: 'stages' must be a mapping", path.display()),
        None => bail!("{}: pipeline file must define 'stages'", path.display()),
    };

    let mut init = InitConfig::new(basename).config_file(&path);
    for (name, stage) in stages {
        let map = match stage {
            Value::Map(map) => map,
            other => bail!("stage '{name}' must be a mapping, got {}", other.type_name()),
        };
        init = init.stage(name.as_str(), stage_spec(name, map)?);
    }
    Ok(init)
}

/// Pre-scan the arguments for `--config`; full argument parsing happens in
/// the orchestrator.
fn pipeline_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(path) = arg.strip_prefix("--config=") {
            return Ok(PathBuf::from(path));
        }
        if arg == "--config" {
            if let Some(path) = args.next() {
                return Ok(PathBuf::from(path));
            }
        }
    }
    for candidate in DEFAULT_CANDIDATES {
        if Path::new(candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }
    bail!("no pipeline file found: pass --config=<path> or create stagehand.yml")
}

fn stage_spec(name: &str, map: &Map) -> Result<StageSpec> {
    let from = map
        .get("from")
        .and_then(Value::as_str)
        .with_context(|| format!("stage '{name}' must set 'from'"))?;
    let mut spec = StageSpec::new(from).exec_fn(run_script);
    for (key, value) in map {
        match key.as_str() {
            "from" => {}
            "consumes" => spec = spec.consumes(string_list(name, key, value)?),
            "depends" => spec = spec.depends(string_list(name, key, value)?),
            "produces" => spec = spec.produces(string_list(name, key, value)?),
            "commit" => spec = spec.commit(string_list(name, key, value)?),
            "user" => spec = spec.user(scalar(name, key, value)?),
            "user_home" => spec = spec.user_home(scalar(name, key, value)?),
            other => spec = spec.set(other, value.clone()),
        }
    }
    Ok(spec)
}

/// The synthesized build callback: run the stage's `script` commands in
/// its working container.
fn run_script(stage: &Stage) -> stagehand_core::Result<()> {
    if let Some(script) = stage.get("script")? {
        tracing::debug!(stage = stage.get_name(), "running script");
        stage.run(Params::new(), script)?;
    }
    Ok(())
}

fn scalar(stage: &str, key: &str, value: &Value) -> Result<String> {
    value
        .scalar_string()
        .with_context(|| format!("stage '{stage}': '{key}' must be a scalar"))
}

fn string_list(stage: &str, key: &str, value: &Value) -> Result<Vec<String>> {
    match value {
        Value::Seq(items) => items
            .iter()
            .map(|item| {
                item.scalar_string()
                    .with_context(|| format!("stage '{stage}': '{key}' elements must be scalars"))
            })
            .collect(),
        scalar if scalar.is_scalar() => Ok(vec![scalar.scalar_string().unwrap_or_default()]),
        _ => bail!("stage '{stage}': '{key}' must be a string or sequence"),
    }
}
