//! Configuration resolution
//!
//! One [`Config`] value is built per invocation: the external data file
//! (YAML; a mapping, or a sequence whose first element is a mapping) is
//! loaded first and the caller's [`InitConfig`] is overlaid on top, init
//! winning per top-level key. The tree then receives synthesized context
//! (`timestamp_str`, `arch`, and — once argument parsing has run —
//! `argv` and `opts`). After the orchestrator finishes argument
//! post-processing the tree is read-only; stage callbacks only ever
//! navigate it through [`Config::get_config`], which applies template
//! expansion to scalar and sequence reads.

use crate::errors::{Error, Result};
use crate::stage::Stage;
use crate::template;
use crate::value::{Map, StageFn, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// An additional command-line flag registered by the user's init-config.
/// Each takes a value (`--name=value`); the parsed value lands in the
/// configuration tree under `opts.<name>`.
#[derive(Debug, Clone)]
pub struct OptSpec {
    pub name: String,
    pub help: String,
}

/// Declaration of one build stage, supplied by the driver program.
///
/// The callback handles cannot come from the data file, which is why
/// stages are declared in code even when the rest of the configuration
/// lives in YAML.
#[derive(Clone, Default)]
pub struct StageSpec {
    from: Option<String>,
    func_exec: Option<StageFn>,
    func_deps: Option<StageFn>,
    consumes: Vec<String>,
    depends: Vec<String>,
    produces: Vec<String>,
    commit: Vec<String>,
    user: Option<String>,
    user_home: Option<String>,
    extra: Map,
}

impl StageSpec {
    /// Begin a stage built from the given base image reference.
    pub fn new(from: impl Into<String>) -> Self {
        StageSpec {
            from: Some(from.into()),
            ..StageSpec::default()
        }
    }

    /// The in-namespace build callback. Required.
    pub fn exec_fn(mut self, f: impl Fn(&Stage) -> Result<()> + Send + Sync + 'static) -> Self {
        self.func_exec = Some(Arc::new(f));
        self
    }

    /// Optional pre-callback, run before artifact consumption.
    pub fn deps_fn(mut self, f: impl Fn(&Stage) -> Result<()> + Send + Sync + 'static) -> Self {
        self.func_deps = Some(Arc::new(f));
        self
    }

    /// Stages whose artifact archives this stage imports.
    pub fn consumes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.consumes = names.into_iter().map(Into::into).collect();
        self
    }

    /// Ordering-only dependencies.
    pub fn depends<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = names.into_iter().map(Into::into).collect();
        self
    }

    /// Absolute directories archived when the stage finishes.
    pub fn produces<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = dirs.into_iter().map(Into::into).collect();
        self
    }

    /// Image names the stage's container is committed to.
    pub fn commit<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commit = images.into_iter().map(Into::into).collect();
        self
    }

    /// User to create before consuming, `name[=uid][:group[=gid]]`.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn user_home(mut self, home: impl Into<String>) -> Self {
        self.user_home = Some(home.into());
        self
    }

    /// Attach an arbitrary extra entry to the stage's mapping.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    fn into_value(self) -> Value {
        let mut map = self.extra;
        if let Some(from) = self.from {
            map.insert("from".into(), Value::Str(from));
        }
        if let Some(f) = self.func_exec {
            map.insert("func_exec".into(), Value::Func(f));
        }
        if let Some(f) = self.func_deps {
            map.insert("func_deps".into(), Value::Func(f));
        }
        if !self.consumes.is_empty() {
            map.insert("consumes".into(), Value::from(self.consumes));
        }
        if !self.depends.is_empty() {
            map.insert("depends".into(), Value::from(self.depends));
        }
        if !self.produces.is_empty() {
            map.insert("produces".into(), Value::from(self.produces));
        }
        if !self.commit.is_empty() {
            map.insert("commit".into(), Value::from(self.commit));
        }
        if let Some(user) = self.user {
            map.insert("user".into(), Value::Str(user));
        }
        if let Some(home) = self.user_home {
            map.insert("user_home".into(), Value::Str(home));
        }
        Value::Map(map)
    }
}

/// Initialization fields supplied by the driver program before the
/// configuration is first read.
#[derive(Clone, Default)]
pub struct InitConfig {
    basename: String,
    entries: Map,
    stages: BTreeMap<String, StageSpec>,
    added_opts: Vec<OptSpec>,
    default_config: Option<PathBuf>,
}

impl InitConfig {
    /// `basename` prefixes container names, archive filenames, and the log
    /// directory, and derives the invocation's environment variable names.
    pub fn new(basename: impl Into<String>) -> Self {
        InitConfig {
            basename: basename.into(),
            ..InitConfig::default()
        }
    }

    pub fn stage(mut self, name: impl Into<String>, spec: StageSpec) -> Self {
        self.stages.insert(name.into(), spec);
        self
    }

    /// Set an arbitrary top-level entry (referenced by template expansion).
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Register an additional `--name=value` command-line flag.
    pub fn opt(mut self, name: impl Into<String>, help: impl Into<String>) -> Self {
        self.added_opts.push(OptSpec {
            name: name.into(),
            help: help.into(),
        });
        self
    }

    /// Data file to load when `--config` is not given, replacing the
    /// conventional `<basename>.yml` / `<basename>.yaml` probe.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_config = Some(path.into());
        self
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub(crate) fn added_opts(&self) -> &[OptSpec] {
        &self.added_opts
    }

    pub(crate) fn default_config(&self) -> Option<&Path> {
        self.default_config.as_deref()
    }
}

/// The per-invocation configuration tree.
#[derive(Debug)]
pub struct Config {
    tree: Map,
    basename: String,
    timestamp: String,
    debug: i64,
    config_files: Vec<PathBuf>,
}

impl Config {
    /// Build the tree: data file first (when given), init overlaid on top,
    /// then the synthesized entries. Also stamps `timestamp_str`, reusing
    /// the value exported by an outer invocation so inner re-executions
    /// land in the same log directory.
    pub fn load(init: InitConfig, file: Option<&Path>) -> Result<Config> {
        if init.basename.is_empty() {
            return Err(Error::config("init-config must set a non-empty basename"));
        }

        let mut tree = Map::new();
        let mut config_files = Vec::new();
        if let Some(path) = file {
            tree = load_data_file(path)?;
            config_files.push(path.to_path_buf());
        }

        for (key, value) in init.entries {
            tree.insert(key, value);
        }
        if !init.stages.is_empty() {
            let stages: Map = init
                .stages
                .into_iter()
                .map(|(name, spec)| (name, spec.into_value()))
                .collect();
            tree.insert("stages".into(), Value::Map(stages));
        }
        tree.insert("basename".into(), Value::Str(init.basename.clone()));

        let timestamp = timestamp_str(&init.basename);
        tree.insert("timestamp_str".into(), Value::Str(timestamp.clone()));
        tree.insert("arch".into(), Value::Str(std::env::consts::ARCH.into()));

        Ok(Config {
            tree,
            basename: init.basename,
            timestamp,
            debug: 0,
            config_files,
        })
    }

    /// Record the raw invocation arguments under `argv`.
    pub(crate) fn set_argv(&mut self, argv: Vec<String>) {
        self.tree.insert("argv".into(), Value::from(argv));
    }

    /// Record parsed user-registered flags under `opts`.
    pub(crate) fn set_opts(&mut self, opts: Map) {
        self.tree.insert("opts".into(), Value::Map(opts));
    }

    pub fn set_debug(&mut self, level: i64) {
        self.debug = level;
    }

    pub fn get_debug(&self) -> i64 {
        self.debug
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// The invocation-wide timestamp, `YYYY-MM-DD-HH-MM-SS`.
    pub fn timestamp_str(&self) -> &str {
        &self.timestamp
    }

    /// Data files whose modification times gate artifact freshness.
    pub fn config_files(&self) -> &[PathBuf] {
        &self.config_files
    }

    /// Navigate the tree by keys. Scalar and sequence results pass through
    /// template expansion; mappings and callbacks are returned as-is.
    pub fn get_config(&self, path: &[&str]) -> Result<Option<Value>> {
        let mut node = match path.split_first() {
            Some((first, _)) => match self.tree.get(*first) {
                Some(v) => v,
                None => return Ok(None),
            },
            None => return Ok(None),
        };
        for key in &path[1..] {
            match node.as_map().and_then(|m| m.get(*key)) {
                Some(next) => node = next,
                None => return Ok(None),
            }
        }
        template::expand_value(&self.tree, node).map(Some)
    }

    /// Like [`Config::get_config`], rendering a scalar result as a string.
    pub fn get_str(&self, path: &[&str]) -> Result<Option<String>> {
        match self.get_config(path)? {
            Some(value) => value
                .scalar_string()
                .map(Some)
                .ok_or_else(|| {
                    Error::config(format!(
                        "'{}' is a {}, expected a scalar",
                        path.join("."),
                        value.type_name()
                    ))
                }),
            None => Ok(None),
        }
    }

    /// Fail fatally if any listed top-level key is missing.
    pub fn required_config(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            if !self.tree.contains_key(*key) {
                return Err(Error::config(format!(
                    "required configuration key '{key}' is missing"
                )));
            }
        }
        Ok(())
    }

    /// All declared stage names, in deterministic order.
    pub fn stage_names(&self) -> Result<Vec<String>> {
        match self.tree.get("stages") {
            Some(Value::Map(stages)) => Ok(stages.keys().cloned().collect()),
            Some(other) => Err(Error::config(format!(
                "'stages' must be a mapping, got {}",
                other.type_name()
            ))),
            None => Ok(Vec::new()),
        }
    }

    /// The raw mapping for one stage.
    pub(crate) fn stage_map(&self, name: &str) -> Result<Map> {
        let stages = match self.tree.get("stages") {
            Some(Value::Map(stages)) => stages,
            Some(other) => {
                return Err(Error::config(format!(
                    "'stages' must be a mapping, got {}",
                    other.type_name()
                )))
            }
            None => return Err(Error::config("no 'stages' mapping is configured")),
        };
        match stages.get(name) {
            Some(Value::Map(stage)) => Ok(stage.clone()),
            Some(other) => Err(Error::config(format!(
                "stage '{name}' must be a mapping, got {}",
                other.type_name()
            ))),
            None => Err(Error::config(format!("unknown stage '{name}'"))),
        }
    }

    /// Expand a value against this tree, for stage accessors.
    pub(crate) fn expand(&self, value: &Value) -> Result<Value> {
        template::expand_value(&self.tree, value)
    }
}

fn load_data_file(path: &Path) -> Result<Map> {
    let text = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
        path: path.display().to_string(),
    })?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&text)
        .map_err(|e| Error::config(format!("cannot parse {}: {e}", path.display())))?;
    let doc = match doc {
        mapping @ serde_yaml::Value::Mapping(_) => mapping,
        serde_yaml::Value::Sequence(mut items) => {
            if items.first().map(serde_yaml::Value::is_mapping) == Some(true) {
                items.swap_remove(0)
            } else {
                return Err(Error::config(format!(
                    "{}: sequence document must start with a mapping",
                    path.display()
                )));
            }
        }
        _ => {
            return Err(Error::config(format!(
                "{}: document must be a mapping",
                path.display()
            )))
        }
    };
    debug!(path = %path.display(), "loaded config file");
    match Value::from_yaml(doc, "")? {
        Value::Map(map) => Ok(map),
        other => Err(Error::config(format!(
            "{}: document must be a mapping, got {}",
            path.display(),
            other.type_name()
        ))),
    }
}

/// Environment variable carrying the invocation timestamp across
/// re-execution into the namespace.
pub fn timestamp_env_var(basename: &str) -> String {
    let mut var: String = basename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    var.push_str("_TIMESTAMP_STR");
    var
}

fn timestamp_str(basename: &str) -> String {
    let var = timestamp_env_var(basename);
    if let Ok(existing) = std::env::var(&var) {
        if !existing.is_empty() {
            return existing;
        }
    }
    let now = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S").to_string();
    std::env::set_var(&var, &now);
    now
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    #[serial]
    fn init_overlays_data_file() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "t.yml", "greeting: from-file\nextra: kept\n");
        let init = InitConfig::new("t").set("greeting", "from-init");
        let cx = Config::load(init, Some(&file))?;
        assert_eq!(cx.get_str(&["greeting"])?.as_deref(), Some("from-init"));
        assert_eq!(cx.get_str(&["extra"])?.as_deref(), Some("kept"));
        assert_eq!(cx.config_files().len(), 1);
        std::env::remove_var(timestamp_env_var("t"));
        Ok(())
    }

    #[test]
    #[serial]
    fn sequence_document_uses_first_mapping() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "s.yml", "- key: value\n- ignored: true\n");
        let cx = Config::load(InitConfig::new("s"), Some(&file))?;
        assert_eq!(cx.get_str(&["key"])?.as_deref(), Some("value"));
        std::env::remove_var(timestamp_env_var("s"));
        Ok(())
    }

    #[test]
    #[serial]
    fn scalar_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = write_file(dir.path(), "bad.yml", "just a string\n");
        let err = Config::load(InitConfig::new("bad"), Some(&file)).unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
        std::env::remove_var(timestamp_env_var("bad"));
    }

    #[test]
    #[serial]
    fn get_config_expands_templates() -> Result<()> {
        let init = InitConfig::new("x")
            .set("alpine_version", "3.20")
            .set("base", "docker://docker.io/alpine:[% alpine_version %]");
        let cx = Config::load(init, None)?;
        assert_eq!(
            cx.get_str(&["base"])?.as_deref(),
            Some("docker://docker.io/alpine:3.20")
        );
        std::env::remove_var(timestamp_env_var("x"));
        Ok(())
    }

    #[test]
    #[serial]
    fn required_config_reports_missing_key() {
        let cx = Config::load(InitConfig::new("r"), None).unwrap();
        assert!(cx.required_config(&["basename"]).is_ok());
        let err = cx.required_config(&["basename", "stages"]).unwrap_err();
        assert!(err.to_string().contains("'stages'"));
        std::env::remove_var(timestamp_env_var("r"));
    }

    #[test]
    #[serial]
    fn timestamp_reused_from_environment() {
        let var = timestamp_env_var("reuse");
        std::env::set_var(&var, "2024-01-02-03-04-05");
        let cx = Config::load(InitConfig::new("reuse"), None).unwrap();
        assert_eq!(cx.timestamp_str(), "2024-01-02-03-04-05");
        std::env::remove_var(&var);
    }

    #[test]
    #[serial]
    fn timestamp_exported_when_absent() {
        let var = timestamp_env_var("fresh");
        std::env::remove_var(&var);
        let cx = Config::load(InitConfig::new("fresh"), None).unwrap();
        let exported = std::env::var(&var).unwrap();
        assert_eq!(cx.timestamp_str(), exported);
        assert_eq!(exported.len(), "2024-01-02-03-04-05".len());
        std::env::remove_var(&var);
    }

    #[test]
    #[serial]
    fn stage_specs_land_in_tree() -> Result<()> {
        let init = InitConfig::new("p").stage(
            "build",
            StageSpec::new("img")
                .exec_fn(|_| Ok(()))
                .produces(["/opt/out"]),
        );
        let cx = Config::load(init, None)?;
        assert_eq!(cx.stage_names()?, vec!["build".to_owned()]);
        let stage = cx.stage_map("build")?;
        assert_eq!(stage.get("from"), Some(&Value::from("img")));
        assert!(matches!(stage.get("func_exec"), Some(Value::Func(_))));
        std::env::remove_var(timestamp_env_var("p"));
        Ok(())
    }

    #[test]
    #[serial]
    fn timestamp_env_var_derivation() {
        assert_eq!(timestamp_env_var("hello"), "HELLO_TIMESTAMP_STR");
        assert_eq!(timestamp_env_var("my-app"), "MY_APP_TIMESTAMP_STR");
    }
}
