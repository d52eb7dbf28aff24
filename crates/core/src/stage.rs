//! Stage handles
//!
//! A [`Stage`] is the per-stage runtime view handed to callbacks: the
//! resolved stage configuration, the deterministic container name, and —
//! in the inner phase only — the host path where the builder mounted the
//! container's root. Handles are minted by the orchestrator; one handle
//! exists per stage per invocation, and the outer and inner phases of a
//! stage run in different processes with separate handles.
//!
//! The handle also carries the per-container builder subcommands. Each
//! inserts `--add-history` ahead of its arguments so the resulting image
//! records provenance, and each takes its container name from the handle
//! rather than the caller.

use crate::builder::Builder;
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::grammar::{translate, Params, Schema};
use crate::value::{Map, StageFn, Value};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const ADD_HISTORY: &[&str] = &["--add-history"];

/// Runtime handle for one stage of the pipeline.
#[derive(Debug)]
pub struct Stage {
    name: String,
    container: String,
    mount: Option<PathBuf>,
    entries: Map,
    cx: Arc<Config>,
    builder: OnceCell<Builder>,
}

impl Stage {
    /// Construct the handle for `name`. Only the orchestrator mints
    /// handles; user callbacks receive them ready-made.
    pub(crate) fn new(cx: Arc<Config>, name: &str, mount: Option<PathBuf>) -> Result<Stage> {
        let entries = cx.stage_map(name)?;
        if !entries.contains_key("from") {
            return Err(Error::config(format!(
                "stage '{name}' is missing required key 'from'"
            )));
        }
        match entries.get("func_exec") {
            Some(Value::Func(_)) => {}
            _ => {
                return Err(Error::config(format!(
                    "stage '{name}' is missing required callback 'func_exec'"
                )))
            }
        }
        let container = format!("{}_{}", cx.basename(), name);
        Ok(Stage {
            name: name.to_owned(),
            container,
            mount,
            entries,
            cx,
            builder: OnceCell::new(),
        })
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// `<basename>_<stage>`, stable across the outer and inner phases.
    pub fn container_name(&self) -> &str {
        &self.container
    }

    /// The configuration this stage runs under.
    pub fn configuration(&self) -> &Config {
        &self.cx
    }

    /// Host path of the mounted container root. Only the inner phase,
    /// entered through the builder's `unshare`, has one.
    pub fn get_mnt(&self) -> Result<&Path> {
        self.mount.as_deref().ok_or_else(|| {
            Error::config(format!(
                "stage '{}': mount point is only available in the inner phase",
                self.name
            ))
        })
    }

    /// Read one stage entry, template-expanded.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.entries.get(key) {
            Some(value) => self.cx.expand(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn get_from(&self) -> Result<String> {
        self.scalar("from")?
            .ok_or_else(|| Error::config(format!("stage '{}' has no 'from' image", self.name)))
    }

    pub fn get_func_exec(&self) -> Result<StageFn> {
        self.entries
            .get("func_exec")
            .and_then(Value::as_func)
            .ok_or_else(|| {
                Error::config(format!("stage '{}' has no 'func_exec' callback", self.name))
            })
    }

    pub fn get_func_deps(&self) -> Option<StageFn> {
        self.entries.get("func_deps").and_then(Value::as_func)
    }

    pub fn get_commit(&self) -> Result<Option<Vec<String>>> {
        self.string_list("commit")
    }

    pub fn get_consumes(&self) -> Result<Option<Vec<String>>> {
        self.string_list("consumes")
    }

    pub fn get_depends(&self) -> Result<Option<Vec<String>>> {
        self.string_list("depends")
    }

    pub fn get_produces(&self) -> Result<Option<Vec<String>>> {
        self.string_list("produces")
    }

    pub fn get_user(&self) -> Result<Option<String>> {
        self.scalar("user")
    }

    pub fn get_user_home(&self) -> Result<Option<String>> {
        self.scalar("user_home")
    }

    fn scalar(&self, key: &str) -> Result<Option<String>> {
        match self.get(key)? {
            Some(value) => value.scalar_string().map(Some).ok_or_else(|| {
                Error::config(format!(
                    "stage '{}': '{key}' must be a scalar, got {}",
                    self.name,
                    value.type_name()
                ))
            }),
            None => Ok(None),
        }
    }

    /// A scalar entry is accepted as a one-element list.
    fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.get(key)? {
            None => Ok(None),
            Some(value) if value.is_scalar() => {
                Ok(Some(vec![value.scalar_string().unwrap_or_default()]))
            }
            Some(Value::Seq(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for item in &items {
                    out.push(item.scalar_string().ok_or_else(|| {
                        Error::config(format!(
                            "stage '{}': '{key}' elements must be scalars, got {}",
                            self.name,
                            item.type_name()
                        ))
                    })?);
                }
                Ok(Some(out))
            }
            Some(other) => Err(Error::config(format!(
                "stage '{}': '{key}' must be a string or sequence, got {}",
                self.name,
                other.type_name()
            ))),
        }
    }

    fn builder(&self) -> Result<&Builder> {
        self.builder.get_or_try_init(Builder::new)
    }

    // Per-container builder subcommands.

    /// `add` — copy `sources` into the container at `dest`, exploding
    /// archives. The artifact pipeline injects stage archives at `/` with
    /// this.
    pub fn add(&self, params: Params, sources: &[&str], dest: &str) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_flag: &["quiet"],
            arg_str: &["chmod", "chown"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.builder()?
            .runner("add", argv)
            .arg(self.container_name())
            .args(sources.iter().copied())
            .arg(dest)
            .run()?;
        Ok(())
    }

    /// `commit` — write the working container to `image`.
    pub fn commit(&self, params: Params, image: &str) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_flag: &["quiet", "rm", "squash"],
            arg_flag_str: &["disable-compression", "omit-timestamp"],
            arg_str: &["authfile", "cert-dir", "creds", "format", "iidfile", "sign-by"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.builder()?
            .runner("commit", argv)
            .arg(self.container_name())
            .arg(image)
            .run()?;
        Ok(())
    }

    /// `config` — adjust image metadata on the working container.
    pub fn config(&self, params: Params) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_str: &[
                "arch",
                "author",
                "comment",
                "created-by",
                "domainname",
                "hostname",
                "os",
                "shell",
                "stop-signal",
                "user",
                "workingdir",
            ],
            arg_array: &["annotation", "env", "label", "onbuild", "port", "volume"],
            arg_list: &["cmd", "entrypoint"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.builder()?
            .runner("config", argv)
            .arg(self.container_name())
            .run()?;
        Ok(())
    }

    /// `copy` — copy `sources` into the container at `dest` verbatim.
    pub fn copy(&self, params: Params, sources: &[&str], dest: &str) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_flag: &["quiet"],
            arg_str: &["chmod", "chown"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.builder()?
            .runner("copy", argv)
            .arg(self.container_name())
            .args(sources.iter().copied())
            .arg(dest)
            .run()?;
        Ok(())
    }

    /// `from` — create this stage's working container from its base image,
    /// returning the name the builder prints.
    pub fn from(&self, params: Params) -> Result<String> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_flag: &["quiet"],
            arg_flag_str: &["pull", "tls-verify"],
            arg_str: &["authfile", "cert-dir", "creds"],
            ..Schema::EMPTY
        };
        let (_, mut argv) = translate(&SCHEMA, params)?;
        argv.push(format!("--name={}", self.container_name()));
        let image = self.get_from()?;
        let out = self
            .builder()?
            .runner("from", argv)
            .arg(image)
            .capture_output()
            .run()?;
        Ok(out.stdout.unwrap_or_default().trim().to_owned())
    }

    /// `mount` — mount the container root, returning the host path.
    pub fn mount(&self, params: Params) -> Result<PathBuf> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        let out = self
            .builder()?
            .runner("mount", argv)
            .arg(self.container_name())
            .capture_output()
            .run()?;
        Ok(PathBuf::from(out.stdout.unwrap_or_default().trim()))
    }

    /// `run` — execute commands in the container. `commands` is a single
    /// scalar (one one-word command), a sequence of scalars (one command),
    /// or a sequence of sequences (several commands); the same parameters
    /// are reapplied to each command.
    pub fn run(&self, params: Params, commands: impl Into<Value>) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            arg_flag: &["terminal"],
            arg_str: &["isolation", "user"],
            arg_array: &["env", "volume"],
            ..Schema::EMPTY
        };
        for command in normalize_commands(commands.into())? {
            let (_, argv) = translate(&SCHEMA, params.clone())?;
            self.builder()?
                .runner("run", argv)
                .arg(self.container_name())
                .arg("--")
                .args(command)
                .run()?;
        }
        Ok(())
    }

    /// `umount` — unmount the container root.
    pub fn umount(&self, params: Params) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_init: ADD_HISTORY,
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.builder()?
            .runner("umount", argv)
            .arg(self.container_name())
            .run()?;
        Ok(())
    }
}

/// Normalize the three accepted command shapes into a command list.
fn normalize_commands(value: Value) -> Result<Vec<Vec<String>>> {
    match value {
        scalar if scalar.is_scalar() => {
            Ok(vec![vec![scalar.scalar_string().unwrap_or_default()]])
        }
        Value::Seq(items) => {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            if items.iter().all(Value::is_scalar) {
                let words = items
                    .iter()
                    .map(|w| w.scalar_string().unwrap_or_default())
                    .collect();
                return Ok(vec![words]);
            }
            if items.iter().all(|item| matches!(item, Value::Seq(_))) {
                let mut commands = Vec::with_capacity(items.len());
                for item in items {
                    match normalize_commands(item)? {
                        mut one if one.len() == 1 => commands.push(one.remove(0)),
                        _ => {
                            return Err(Error::contract(
                                "run commands must be strings or sequences of strings",
                            ))
                        }
                    }
                }
                return Ok(commands);
            }
            Err(Error::contract(
                "run commands must not mix scalars and sequences",
            ))
        }
        other => Err(Error::contract(format!(
            "run commands must be a scalar or sequence, got {}",
            other.type_name()
        ))),
    }
}
