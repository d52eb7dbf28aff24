//! Global builder subcommand wrappers
//!
//! [`Builder`] holds the resolved path of the external build tool and
//! exposes one method per wrapped subcommand that takes no container
//! target. Each method declares its parameter grammar inline and forwards
//! through the grammar engine to the process runner, so the full CLI
//! surface reachable from the driver is visible in this file. Subcommands
//! operating on a stage's working container live on the stage handle.

use crate::errors::{Error, Result};
use crate::exec::{self, Runner};
use crate::grammar::{translate, Params, Schema};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the wrapped build tool; its location may be overridden with
/// `BUILDAH_PROG`.
pub const BUILDER_PROGRAM: &str = "buildah";

/// Handle on the external builder executable.
#[derive(Debug, Clone)]
pub struct Builder {
    program: PathBuf,
}

impl Builder {
    /// Locate the builder via the secured search path.
    pub fn new() -> Result<Self> {
        Ok(Builder {
            program: exec::locate(BUILDER_PROGRAM)?,
        })
    }

    /// Use an explicit builder executable. Intended for tests.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Builder {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub(crate) fn runner(&self, subcommand: &str, argv: Vec<String>) -> Runner<'static> {
        Runner::new(&self.program)
            .label(format!("{BUILDER_PROGRAM} {subcommand}"))
            .arg(subcommand)
            .args(argv)
    }

    /// `bud` — build from a containerfile, `args` naming the build context.
    pub fn bud(&self, params: Params, args: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            arg_flag: &["no-cache", "quiet", "rm", "squash"],
            arg_flag_str: &["tls-verify"],
            arg_str: &["authfile", "creds", "file", "format"],
            arg_array: &["build-arg", "tag", "volume"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.runner("bud", argv).args(args.iter().copied()).run()?;
        Ok(())
    }

    /// `containers` — list working containers, returning the raw listing.
    pub fn containers(&self, params: Params) -> Result<String> {
        const SCHEMA: Schema<'static> = Schema {
            arg_flag: &["all", "json", "noheading", "notruncate", "quiet"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        let out = self.runner("containers", argv).capture_output().run()?;
        Ok(out.stdout.unwrap_or_default())
    }

    /// `from` — create a working container from an image, returning the
    /// container name the builder prints.
    pub fn from(&self, params: Params, image: &str) -> Result<String> {
        const SCHEMA: Schema<'static> = Schema {
            arg_flag: &["quiet"],
            arg_flag_str: &["pull", "tls-verify"],
            arg_str: &["authfile", "cert-dir", "creds", "name"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        let out = self
            .runner("from", argv)
            .arg(image)
            .capture_output()
            .run()?;
        Ok(out.stdout.unwrap_or_default().trim().to_owned())
    }

    /// `info` — builder host/runtime details as parsed JSON.
    ///
    /// Parameters are accepted for call compatibility but ignored until a
    /// format selector is actually supported.
    pub fn info(&self, params: Params) -> Result<serde_json::Value> {
        if !params.is_empty() {
            debug!(?params, "ignoring info parameters");
        }
        let out = self
            .runner("info", Vec::new())
            .capture_output()
            .run()?;
        let text = out.stdout.unwrap_or_default();
        serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("cannot parse builder info output: {e}")))
    }

    /// `mount` — mount the named containers' roots, returning the builder's
    /// path listing.
    pub fn mount(&self, params: Params, containers: &[&str]) -> Result<String> {
        let (_, argv) = translate(&Schema::EMPTY, params)?;
        let out = self
            .runner("mount", argv)
            .args(containers.iter().copied())
            .capture_output()
            .run()?;
        Ok(out.stdout.unwrap_or_default())
    }

    /// `rm` — remove working containers; `all` removes every one and is
    /// exclusive.
    pub fn rm(&self, params: Params, names: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            exclusive: &["all"],
            arg_flag: &["all"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.runner("rm", argv).args(names.iter().copied()).run()?;
        Ok(())
    }

    /// Best-effort removal of a possibly-absent container. Used by the
    /// outer driver to clear stale state before creating a stage's
    /// container; a missing container is not an error.
    pub(crate) fn rm_stale(&self, name: &str) {
        let result = Runner::new(&self.program)
            .label(format!("{BUILDER_PROGRAM} rm (stale)"))
            .args(["rm", name])
            .suppress_output()
            .suppress_error()
            .on_nonzero(|_| Ok(()))
            .run();
        if let Err(err) = result {
            debug!(container = name, %err, "stale container removal skipped");
        }
    }

    /// `rmi` — remove images; `all` and `prune` are each exclusive.
    pub fn rmi(&self, params: Params, names: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            exclusive: &["all", "prune"],
            arg_flag: &["all", "force", "prune"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.runner("rmi", argv).args(names.iter().copied()).run()?;
        Ok(())
    }

    /// `tag` — apply additional names to `params.image` (required).
    pub fn tag(&self, params: Params, tags: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            extract: &["image"],
            ..Schema::EMPTY
        };
        let (mut extracted, argv) = translate(&SCHEMA, params)?;
        let image = extracted
            .remove("image")
            .and_then(|v| v.scalar_string())
            .ok_or_else(|| Error::contract("tag requires parameter 'image'"))?;
        self.runner("tag", argv)
            .arg(image)
            .args(tags.iter().copied())
            .run()?;
        Ok(())
    }

    /// `umount` — unmount container roots; `all` is exclusive.
    pub fn umount(&self, params: Params, containers: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            exclusive: &["all"],
            arg_flag: &["all"],
            ..Schema::EMPTY
        };
        let (_, argv) = translate(&SCHEMA, params)?;
        self.runner("umount", argv)
            .args(containers.iter().copied())
            .run()?;
        Ok(())
    }

    /// `unshare` — run `cmd` inside the user namespace with
    /// `params.container`'s root mounted. With `params.envname` the mount
    /// path is exported to the child under that variable; this is how the
    /// driver re-enters itself for a stage's inner phase.
    pub fn unshare(&self, params: Params, cmd: &[&str]) -> Result<()> {
        const SCHEMA: Schema<'static> = Schema {
            extract: &["container", "envname"],
            ..Schema::EMPTY
        };
        let (mut extracted, mut argv) = translate(&SCHEMA, params)?;
        let container = extracted
            .remove("container")
            .and_then(|v| v.scalar_string())
            .ok_or_else(|| Error::contract("unshare requires parameter 'container'"))?;
        let mount = match extracted.remove("envname").and_then(|v| v.scalar_string()) {
            Some(envname) => format!("{envname}={container}"),
            None => container,
        };
        argv.push("--mount".into());
        argv.push(mount);
        argv.push("--".into());
        self.runner("unshare", argv)
            .args(cmd.iter().copied())
            .run()?;
        Ok(())
    }
}
