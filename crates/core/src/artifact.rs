//! Inter-stage artifact transfer
//!
//! A stage with `produces` archives those directories from its mounted
//! root into `<basename>_<stage>.tar.bz2` in the invocation's working
//! directory; a stage with `consumes` has each producer's archive exploded
//! into its container at `/` before its callback runs. The archiver is the
//! external `tar` program: `--preserve-permissions --sparse` plus bzip2
//! compression is the contract the consuming side relies on. An archive
//! newer than the driver executable and every recorded config file lets
//! the outer driver skip the producing stage entirely.

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::exec::{self, Runner};
use crate::grammar::Params;
use crate::stage::Stage;
use crate::value::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Archive file for one stage's output, in the working directory.
pub fn archive_path(cx: &Config, stage_name: &str) -> PathBuf {
    PathBuf::from(format!("{}_{}.tar.bz2", cx.basename(), stage_name))
}

/// Archive the stage's `produces` directories from its mounted root.
///
/// An existing archive is moved aside to `<archive>.bak` first. The
/// archiver's exit status 1 is accepted: overlay filesystems trip its
/// file-changed check spuriously.
pub fn produce(stage: &Stage) -> Result<()> {
    let dirs = match stage.get_produces()? {
        Some(dirs) if !dirs.is_empty() => dirs,
        _ => return Ok(()),
    };
    let cx = stage.configuration();
    let archive = archive_path(cx, stage.get_name());
    if archive.exists() {
        let backup = PathBuf::from(format!("{}.bak", archive.display()));
        debug!(archive = %archive.display(), "moving previous archive aside");
        fs::rename(&archive, &backup)?;
    }

    let mount = stage.get_mnt()?;
    let label = format!("archive {}", stage.get_name());
    let members = dirs.iter().map(|dir| dir.trim_start_matches('/'));
    Runner::new(exec::locate("tar")?)
        .label(label.clone())
        .args([
            "--create".to_owned(),
            "--bzip2".to_owned(),
            "--preserve-permissions".to_owned(),
            "--sparse".to_owned(),
            format!("--file={}", archive.display()),
            format!("--directory={}", mount.display()),
        ])
        .args(members)
        .on_nonzero(|status| {
            if status <= 1 {
                Ok(())
            } else {
                Err(Error::ExitStatus {
                    name: label.clone(),
                    status,
                })
            }
        })
        .run()?;
    info!(stage = stage.get_name(), archive = %archive.display(), "produced artifact");
    Ok(())
}

/// Prepare the stage's container for its callback: create the configured
/// user and group, then inject every consumed stage's archive at `/`.
pub fn consume(stage: &Stage) -> Result<()> {
    if let Some(user) = stage.get_user()? {
        create_user(stage, &user)?;
    }

    let consumes = match stage.get_consumes()? {
        Some(list) => list,
        None => return Ok(()),
    };
    let cx = stage.configuration();
    for producer in consumes {
        match cx.get_config(&["stages", &producer, "produces"])? {
            Some(Value::Seq(dirs)) if !dirs.is_empty() => {}
            _ => {
                return Err(Error::config(format!(
                    "stage '{}' consumes '{producer}', which produces nothing",
                    stage.get_name()
                )))
            }
        }
        let archive = archive_path(cx, &producer);
        if !archive.exists() {
            return Err(Error::Artifact {
                message: format!(
                    "missing input archive {} (consumed by stage '{}')",
                    archive.display(),
                    stage.get_name()
                ),
            });
        }
        debug!(stage = stage.get_name(), archive = %archive.display(), "injecting artifact");
        let archive = archive.display().to_string();
        stage.add(Params::new(), &[archive.as_str()], "/")?;
    }
    Ok(())
}

/// `true` when the stage's archive is newer than the driver executable and
/// every recorded configuration file. Stages without `produces` are never
/// fresh.
pub fn is_fresh(stage: &Stage) -> Result<bool> {
    match stage.get_produces()? {
        Some(dirs) if !dirs.is_empty() => {}
        _ => return Ok(false),
    }
    let cx = stage.configuration();
    let archive = archive_path(cx, stage.get_name());
    let archive_time = match modified(&archive) {
        Some(time) => time,
        None => return Ok(false),
    };

    let driver = std::env::current_exe()?;
    let mut inputs = vec![driver];
    inputs.extend(cx.config_files().iter().cloned());
    for input in inputs {
        match modified(&input) {
            Some(time) if archive_time > time => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|meta| meta.modified()).ok()
}

/// Parsed `name[=uid][:group[=gid]]` user directive.
#[derive(Debug, PartialEq, Eq)]
struct UserSpec {
    name: String,
    uid: Option<String>,
    group: Option<String>,
    gid: Option<String>,
}

fn parse_user_spec(input: &str) -> Result<UserSpec> {
    let (user_part, group_part) = match input.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (input, None),
    };
    let (name, uid) = split_id(user_part);
    let (group, gid) = match group_part {
        Some(part) => {
            let (group, gid) = split_id(part);
            (Some(group), gid)
        }
        None => (None, None),
    };
    if name.is_empty() || group_part.is_some_and(|g| g.is_empty()) {
        return Err(Error::config(format!(
            "malformed user directive '{input}', expected name[=uid][:group[=gid]]"
        )));
    }
    Ok(UserSpec {
        name,
        uid,
        group,
        gid,
    })
}

fn split_id(part: &str) -> (String, Option<String>) {
    match part.split_once('=') {
        Some((name, id)) => (name.to_owned(), Some(id.to_owned())),
        None => (part.to_owned(), None),
    }
}

/// Create the stage's group and user inside the container with the
/// vendor-neutral `groupadd`/`useradd` commands.
fn create_user(stage: &Stage, directive: &str) -> Result<()> {
    let spec = parse_user_spec(directive)?;

    if let Some(group) = &spec.group {
        let mut command = vec!["groupadd".to_owned()];
        if let Some(gid) = &spec.gid {
            command.push(format!("--gid={gid}"));
        }
        command.push(group.clone());
        stage.run(Params::new(), Value::from(command))?;
    }

    let mut command = vec!["useradd".to_owned()];
    if let Some(uid) = &spec.uid {
        command.push(format!("--uid={uid}"));
    }
    if let Some(group) = &spec.group {
        command.push(format!("--gid={group}"));
    }
    if let Some(home) = stage.get_user_home()? {
        command.push(format!("--home-dir={home}"));
    }
    command.push(spec.name);
    stage.run(Params::new(), Value::from(command))?;
    Ok(())
}
