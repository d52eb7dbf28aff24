//! Top-level pipeline orchestration
//!
//! The driver program hands its [`InitConfig`] to [`run`], which parses
//! the process arguments and branches on mode. The *outer* mode plans the
//! stage order and, per stage, creates the working container and re-enters
//! the driver executable inside the builder's user namespace. That inner
//! invocation — recognizable by `--internal=<stage>` — sees the mounted
//! container root and performs the stage's actual work: pre-callback,
//! artifact consumption, the build callback, artifact production.
//!
//! Both modes redirect standard output and error into per-stage log files
//! under `log-<basename>/<timestamp>/`; the guard restores the streams on
//! every exit path, and a failing stage is reported as
//! `"<basename> failed: …"` on the restored standard error.

use crate::artifact;
use crate::builder::Builder;
use crate::config::{Config, InitConfig};
use crate::errors::{Error, Result};
use crate::grammar::{params, Params};
use crate::logging::{self, StreamRedirect};
use crate::plan;
use crate::stage::Stage;
use crate::value::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Environment variable through which the builder's `unshare` hands the
/// container mount path to the inner invocation.
pub const MOUNT_ENV: &str = "BUILDAHUTIL_MOUNT";

/// Parsed driver arguments.
#[derive(Debug)]
struct Invocation {
    config_path: Option<PathBuf>,
    debug: i64,
    internal: Option<String>,
    opts: Map,
    argv: Vec<String>,
}

/// Drive the pipeline described by `init` to completion.
///
/// This is the whole driver: argument parsing, configuration loading, and
/// outer or inner execution. Returns the first fatal error; the caller
/// exits nonzero on `Err`.
pub fn run(init: InitConfig) -> Result<()> {
    run_with_args(init, std::env::args().collect())
}

pub(crate) fn run_with_args(init: InitConfig, argv: Vec<String>) -> Result<()> {
    let invocation = parse_args(&init, &argv)?;
    logging::init(invocation.debug);

    let config_path = resolve_config_path(&init, invocation.config_path.clone())?;
    let mut cx = Config::load(init, config_path.as_deref())?;
    cx.set_debug(invocation.debug);
    cx.set_argv(invocation.argv.clone());
    cx.set_opts(invocation.opts.clone());
    cx.required_config(&["basename", "stages"])?;
    let cx = Arc::new(cx);

    match invocation.internal.clone() {
        Some(stage) => run_inner(&cx, &stage),
        None => run_outer(&cx, &invocation, config_path.as_deref()),
    }
}

fn parse_args(init: &InitConfig, argv: &[String]) -> Result<Invocation> {
    let mut command = clap::Command::new(init.basename().to_owned())
        .about("stage-oriented container image build driver")
        .arg(
            clap::Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("structured configuration file (defaults to <basename>.yml)"),
        )
        .arg(
            clap::Arg::new("debug")
                .long("debug")
                .value_name("N")
                .value_parser(clap::value_parser!(i64))
                .default_value("0")
                .help("debug verbosity, 0 is silent"),
        )
        .arg(
            clap::Arg::new("internal")
                .long("internal")
                .value_name("STAGE")
                .hide(true)
                .help("run the inner phase for one stage"),
        );
    for opt in init.added_opts() {
        command = command.arg(
            clap::Arg::new(opt.name.clone())
                .long(opt.name.clone())
                .value_name("VALUE")
                .help(opt.help.clone()),
        );
    }

    let matches = match command.try_get_matches_from(argv) {
        Ok(matches) => matches,
        Err(err)
            if matches!(
                err.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            err.exit()
        }
        Err(err) => return Err(Error::config(err.to_string())),
    };

    let mut opts = Map::new();
    for opt in init.added_opts() {
        if let Some(value) = matches.get_one::<String>(&opt.name) {
            opts.insert(opt.name.clone(), Value::Str(value.clone()));
        }
    }

    Ok(Invocation {
        config_path: matches.get_one::<String>("config").map(PathBuf::from),
        debug: matches.get_one::<i64>("debug").copied().unwrap_or(0),
        internal: matches.get_one::<String>("internal").cloned(),
        opts,
        argv: argv.to_vec(),
    })
}

/// An explicitly named config file must exist; otherwise the conventional
/// `<basename>.yml` / `<basename>.yaml` candidates are probed.
fn resolve_config_path(init: &InitConfig, explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        return Ok(Some(path));
    }
    if let Some(path) = init.default_config() {
        return Ok(Some(path.to_path_buf()));
    }
    for candidate in [
        format!("{}.yml", init.basename()),
        format!("{}.yaml", init.basename()),
    ] {
        let candidate = PathBuf::from(candidate);
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn log_dir(cx: &Config) -> PathBuf {
    PathBuf::from(format!("log-{}", cx.basename())).join(cx.timestamp_str())
}

fn point_current_symlink(log_root: &Path, timestamp: &str) -> Result<()> {
    let link = log_root.join("current");
    if fs::symlink_metadata(&link).is_ok() {
        fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(timestamp, &link)?;
    Ok(())
}

fn run_outer(cx: &Arc<Config>, invocation: &Invocation, config_path: Option<&Path>) -> Result<()> {
    let order = plan::build_order(cx)?;
    if order.is_empty() {
        info!("no stages to build");
        return Ok(());
    }
    debug!(order = ?order.stages(), "planned build order");

    let builder = Builder::new()?;
    let log_root = PathBuf::from(format!("log-{}", cx.basename()));
    let log_dir = log_dir(cx);
    fs::create_dir_all(&log_dir)?;
    point_current_symlink(&log_root, cx.timestamp_str())?;
    let driver = std::env::current_exe()?;

    for name in order.stages() {
        if let Err(err) = outer_stage(cx, &builder, name, &log_dir, &driver, invocation, config_path)
        {
            eprintln!("{} failed: {err}", cx.basename());
            return Err(err);
        }
    }
    Ok(())
}

fn outer_stage(
    cx: &Arc<Config>,
    builder: &Builder,
    name: &str,
    log_dir: &Path,
    driver: &Path,
    invocation: &Invocation,
    config_path: Option<&Path>,
) -> Result<()> {
    let stage = Stage::new(cx.clone(), name, None)?;
    if artifact::is_fresh(&stage)? {
        info!(stage = name, "skip (archive up to date)");
        return Ok(());
    }
    info!(stage = name, "begin");

    let redirect = StreamRedirect::to_file(&log_dir.join(name))?;
    let result = drive_stage(builder, &stage, driver, invocation, config_path);
    drop(redirect);
    result?;

    info!(stage = name, "end");
    Ok(())
}

/// The outer half of one stage: fresh container, namespace re-entry for
/// the inner half, then commit/tag and cleanup.
fn drive_stage(
    builder: &Builder,
    stage: &Stage,
    driver: &Path,
    invocation: &Invocation,
    config_path: Option<&Path>,
) -> Result<()> {
    let container = stage.container_name();
    builder.rm_stale(container);

    let image = stage.get_from()?;
    builder.from(params([("name", Value::from(container))]), &image)?;

    let mut command = vec![
        driver.display().to_string(),
        format!("--internal={}", stage.get_name()),
    ];
    if invocation.debug != 0 {
        command.push(format!("--debug={}", invocation.debug));
    }
    if let Some(path) = config_path {
        command.push(format!("--config={}", path.display()));
    }
    let command: Vec<&str> = command.iter().map(String::as_str).collect();
    builder.unshare(
        params([
            ("container", Value::from(container)),
            ("envname", Value::from(MOUNT_ENV)),
        ]),
        &command,
    )?;

    if let Some(images) = stage.get_commit()? {
        if let Some((first, rest)) = images.split_first() {
            stage.commit(Params::new(), first)?;
            if !rest.is_empty() {
                let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
                builder.tag(params([("image", Value::from(first.as_str()))]), &rest)?;
            }
        }
    }

    builder.rm(Params::new(), &[container])?;
    Ok(())
}

fn run_inner(cx: &Arc<Config>, name: &str) -> Result<()> {
    let mount = std::env::var(MOUNT_ENV)
        .ok()
        .filter(|mount| !mount.is_empty())
        .ok_or_else(|| {
            Error::config(format!(
                "{MOUNT_ENV} is not set; --internal is entered through the outer driver"
            ))
        })?;

    let log_dir = log_dir(cx);
    fs::create_dir_all(&log_dir)?;
    let redirect = StreamRedirect::to_file(&log_dir.join(format!("{name}-internal")))?;
    let result = inner_stage(cx, name, PathBuf::from(mount));
    drop(redirect);

    if let Err(ref err) = result {
        eprintln!("{} failed: {err}", cx.basename());
    }
    result
}

/// The inner half of one stage, already inside the namespace:
/// `func_deps → consume → func_exec → produce`.
fn inner_stage(cx: &Arc<Config>, name: &str, mount: PathBuf) -> Result<()> {
    info!(stage = name, "inner phase begin");
    let stage = Stage::new(cx.clone(), name, Some(mount))?;
    if let Some(deps_fn) = stage.get_func_deps() {
        deps_fn(&stage)?;
    }
    artifact::consume(&stage)?;
    let exec_fn = stage.get_func_exec()?;
    exec_fn(&stage)?;
    artifact::produce(&stage)?;
    info!(stage = name, "inner phase end");
    Ok(())
}
