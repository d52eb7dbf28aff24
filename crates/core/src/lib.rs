//! Core engine for stage-oriented container image builds
//!
//! This crate drives an external rootless image builder (buildah) through
//! a pipeline of *stages*. Each stage creates a working container from a
//! base image and runs a user callback *inside* the builder's mount
//! namespace, with the container root visible as an ordinary directory.
//! Stages hand artifacts to each other as tar archives, are planned in
//! dependency order, and may commit their container to image names when
//! they finish.
//!
//! A driver program declares its stages in an [`config::InitConfig`] and
//! calls [`orchestrator::run`]; everything else — argument parsing, the
//! configuration tree with template expansion, outer/inner two-phase
//! execution, artifact transfer, and per-stage logging — lives here.

pub mod artifact;
pub mod builder;
pub mod config;
pub mod errors;
pub mod exec;
pub mod grammar;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod stage;
pub mod template;
pub mod value;

pub use config::{Config, InitConfig, StageSpec};
pub use errors::{Error, Result};
pub use grammar::{params, Params};
pub use stage::Stage;
pub use value::Value;
