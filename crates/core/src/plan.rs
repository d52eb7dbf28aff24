//! Build-order planning
//!
//! Stages depend on each other through `consumes` (artifact flow) and
//! `depends` (ordering only). The planner validates every reference,
//! then runs Kahn's algorithm over the union of both relations with a
//! sorted ready-set, so equal-depth stages always come out in name order
//! and the whole order is deterministic. Residual nodes after exhaustion
//! are a dependency cycle and fatal.

use crate::config::Config;
use crate::errors::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// A dependency-consistent stage order plus a position index.
#[derive(Debug, Clone)]
pub struct BuildOrder {
    order: Vec<String>,
    index: BTreeMap<String, usize>,
}

impl BuildOrder {
    /// Stages in execution order.
    pub fn stages(&self) -> &[String] {
        &self.order
    }

    /// Position of a stage within the order.
    pub fn position(&self, stage: &str) -> Option<usize> {
        self.index.get(stage).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Compute the build order for every configured stage.
pub fn build_order(cx: &Config) -> Result<BuildOrder> {
    let names = cx.stage_names()?;
    let stage_set: BTreeSet<&str> = names.iter().map(String::as_str).collect();

    // deps(s) = consumes(s) ∪ depends(s), validated against the stage set
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    let mut successors: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &names {
        let mut merged = BTreeSet::new();
        for key in ["consumes", "depends"] {
            if let Some(listed) = stage_list(cx, name, key)? {
                for dep in listed {
                    if !stage_set.contains(dep.as_str()) {
                        return Err(Error::config(format!(
                            "stage '{name}' {key} unknown stage '{dep}'"
                        )));
                    }
                    merged.insert(dep);
                }
            }
        }
        indegree.insert(name.clone(), merged.len());
        for dep in merged {
            successors.entry(dep).or_default().push(name.clone());
        }
    }

    let mut ready: BTreeSet<String> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        if let Some(followers) = successors.get(&next) {
            for follower in followers {
                if let Some(degree) = indegree.get_mut(follower) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(follower.clone());
                    }
                }
            }
        }
        order.push(next);
    }

    if order.len() != names.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let cycle: Vec<&str> = names
            .iter()
            .map(String::as_str)
            .filter(|name| !placed.contains(name))
            .collect();
        return Err(Error::Cycle {
            members: cycle.join(", "),
        });
    }

    let index = order
        .iter()
        .enumerate()
        .map(|(position, name)| (name.clone(), position))
        .collect();
    Ok(BuildOrder { order, index })
}

fn stage_list(cx: &Config, stage: &str, key: &str) -> Result<Option<Vec<String>>> {
    match cx.get_config(&["stages", stage, key])? {
        None => Ok(None),
        Some(value) if value.is_scalar() => Ok(Some(vec![value
            .scalar_string()
            .unwrap_or_default()])),
        Some(crate::value::Value::Seq(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(item.scalar_string().ok_or_else(|| {
                    Error::config(format!(
                        "stage '{stage}': '{key}' elements must be stage names"
                    ))
                })?);
            }
            Ok(Some(out))
        }
        Some(other) => Err(Error::config(format!(
            "stage '{stage}': '{key}' must be a sequence, got {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{timestamp_env_var, Config, InitConfig, StageSpec};
    use serial_test::serial;

    fn noop() -> StageSpec {
        StageSpec::new("img").exec_fn(|_| Ok(()))
    }

    fn load(init: InitConfig) -> Config {
        let basename = init.basename().to_owned();
        let cx = Config::load(init, None).unwrap();
        std::env::remove_var(timestamp_env_var(&basename));
        cx
    }

    #[test]
    #[serial]
    fn dependencies_precede_dependents() {
        let cx = load(
            InitConfig::new("t")
                .stage("runtime", noop().consumes(["build"]))
                .stage("build", noop())
                .stage("docs", noop().depends(["runtime"])),
        );
        let plan = build_order(&cx).unwrap();
        assert_eq!(plan.stages(), ["build", "runtime", "docs"]);
        for stage in ["runtime", "docs"] {
            let deps: &[&str] = match stage {
                "runtime" => &["build"],
                _ => &["runtime"],
            };
            for dep in deps {
                assert!(plan.position(dep).unwrap() < plan.position(stage).unwrap());
            }
        }
    }

    #[test]
    #[serial]
    fn equal_depth_stages_come_out_lexicographically() {
        let cx = load(
            InitConfig::new("t")
                .stage("zeta", noop())
                .stage("alpha", noop())
                .stage("mid", noop()),
        );
        let plan = build_order(&cx).unwrap();
        assert_eq!(plan.stages(), ["alpha", "mid", "zeta"]);
    }

    #[test]
    #[serial]
    fn two_stage_cycle_is_reported_with_members() {
        let cx = load(
            InitConfig::new("t")
                .stage("a", noop().consumes(["b"]))
                .stage("b", noop().consumes(["a"])),
        );
        let err = build_order(&cx).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains('a') && message.contains('b'));
    }

    #[test]
    #[serial]
    fn self_cycle_is_reported() {
        let cx = load(InitConfig::new("t").stage("a", noop().depends(["a"])));
        assert!(matches!(build_order(&cx), Err(Error::Cycle { .. })));
    }

    #[test]
    #[serial]
    fn unknown_reference_is_a_config_error() {
        let cx = load(InitConfig::new("t").stage("a", noop().consumes(["ghost"])));
        let err = build_order(&cx).unwrap_err();
        assert!(err.to_string().contains("unknown stage 'ghost'"));
    }

    #[test]
    #[serial]
    fn empty_stage_map_gives_empty_order() {
        let cx = load(InitConfig::new("t"));
        let plan = build_order(&cx).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    #[serial]
    fn consumes_and_depends_are_unioned() {
        let cx = load(
            InitConfig::new("t")
                .stage("base", noop())
                .stage("lib", noop().depends(["base"]))
                .stage("app", noop().consumes(["lib"]).depends(["base"])),
        );
        let plan = build_order(&cx).unwrap();
        assert_eq!(plan.stages(), ["base", "lib", "app"]);
    }
}
