//! Planner behavior observed through the binary
//!
//! Dependency validation runs before any builder invocation, so these
//! tests need no builder installed.

use assert_cmd::Command;
use predicates::str as pred_str;
use std::fs;
use tempfile::TempDir;

fn stagehand() -> Command {
    Command::cargo_bin("stagehand").unwrap()
}

#[test]
fn dependency_cycle_names_its_members() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("stagehand.yml"),
        concat!(
            "basename: cyc\n",
            "stages:\n",
            "  a:\n",
            "    from: img\n",
            "    consumes: [b]\n",
            "  b:\n",
            "    from: img\n",
            "    consumes: [a]\n",
        ),
    )
    .unwrap();
    stagehand()
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(pred_str::contains("cycle"))
        .stderr(pred_str::contains("a, b"));
}

#[test]
fn unknown_dependency_is_reported() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("stagehand.yml"),
        concat!(
            "basename: miss\n",
            "stages:\n",
            "  a:\n",
            "    from: img\n",
            "    depends: [ghost]\n",
        ),
    )
    .unwrap();
    stagehand()
        .current_dir(tmp.path())
        .assert()
        .failure()
        .stderr(pred_str::contains("unknown stage 'ghost'"));
}
