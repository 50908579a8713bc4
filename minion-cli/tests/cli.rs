use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// A small Python project: one module, one test that imports it.
fn shop() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(root, "app/__init__.py", "");
    write(root, "app/db.py", "class Database:\n    pass\n");
    write(
        root,
        "app/cart.py",
        "from app.db import Database\n\ndef total(items):\n    return sum(items)\n",
    );
    write(
        root,
        "tests/test_cart.py",
        "from app.cart import total\n\ndef test_total():\n    assert total([1, 2]) == 3\n",
    );
    dir
}

/// Gates that always pass, run in host-local sandboxes.
fn passing_gates(root: &Path) {
    write(
        root,
        ".minion/config.toml",
        r#"
[sandbox]
backend = "local"
pool_target = 1
pool_max = 1

[gates]
lint_command = "true"
test_command = "true"
full_suite_command = "true"

[publisher]
kind = "dry-run"
"#,
    );
}

fn minion() -> Command {
    let mut cmd = Command::cargo_bin("minion").unwrap();
    cmd.env_remove("ANTHROPIC_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("LLM_BACKEND")
        .env_remove("MAX_RETRIES")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn config_prints_defaults() {
    let repo = shop();
    minion()
        .args(["config", "--repo"])
        .arg(repo.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retries = 2"))
        .stdout(predicate::str::contains("[sandbox]"));
}

#[test]
fn config_rejects_raised_retry_cap() {
    let repo = shop();
    write(repo.path(), ".minion/config.toml", "[orchestrator]\nmax_retries = 5\n");
    minion()
        .args(["config", "--repo"])
        .arg(repo.path())
        .assert()
        .code(2)
        .stderr(predicate::str::contains("allow_retry_override"));
}

#[test]
fn missing_repository_exits_3() {
    minion()
        .args(["run", "--repo", "/definitely/not/here", "--task", "Fix it"])
        .assert()
        .code(3);
}

#[test]
fn affected_tests_follow_imports() {
    let repo = shop();
    minion()
        .args(["affected-tests", "--repo"])
        .arg(repo.path())
        .arg("app/db.py")
        .assert()
        .success()
        .stdout(predicate::str::contains("tests/test_cart.py"));
}

#[test]
fn context_lists_dependencies_first() {
    let repo = shop();
    let output = minion()
        .args(["context", "--repo"])
        .arg(repo.path())
        .arg("app/cart.py")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    let db = stdout.find("app/db.py").unwrap();
    let cart = stdout.find("app/cart.py").unwrap();
    assert!(db < cart, "dependency should come first:\n{stdout}");
}

#[test]
fn unknown_file_is_rejected() {
    let repo = shop();
    minion()
        .args(["context", "--repo"])
        .arg(repo.path())
        .arg("app/missing.py")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a source file"));
}

#[test]
fn plan_for_unknown_task_fails() {
    let repo = shop();
    minion()
        .args(["plan", "--repo"])
        .arg(repo.path())
        .arg("minion-00000000")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No plan recorded"));
}

#[test]
fn simulated_run_writes_a_dry_run_proposal() {
    let repo = shop();
    passing_gates(repo.path());

    minion()
        .args(["run", "--backend", "simulated", "--repo"])
        .arg(repo.path())
        .args(["--task", "Tidy the cart total", "--file", "app/cart.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("succeeded"))
        .stdout(predicate::str::contains("file://"));

    let proposals = std::fs::read_dir(repo.path().join(".minion/proposals"))
        .unwrap()
        .count();
    assert_eq!(proposals, 1);
}

#[test]
fn failing_gates_escalate_with_exit_9() {
    let repo = shop();
    write(
        repo.path(),
        ".minion/config.toml",
        r#"
[sandbox]
backend = "local"
pool_target = 1
pool_max = 1

[gates]
lint_command = "true"
test_command = "echo 'FAILED tests/test_cart.py::test_total' && false"
full_suite_command = "false"
"#,
    );

    minion()
        .args(["run", "--backend", "simulated", "--dry-run", "--repo"])
        .arg(repo.path())
        .args(["--task", "Tidy the cart total", "--file", "app/cart.py"])
        .assert()
        .code(9)
        .stdout(predicate::str::contains("escalated"));

    let state = repo.path().join(".minion/state");
    let task_dir = std::fs::read_dir(&state).unwrap().next().unwrap().unwrap().path();
    assert!(task_dir.join("escalation.json").is_file());
}
