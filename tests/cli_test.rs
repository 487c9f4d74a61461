use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("taskherd.yml");
    let yaml = format!(
        "store: {}\nlog_dir: {}\n{}",
        dir.join("tasks.json").display(),
        dir.join("logs").display(),
        body
    );
    std::fs::write(&path, yaml).unwrap();
    path
}

fn valid_config(dir: &Path) -> PathBuf {
    write_config(dir, "modules:\n  1: \"python3 detect.py\"\n")
}

fn taskherd(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("taskherd").unwrap();
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn test_submit_prints_ids_and_list_shows_queue() {
    let dir = TempDir::new().unwrap();
    let config = valid_config(dir.path());

    taskherd(&config)
        .args(["submit", "--type", "1", "--creator", "alice"])
        .assert()
        .success()
        .stdout("1\n");
    taskherd(&config)
        .args(["submit", "--type", "1", "--params", r#"{"video": "cam3.mp4"}"#])
        .assert()
        .success()
        .stdout("2\n");

    taskherd(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("WAITING #1"))
        .stdout(predicate::str::contains("WAITING #2"))
        .stdout(predicate::str::contains("waiting: 2"));
}

#[test]
fn test_report_marks_task_finished() {
    let dir = TempDir::new().unwrap();
    let config = valid_config(dir.path());
    taskherd(&config)
        .args(["submit", "--type", "1"])
        .assert()
        .success();

    taskherd(&config)
        .args(["report", "1", "--finished", "--message", "42 objects found"])
        .assert()
        .success();

    taskherd(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("FINISHED"))
        .stdout(predicate::str::contains("42 objects found"))
        .stdout(predicate::str::contains("finished: 1"));
}

#[test]
fn test_report_unknown_task_fails() {
    let dir = TempDir::new().unwrap();
    let config = valid_config(dir.path());

    taskherd(&config)
        .args(["report", "99", "--failed"])
        .assert()
        .code(1);
}

#[test]
fn test_report_without_fields_fails() {
    let dir = TempDir::new().unwrap();
    let config = valid_config(dir.path());
    taskherd(&config)
        .args(["submit", "--type", "1"])
        .assert()
        .success();

    taskherd(&config).args(["report", "1"]).assert().code(1);
}

#[test]
fn test_invalid_params_rejected() {
    let dir = TempDir::new().unwrap();
    let config = valid_config(dir.path());

    taskherd(&config)
        .args(["submit", "--type", "1", "--params", "{not json"])
        .assert()
        .code(1);
    assert!(!dir.path().join("tasks.json").exists());
}

#[test]
fn test_config_without_modules_exits_with_config_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "task_limit: 10\n");

    taskherd(&config)
        .arg("list")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("no modules configured"));
}

#[test]
fn test_unknown_template_placeholder_exits_with_config_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(
        dir.path(),
        "command_template: \"{module} --priority {priority}\"\nmodules:\n  1: \"run.sh\"\n",
    );

    taskherd(&config).arg("list").assert().code(2);
}

#[test]
fn test_missing_config_file_exits_with_config_code() {
    let dir = TempDir::new().unwrap();

    taskherd(&dir.path().join("absent.yml"))
        .arg("list")
        .assert()
        .code(2);
}
