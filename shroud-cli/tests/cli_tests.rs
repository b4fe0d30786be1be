use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn shroud() -> Command {
    Command::cargo_bin("shroud").unwrap()
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[test]
fn test_cli_help() {
    shroud()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("namespaces"));
}

#[test]
fn test_cli_version() {
    shroud()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("shroud"));
}

#[test]
fn test_invalid_command() {
    shroud().arg("invalid-command").assert().failure();
}

#[test]
fn test_run_requires_command() {
    shroud().args(["run", "--pid"]).assert().failure();
}

#[test]
fn test_plan_prints_json_steps() {
    shroud()
        .args(["plan", "--pid", "--fork", "--mount-proc"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"create_namespaces\""))
        .stdout(predicate::str::contains("\"fork\""))
        .stdout(predicate::str::contains("\"remount_proc_fs\""));
}

#[test]
fn test_plan_kill_child_forks() {
    shroud()
        .args(["plan", "--pid", "--kill-child=SIGTERM"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"set_parent_death_signal\""))
        .stdout(predicate::str::contains("\"signal\": 15"));
}

#[test]
fn test_plan_keep_caps() {
    shroud()
        .args(["plan", "--map-root-user", "--keep-caps"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"raise_ambient_caps\""));

    shroud()
        .args(["plan", "--pid", "--keep-caps"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("keep_caps requires"));
}

#[test]
fn test_plan_rejects_mount_proc_without_namespace_change() {
    shroud()
        .args(["plan", "--ipc", "--mount-proc"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("mount_proc requires"));
}

#[test]
fn test_plan_rejects_create_and_join() {
    shroud()
        .args(["plan", "--net", "--join", "net=/proc/self/ns/net"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("both created and joined"));
}

#[test]
fn test_join_binding_syntax() {
    shroud()
        .args(["plan", "--join", "/proc/self/ns/net"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("KIND=PATH"));
}

#[test]
fn test_plan_from_config_file() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(
        config,
        r#"{{
            "namespaces": ["uts"],
            "join": {{ "net": "/proc/self/ns/net" }},
            "hostname": "boxed"
        }}"#
    )
    .unwrap();

    shroud()
        .args(["plan", "--config"])
        .arg(config.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"join_namespace\""))
        .stdout(predicate::str::contains("\"set_hostname\""));
}

#[test]
fn test_config_rejects_unknown_fields() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{ "namspaces": ["uts"] }}"#).unwrap();

    shroud()
        .args(["plan", "--config"])
        .arg(config.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Invalid config"));
}

#[test]
fn test_namespaces_command() {
    shroud()
        .arg("namespaces")
        .assert()
        .success()
        .stdout(predicate::str::contains("Namespace Info:"));
}

#[test]
fn test_namespaces_missing_process() {
    shroud()
        .args(["namespaces", "--pid", "2147483647"])
        .assert()
        .code(1);
}

#[test]
fn test_run_without_isolation_execs_in_place() {
    shroud()
        .args(["run", "--", "/bin/sh", "-c", "exit 3"])
        .assert()
        .code(3);
}

#[test]
fn test_run_fork_reports_child_exit_code() {
    shroud()
        .args([
            "run",
            "--fork",
            "--",
            "/bin/sh",
            "-c",
            "echo hello; exit 4",
        ])
        .assert()
        .code(4)
        .stdout(predicate::str::contains("hello"));
}

#[test]
fn test_run_missing_program() {
    shroud()
        .args(["run", "--", "/nonexistent/program"])
        .assert()
        .code(127);
}

#[test]
fn test_run_unprivileged_create_fails() {
    if is_root() {
        return;
    }

    shroud()
        .args(["run", "--net", "--", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("create-namespaces"));
}

#[test]
#[ignore] // Requires root
fn test_run_pid_namespace_with_proc() {
    shroud()
        .args([
            "run",
            "--pid",
            "--fork",
            "--mount-proc",
            "--",
            "/bin/sh",
            "-c",
            "echo $$",
        ])
        .assert()
        .success()
        .stdout(predicate::str::diff("1\n"));
}

#[test]
#[ignore] // Requires root
fn test_run_hostname() {
    shroud()
        .args([
            "run",
            "--uts",
            "--hostname",
            "shroud-box",
            "--",
            "hostname",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("shroud-box"));
}
