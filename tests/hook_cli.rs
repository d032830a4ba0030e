use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn taskwing_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_taskwing"));
    cmd.env_remove("TASKWING_MEMORY_DIR").env_remove("TASKWING_LOG");
    cmd
}

fn seed_repo(root: &Path) {
    fs::write(
        root.join("Cargo.toml"),
        "[package]\nname = \"demo\"\nversion = \"0.1.0\"\nedition = \"2021\"\n",
    )
    .expect("seed manifest");
}

fn run(root: &Path, args: &[&str]) -> Output {
    taskwing_bin()
        .args(args)
        .arg("--root")
        .arg(root)
        .output()
        .expect("run taskwing")
}

fn stdout_json(out: &Output) -> serde_json::Value {
    let text = String::from_utf8_lossy(&out.stdout);
    serde_json::from_str(text.trim()).unwrap_or_else(|e| panic!("not JSON ({e}): {text}"))
}

#[test]
fn circuit_breaker_approves_and_leaves_session_alone() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_repo(tmp.path());
    let memory = tmp.path().join(".taskwing/memory");
    fs::create_dir_all(&memory).expect("memory dir");
    let session = serde_json::json!({
        "session_id": "3f1c2a9e-0000-4000-8000-000000000001",
        "started_at": chrono::Utc::now().to_rfc3339(),
        "tasks_started": 5,
        "tasks_completed": 5,
    })
    .to_string();
    let path = memory.join("hook_session.json");
    fs::write(&path, &session).expect("seed session");

    let out = run(tmp.path(), &["hook", "continue-check"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let decision = stdout_json(&out);
    assert_eq!(decision["decision"], "approve");
    let reason = decision["reason"].as_str().unwrap();
    assert!(reason.starts_with("Circuit breaker: Completed 5/5 tasks"), "{reason}");
    assert_eq!(fs::read_to_string(&path).unwrap(), session);
}

#[test]
fn continue_check_without_plan_approves() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_repo(tmp.path());

    let out = run(tmp.path(), &["hook", "continue-check"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let decision = stdout_json(&out);
    assert_eq!(decision["decision"], "approve");
    assert_eq!(decision["reason"], "No active plan.");
    assert!(decision.get("context").is_none());
    assert!(tmp.path().join(".taskwing/memory/hook_session.json").exists());
}

#[test]
fn session_end_removes_the_file() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_repo(tmp.path());

    let init = run(tmp.path(), &["hook", "session-init"]);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    assert!(String::from_utf8_lossy(&init.stdout).contains("No active plan"));

    let end = run(tmp.path(), &["hook", "session-end", "--json"]);
    assert!(end.status.success(), "{}", String::from_utf8_lossy(&end.stderr));
    assert_eq!(stdout_json(&end)["tasks_completed"], 0);
    assert!(!tmp.path().join(".taskwing/memory/hook_session.json").exists());
}

#[test]
fn unknown_task_reports_json_envelope() {
    let tmp = tempfile::tempdir().expect("tempdir");
    seed_repo(tmp.path());

    let out = run(tmp.path(), &["task", "start", "no-such-task", "--json"]);
    assert!(!out.status.success());
    let envelope = stdout_json(&out);
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["kind"], "not_found");
}
