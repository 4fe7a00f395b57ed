//! Run audit log: one JSON line per lifecycle event, appended to
//! `logs/internal/runs.jsonl` in the project's data directory. Failures to
//! write are logged and ignored — auditing never breaks a launch.

use std::fs::OpenOptions;
use std::io::Write;

use chrono::Utc;
use serde_json::json;

use devsandbox_core::SandboxIdentity;

pub fn run_started(identity: &SandboxIdentity, command: &[String], fingerprint: &str) {
    append(
        identity,
        json!({
            "ts": Utc::now().to_rfc3339(),
            "event": "run_started",
            "project": identity.project_dir,
            "command": command,
            "policy_fingerprint": fingerprint,
        }),
    );
}

pub fn run_finished(identity: &SandboxIdentity, exit_code: i32) {
    append(
        identity,
        json!({
            "ts": Utc::now().to_rfc3339(),
            "event": "run_finished",
            "project": identity.project_dir,
            "exit_code": exit_code,
        }),
    );
}

fn append(identity: &SandboxIdentity, record: serde_json::Value) {
    let path = identity.internal_log_dir().join("runs.jsonl");
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| writeln!(file, "{record}"));
    if let Err(e) = result {
        tracing::debug!("audit log write failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn events_append_json_lines() {
        let tmp = tempfile::TempDir::new().unwrap();
        let identity = SandboxIdentity::resolve_in(Path::new("/home/dev/api"), tmp.path());
        identity.ensure_layout().unwrap();

        run_started(&identity, &["echo".into(), "hello".into()], "abc123");
        run_finished(&identity, 0);

        let content =
            std::fs::read_to_string(identity.internal_log_dir().join("runs.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "run_started");
        assert_eq!(first["policy_fingerprint"], "abc123");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["exit_code"], 0);
    }
}
