use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use time::OffsetDateTime;

use crate::engine::{CaseReport, RunReport, RunSummary};

const MAX_CMD_OUTPUT_BYTES: usize = 64 * 1024;

#[derive(Debug, Serialize)]
struct RunLog<'a> {
    schema_version: &'static str,
    tool_version: &'a str,
    command: &'static str,
    started_at: &'a str,
    finished_at: &'a str,
    status: &'static str,
    options: &'a RunLogOptions,
    summary: &'a RunSummary,
    cases: Vec<CaseLog<'a>>,
}

/// Flags of the `run` invocation, recorded as given.
#[derive(Debug, Clone, Serialize)]
pub struct RunLogOptions {
    pub long: bool,
    pub latest: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    pub bless: bool,
    pub timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct CaseLog<'a> {
    module: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    test: Option<&'a str>,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sections: Vec<SectionLog<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    workspace: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    notes: &'a [String],
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct SectionLog<'a> {
    label: &'a str,
    text: String,
}

/// Writes `run-<pid>-<ts>.json` into `dir` and returns its path.
pub fn write_run_log(
    dir: &Path,
    report: &RunReport,
    options: &RunLogOptions,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory: {}", dir.display()))?;

    let pid = std::process::id();
    let ts = OffsetDateTime::now_utc().unix_timestamp_nanos();
    let path = dir.join(format!("run-{pid}-{ts}.json"));

    let log = RunLog {
        schema_version: "1.0",
        tool_version: &report.tool_version,
        command: "run",
        started_at: &report.started_at,
        finished_at: &report.finished_at,
        status: if report.has_failures() { "failed" } else { "ok" },
        options,
        summary: &report.summary,
        cases: report.cases.iter().map(case_log).collect(),
    };

    let buf = serde_json::to_vec_pretty(&log).context("failed to serialize run log (JSON)")?;
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write run log: {}", path.display()))?;
    Ok(path)
}

fn case_log(case: &CaseReport) -> CaseLog<'_> {
    CaseLog {
        module: &case.module,
        test: case.test.as_deref(),
        status: case.status.as_str(),
        message: case.message.as_deref(),
        sections: case
            .sections
            .iter()
            .map(|s| SectionLog {
                label: &s.label,
                text: truncate_string(&s.text, MAX_CMD_OUTPUT_BYTES),
            })
            .collect(),
        workspace: case.workspace.as_deref(),
        notes: &case.notes,
        duration_ms: case.duration_ms,
    }
}

fn truncate_string(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut idx = max_bytes;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx = idx.saturating_sub(1);
    }
    let head = &s[..idx];
    format!("{head}\n...(truncated, total={} bytes)", s.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CaseStatus, Section};
    use std::sync::atomic::{AtomicU64, Ordering};

    fn report(stderr: String) -> RunReport {
        RunReport {
            schema_version: "1.0".to_string(),
            tool_version: "0.1.0".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            finished_at: "2026-01-01T00:00:05Z".to_string(),
            summary: RunSummary {
                errors: 1,
                ..RunSummary::default()
            },
            cases: vec![CaseReport {
                module: "example.com/acme/lib".to_string(),
                test: Some("v1.2.0".to_string()),
                status: CaseStatus::Error,
                message: Some("tool under test failed: exit status 20".to_string()),
                sections: vec![
                    Section {
                        label: "stdout".to_string(),
                        text: String::new(),
                    },
                    Section {
                        label: "stderr".to_string(),
                        text: stderr,
                    },
                ],
                workspace: None,
                notes: vec!["no go.mod upstream; synthesized".to_string()],
                duration_ms: 42,
            }],
        }
    }

    #[test]
    fn run_log_records_cases_and_truncates_streams() {
        static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

        let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "portcheck-log-test-{}-{seq}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);

        let big = "é".repeat(MAX_CMD_OUTPUT_BYTES);
        let options = RunLogOptions {
            long: false,
            latest: true,
            filter: None,
            bless: false,
            timeout_secs: 1800,
            config_path: Some("/work/portcheck.toml".to_string()),
        };
        let path = write_run_log(&dir, &report(big), &options).expect("write log");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("run-{}-", std::process::id())));
        assert!(name.ends_with(".json"));

        let v: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read log")).expect("json");
        assert_eq!(v["command"], "run");
        assert_eq!(v["status"], "failed");
        assert_eq!(v["options"]["latest"], true);
        assert!(v["options"].get("filter").is_none());
        assert_eq!(v["summary"]["errors"], 1);
        assert_eq!(v["cases"][0]["status"], "error");
        assert_eq!(v["cases"][0]["notes"][0], "no go.mod upstream; synthesized");
        let stderr = v["cases"][0]["sections"][1]["text"].as_str().unwrap();
        assert!(stderr.ends_with(&format!(
            "...(truncated, total={} bytes)",
            MAX_CMD_OUTPUT_BYTES * 2
        )));
        assert!(stderr.len() < MAX_CMD_OUTPUT_BYTES + 64);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
