use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::config::EffectiveConfig;
use crate::core::{ActionList, ToolError};
use crate::platform::{self, Budget, CommandOutput, CommandRunOptions};
use crate::rules::{self, PortError, PortRequest, RewriteEngine};

/// Presence of this variable at start-up selects harness mode, with every
/// positional argument taken as a build target.
pub const TEST_RUN_ENV: &str = "PORTCHECK_TEST_RUN";

/// Hidden subcommand the driver uses to re-invoke itself.
pub const SUBCOMMAND: &str = "harness-port";

/// Harness mode: port `targets` in `workspace_root` and write the action
/// document to `out`. Returns the process exit code.
pub fn run_harness_mode(
    cfg: &EffectiveConfig,
    workspace_root: &Path,
    targets: Vec<String>,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> i32 {
    let engine = match RewriteEngine::new(&cfg.engine) {
        Ok(engine) => engine,
        Err(e) => return report_internal(err, &PortError::Internal(e)),
    };
    let req = PortRequest {
        workspace_root: workspace_root.to_path_buf(),
        targets,
    };

    let (list, result) = rules::port(&engine, &req);
    if let Err(e @ PortError::Internal(_)) = &result {
        return report_internal(err, e);
    }

    if let Err(e) = write_document(out, &list) {
        let _ = writeln!(err, "portcheck: unable to write action document: {e:#}");
        return crate::exit::ExitCode::ExternalCommandFailed.as_i32();
    }
    if let Err(e) = &result {
        let _ = write_tool_error(err, &e.to_tool_error());
    }
    crate::exit::ExitCode::Success.as_i32()
}

/// Harness-mode failure before the engine runs, e.g. an unreadable config.
pub fn report_setup_failure(err: &mut dyn Write, e: anyhow::Error) -> i32 {
    report_internal(err, &PortError::Internal(e))
}

fn report_internal(err: &mut dyn Write, e: &PortError) -> i32 {
    let _ = write_tool_error(err, &e.to_tool_error());
    crate::exit::ExitCode::ExternalCommandFailed.as_i32()
}

pub fn write_document(out: &mut dyn Write, list: &ActionList) -> Result<()> {
    let buf = serde_json::to_vec_pretty(list)?;
    out.write_all(&buf)?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_tool_error(err: &mut dyn Write, e: &ToolError) -> Result<()> {
    let line = serde_json::to_string(e)?;
    writeln!(err, "{line}")?;
    Ok(())
}

/// Output of one re-invocation of the tool under test.
#[derive(Debug, Clone)]
pub struct Captured {
    pub exit_code: i32,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl From<CommandOutput> for Captured {
    fn from(out: CommandOutput) -> Self {
        Self {
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            stdout: out.stdout,
            stderr: out.stderr,
        }
    }
}

/// Spawns `bin` in harness mode inside `workspace_root` and waits for it to
/// exit with both streams fully drained.
pub fn invoke(
    bin: &Path,
    workspace_root: &Path,
    targets: &[String],
    config_path: Option<&str>,
    budget: &Budget,
) -> Result<Captured> {
    let bin_s = bin.display().to_string();
    let timeout = budget.command_timeout(&bin_s)?;

    let mut args = vec![SUBCOMMAND];
    args.extend(targets.iter().map(String::as_str));

    let mut env = vec![];
    if let Some(path) = config_path {
        env.push(("PORTCHECK_CONFIG".to_string(), path.to_string()));
    }

    let out = platform::run_command_with_options(
        &bin_s,
        &args,
        timeout,
        &CommandRunOptions {
            cwd: Some(workspace_root.to_path_buf()),
            env,
        },
    )
    .with_context(|| format!("unable to run tool under test: {bin_s}"))?;
    Ok(out.into())
}

/// Parses and checks the document printed by harness mode.
pub fn parse_document(stdout: &str) -> Result<ActionList> {
    let list: ActionList =
        serde_json::from_str(stdout).context("tool output is not an action document")?;
    let violations = list.validate();
    if !violations.is_empty() {
        let lines: Vec<String> = violations.iter().map(|v| format!("  - {v}")).collect();
        return Err(anyhow!(
            "tool output violates action invariants:\n{}",
            lines.join("\n")
        ));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RewriteRule;

    fn write_file(path: &Path, bytes: &[u8]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdirs");
        }
        std::fs::write(path, bytes).expect("write");
    }

    fn cfg_with_rule(from: &str, to: &str) -> EffectiveConfig {
        let mut cfg = EffectiveConfig::default();
        cfg.engine.rewrite = vec![RewriteRule {
            from: from.to_string(),
            to: to.to_string(),
        }];
        cfg
    }

    #[test]
    fn harness_mode_writes_document_even_when_porting_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        write_file(&tmp.path().join("go.work"), b"go 1.21\n\nuse ./lib\n");
        write_file(&tmp.path().join("lib/go.mod"), b"module example.com/lib\n");
        write_file(&tmp.path().join("lib/a.go"), b"package lib\n\nvar _ = foo()\n");

        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_harness_mode(
            &cfg_with_rule("foo", "bar"),
            tmp.path(),
            vec!["example.com/lib".to_string(), "example.com/missing".to_string()],
            &mut out,
            &mut err,
        );
        assert_eq!(code, 0);

        let doc: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert!(doc.get("modules").is_some());
        assert_eq!(doc["packages"].as_array().map(Vec::len), Some(2));
        assert_eq!(doc["packages"][0]["Files"][0]["Lines"][0]["Fixed"], "var _ = bar()");

        let tool_err: ToolError = serde_json::from_slice(&err).expect("tool error json");
        assert!(tool_err.is_port_error);
    }

    #[test]
    fn harness_mode_reports_internal_failure_on_stderr_only() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run_harness_mode(
            &EffectiveConfig::default(),
            tmp.path(),
            vec!["example.com/lib".to_string()],
            &mut out,
            &mut err,
        );
        assert_eq!(code, 20);
        assert!(out.is_empty());
        let tool_err: ToolError = serde_json::from_slice(&err).expect("tool error json");
        assert!(!tool_err.is_port_error);
    }

    #[test]
    fn empty_run_still_has_both_keys() {
        let mut out = Vec::new();
        write_document(&mut out, &ActionList::default()).expect("write");
        let doc: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(doc, serde_json::json!({"modules": [], "packages": []}));
    }

    #[test]
    fn parse_document_rejects_garbage_and_invalid_documents() {
        assert!(parse_document("unable to port: boom").is_err());

        let invalid = r#"{"modules":[],"packages":[{"Path":"p","Module":"m","Files":[
            {"Name":"a.go","Build":true,"Lines":[
              {"Line":3,"Original":"foo()","Fixed":"bar()","Changes":[]}
            ]}]}]}"#;
        let err = parse_document(invalid).expect_err("round trip broken");
        assert!(err.to_string().contains("packages[0].Files[0].Lines[0]"));

        let extra = r#"{"modules":[],"packages":[{"Path":"p","Module":"m","Files":[],"Cost":3}]}"#;
        let err = parse_document(extra).expect_err("unknown key");
        assert!(format!("{err:#}").contains("Cost"));
    }
}
