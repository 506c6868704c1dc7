use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::core::ToolchainVersion;
use crate::platform::{self, Budget, CommandRunOptions};

pub const MODULE_FILE: &str = "go.mod";
pub const WORKSPACE_FILE: &str = "go.work";

/// Makes sure `repo_dir` declares a module. Returns true when the module
/// declaration had to be synthesized (`go mod init` + `go mod tidy`).
pub fn ensure_module(go: &str, repo_dir: &Path, module_path: &str, budget: &Budget) -> Result<bool> {
    let go_mod = repo_dir.join(MODULE_FILE);
    match std::fs::metadata(&go_mod) {
        Ok(_) => return Ok(false),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(anyhow!(err)).with_context(|| format!("stat {}", go_mod.display()));
        }
    }

    run_in(go, &["mod", "init", module_path], repo_dir, budget)?;
    run_in(go, &["mod", "tidy"], repo_dir, budget)?;
    Ok(true)
}

/// Creates a workspace in `root` that uses `member`, and checks that the
/// workspace file really exists afterward.
pub fn init_workspace(go: &str, root: &Path, member: &Path, budget: &Budget) -> Result<PathBuf> {
    let member_s = member.display().to_string();
    run_in(go, &["work", "init", &member_s], root, budget)?;

    let go_work = root.join(WORKSPACE_FILE);
    std::fs::metadata(&go_work)
        .with_context(|| format!("{WORKSPACE_FILE} not created: {}", go_work.display()))?;
    Ok(go_work)
}

/// Version of the toolchain that builds the workspaces.
pub fn toolchain_version(go: &str, timeout: Duration) -> Result<ToolchainVersion> {
    let out = platform::run_command(go, &["env", "GOVERSION"], timeout)?
        .check(&format!("{go} env GOVERSION"))?;
    let raw = out.stdout.trim();
    raw.parse::<ToolchainVersion>()
        .with_context(|| format!("unable to parse toolchain version reported by {go}"))
}

fn run_in(cmd: &str, args: &[&str], dir: &Path, budget: &Budget) -> Result<()> {
    let timeout = budget.command_timeout(cmd)?;
    let label = format!("{cmd} {}", args.join(" "));
    platform::run_command_with_options(
        cmd,
        args,
        timeout,
        &CommandRunOptions {
            cwd: Some(dir.to_path_buf()),
            env: vec![],
        },
    )?
    .check(&label)?;
    Ok(())
}
