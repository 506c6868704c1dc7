use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::compare::{self, Mismatch};
use crate::config::{EffectiveConfig, Module, Test};
use crate::core::{ActionList, ToolchainVersion};
use crate::harness::{self, Captured};
use crate::platform::Budget;
use crate::provision::{self, RepoRoot, VcsTools};
use crate::workspace;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub include_long: bool,
    pub include_latest: bool,
    pub filter: Option<String>,
    pub bless: bool,
    pub keep_workspace: bool,
    pub jobs: usize,
    pub timeout: Duration,
    pub show_progress: bool,
    /// Executable re-invoked in harness mode.
    pub harness_bin: PathBuf,
}

/// Drives every selected module and test case of the matrix.
pub struct Engine<'a> {
    cfg: &'a EffectiveConfig,
    opts: EngineOptions,
    toolchain: OnceLock<Result<ToolchainVersion, String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseStatus {
    Passed,
    Blessed,
    Skipped,
    Failed,
    Error,
}

impl CaseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Blessed => "blessed",
            CaseStatus::Skipped => "skipped",
            CaseStatus::Failed => "failed",
            CaseStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub module: String,
    /// `None` when the whole module was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    pub status: CaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<Section>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    /// Observations that do not affect the status, e.g. a synthesized `go.mod`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub duration_ms: u64,
}

impl CaseReport {
    pub fn label(&self) -> String {
        match &self.test {
            Some(test) => format!("{}@{test}", self.module),
            None => self.module.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub passed: usize,
    pub blessed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub schema_version: String,
    pub tool_version: String,
    pub started_at: String,
    pub finished_at: String,
    pub summary: RunSummary,
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0 || self.summary.errors > 0
    }
}

/// Why a case did not pass. Nothing here ever escapes its own case.
#[derive(Debug)]
pub enum CaseError {
    Toolchain(String),
    Fixture(anyhow::Error),
    Provision(anyhow::Error),
    Workspace(anyhow::Error),
    Tool { reason: String, captured: Captured },
    Mismatch(Box<Mismatch>),
}

impl fmt::Display for CaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaseError::Toolchain(msg) => write!(f, "unable to check version requirements: {msg}"),
            CaseError::Fixture(err) => write!(f, "fixture: {err:#}"),
            CaseError::Provision(err) => write!(f, "provisioning failed: {err:#}"),
            CaseError::Workspace(err) => write!(f, "workspace assembly failed: {err:#}"),
            CaseError::Tool { reason, .. } => write!(f, "tool under test failed: {reason}"),
            CaseError::Mismatch(m) => fmt::Display::fmt(m, f),
        }
    }
}

impl std::error::Error for CaseError {}

impl CaseError {
    pub fn status(&self) -> CaseStatus {
        match self {
            CaseError::Mismatch(_) => CaseStatus::Failed,
            _ => CaseStatus::Error,
        }
    }

    fn sections(&self) -> Vec<Section> {
        let section = |label: &str, text: &str| Section {
            label: label.to_string(),
            text: text.to_string(),
        };
        match self {
            CaseError::Tool { captured, .. } => vec![
                section("stdout", &captured.stdout),
                section("stderr", &captured.stderr),
            ],
            CaseError::Mismatch(m) => vec![
                section("expected", &m.expected),
                section("actual", &m.actual),
            ],
            _ => vec![],
        }
    }
}

enum CaseOutcome {
    Passed,
    Blessed(PathBuf),
    Skipped(String),
}

struct ModulePlan<'a> {
    path: &'a str,
    module: &'a Module,
    tests: Vec<Test>,
}

impl<'a> Engine<'a> {
    pub fn new(cfg: &'a EffectiveConfig, opts: EngineOptions) -> Self {
        Self {
            cfg,
            opts,
            toolchain: OnceLock::new(),
        }
    }

    /// Runs the matrix. `on_case` sees each case as soon as it finishes.
    pub fn run(&self, on_case: &(dyn Fn(&CaseReport) + Sync)) -> RunReport {
        let started_at = OffsetDateTime::now_utc();
        let plans = self.plan();

        let cases = if self.opts.jobs <= 1 || plans.len() <= 1 {
            plans
                .iter()
                .flat_map(|plan| self.run_module(plan, on_case))
                .collect()
        } else {
            self.run_parallel(&plans, on_case)
        };

        let mut summary = RunSummary::default();
        for case in &cases {
            match case.status {
                CaseStatus::Passed => summary.passed += 1,
                CaseStatus::Blessed => summary.blessed += 1,
                CaseStatus::Skipped => summary.skipped += 1,
                CaseStatus::Failed => summary.failed += 1,
                CaseStatus::Error => summary.errors += 1,
            }
        }

        RunReport {
            schema_version: "1.0".to_string(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: format_time(started_at),
            finished_at: format_time(OffsetDateTime::now_utc()),
            summary,
            cases,
        }
    }

    fn plan(&self) -> Vec<ModulePlan<'a>> {
        let cfg: &'a EffectiveConfig = self.cfg;
        cfg.modules
            .iter()
            .filter(|(path, module)| match self.opts.filter.as_deref() {
                Some(f) => path.contains(f) || module.name.contains(f),
                None => true,
            })
            .map(|(path, module)| {
                let mut tests = module.tests.clone();
                if self.opts.include_latest && !module.skip_latest {
                    tests.push(module.latest_test());
                }
                ModulePlan {
                    path: path.as_str(),
                    module,
                    tests,
                }
            })
            .collect()
    }

    fn run_parallel(
        &self,
        plans: &[ModulePlan<'_>],
        on_case: &(dyn Fn(&CaseReport) + Sync),
    ) -> Vec<CaseReport> {
        let next = AtomicUsize::new(0);
        let done: Mutex<Vec<(usize, Vec<CaseReport>)>> = Mutex::new(Vec::new());
        let workers = self.opts.jobs.min(plans.len());

        std::thread::scope(|s| {
            for _ in 0..workers {
                s.spawn(|| {
                    loop {
                        let i = next.fetch_add(1, Ordering::Relaxed);
                        let Some(plan) = plans.get(i) else {
                            break;
                        };
                        let reports = self.run_module(plan, on_case);
                        if let Ok(mut done) = done.lock() {
                            done.push((i, reports));
                        }
                    }
                });
            }
        });

        let mut done = done.into_inner().unwrap_or_default();
        done.sort_by_key(|(i, _)| *i);
        done.into_iter().flat_map(|(_, reports)| reports).collect()
    }

    fn run_module(
        &self,
        plan: &ModulePlan<'_>,
        on_case: &(dyn Fn(&CaseReport) + Sync),
    ) -> Vec<CaseReport> {
        let module_skip = if plan.module.long && !self.opts.include_long {
            Some("skipping long tests (use --long)")
        } else if plan.tests.is_empty() {
            Some("no tests to run")
        } else {
            None
        };
        if let Some(reason) = module_skip {
            let report = CaseReport {
                module: plan.path.to_string(),
                test: None,
                status: CaseStatus::Skipped,
                message: Some(reason.to_string()),
                sections: vec![],
                workspace: None,
                notes: vec![],
                duration_ms: 0,
            };
            on_case(&report);
            return vec![report];
        }

        let mut out = Vec::with_capacity(plan.tests.len());
        for test in &plan.tests {
            let report = self.run_case(plan.path, plan.module, test);
            on_case(&report);
            out.push(report);
        }
        out
    }

    fn run_case(&self, path: &str, module: &Module, test: &Test) -> CaseReport {
        let started = Instant::now();

        let mut notes = Vec::new();
        let (result, workspace) = match self.gate(test) {
            Ok(Some(reason)) => (Ok(CaseOutcome::Skipped(reason)), None),
            Err(err) => (Err(err), None),
            Ok(None) => self.provision_and_verify(path, module, test, &mut notes),
        };

        let (status, message, sections) = match result {
            Ok(CaseOutcome::Passed) => (CaseStatus::Passed, None, vec![]),
            Ok(CaseOutcome::Blessed(fixture)) => (
                CaseStatus::Blessed,
                Some(format!("wrote {}", fixture.display())),
                vec![],
            ),
            Ok(CaseOutcome::Skipped(reason)) => (CaseStatus::Skipped, Some(reason), vec![]),
            Err(err) => (err.status(), Some(err.to_string()), err.sections()),
        };

        CaseReport {
            module: path.to_string(),
            test: Some(test.name.clone()),
            status,
            message,
            sections,
            workspace: workspace.map(|p| p.display().to_string()),
            notes,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Decides skips before anything is fetched or created on disk.
    fn gate(&self, test: &Test) -> Result<Option<String>, CaseError> {
        if test.long && !self.opts.include_long {
            return Ok(Some("skipping long tests (use --long)".to_string()));
        }
        if let Some(required) = test.go_version {
            let current = self.toolchain()?;
            if !current.satisfies(&required) {
                return Ok(Some(format!(
                    "unable to satisfy version requirements: wanted {required} or higher, using {current}"
                )));
            }
        }
        Ok(None)
    }

    fn toolchain(&self) -> Result<ToolchainVersion, CaseError> {
        self.toolchain
            .get_or_init(|| {
                workspace::toolchain_version(&self.cfg.harness.go, Duration::from_secs(60))
                    .map_err(|e| format!("{e:#}"))
            })
            .clone()
            .map_err(CaseError::Toolchain)
    }

    fn provision_and_verify(
        &self,
        path: &str,
        module: &Module,
        test: &Test,
        notes: &mut Vec<String>,
    ) -> (Result<CaseOutcome, CaseError>, Option<PathBuf>) {
        let expected = if test.simple || self.opts.bless {
            None
        } else {
            match compare::load_fixture(&self.cfg.harness.fixtures_dir, &test.expected) {
                Ok(list) => Some(list),
                Err(err) => return (Err(CaseError::Fixture(err)), None),
            }
        };

        let root = match tempfile::Builder::new()
            .prefix("portcheck-")
            .tempdir()
            .context("unable to create case directory")
        {
            Ok(root) => root,
            Err(err) => return (Err(CaseError::Provision(err)), None),
        };

        let result = self.verify_in(root.path(), path, module, test, expected.as_ref(), notes);
        let kept = self.opts.keep_workspace.then(|| root.keep());
        (result, kept)
    }

    fn verify_in(
        &self,
        root: &Path,
        path: &str,
        module: &Module,
        test: &Test,
        expected: Option<&ActionList>,
        notes: &mut Vec<String>,
    ) -> Result<CaseOutcome, CaseError> {
        let harness_cfg = &self.cfg.harness;
        let budget = Budget::new(self.opts.timeout);
        let label = format!("{}@{}", module.name, test.name);
        let progress = Progress::start(self.opts.show_progress && self.opts.jobs <= 1);

        progress.step(&label, "cloning");
        let repo =
            RepoRoot::for_import_path(path, module.url.as_deref()).map_err(CaseError::Provision)?;
        let repo_dir = root.join(&module.name);
        let tools = VcsTools {
            git: harness_cfg.git.clone(),
            hg: harness_cfg.hg.clone(),
        };
        provision::checkout(&tools, &repo, &repo_dir, test.version.as_deref(), &budget)
            .with_context(|| format!("cannot clone {}", repo.repo))
            .map_err(CaseError::Provision)?;

        progress.step(&label, "building workspace");
        let synthesized = workspace::ensure_module(&harness_cfg.go, &repo_dir, path, &budget)
            .map_err(CaseError::Workspace)?;
        if synthesized {
            notes.push(format!(
                "no {} upstream; synthesized with `mod init {path}` and `mod tidy`",
                workspace::MODULE_FILE
            ));
        }
        workspace::init_workspace(&harness_cfg.go, root, &repo_dir, &budget)
            .map_err(CaseError::Workspace)?;

        progress.step(&label, "porting");
        let captured = harness::invoke(
            &self.opts.harness_bin,
            root,
            &test.paths,
            self.cfg.config_path.as_deref(),
            &budget,
        )
        .map_err(|err| CaseError::Tool {
            reason: format!("{err:#}"),
            captured: Captured {
                exit_code: -1,
                timed_out: false,
                stdout: String::new(),
                stderr: String::new(),
            },
        })?;
        progress.finish();

        if captured.timed_out {
            return Err(CaseError::Tool {
                reason: format!("timed out after {:?}", self.opts.timeout),
                captured,
            });
        }
        if captured.exit_code != 0 {
            return Err(CaseError::Tool {
                reason: format!("exit status {}", captured.exit_code),
                captured,
            });
        }

        let actual = match harness::parse_document(&captured.stdout) {
            Ok(actual) => actual,
            Err(err) => {
                return Err(CaseError::Tool {
                    reason: format!("{err:#}"),
                    captured,
                });
            }
        };

        if test.simple {
            return Ok(CaseOutcome::Passed);
        }
        if self.opts.bless {
            let fixture = compare::bless(&harness_cfg.fixtures_dir, &test.expected, &actual)
                .map_err(CaseError::Fixture)?;
            return Ok(CaseOutcome::Blessed(fixture));
        }
        if let Some(expected) = expected {
            compare::compare(expected, &actual).map_err(CaseError::Mismatch)?;
        }
        Ok(CaseOutcome::Passed)
    }
}

struct Progress(Option<indicatif::ProgressBar>);

impl Progress {
    fn start(enabled: bool) -> Self {
        use std::io::IsTerminal;
        if !enabled || !std::io::stderr().is_terminal() {
            return Self(None);
        }
        let pb = indicatif::ProgressBar::new_spinner();
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(120));
        Self(Some(pb))
    }

    fn step(&self, label: &str, what: &str) {
        if let Some(pb) = &self.0 {
            pb.set_message(format!("{label}: {what}"));
        }
    }

    fn finish(&self) {
        if let Some(pb) = &self.0 {
            pb.finish_and_clear();
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.finish();
    }
}

fn format_time(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_string())
}
