use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::GlobSet;

use crate::config::{EngineConfig, RewriteRule};
use crate::core::{
    ActionList, ChangeAction, FileAction, LineAction, ModuleAction, PackageAction, ToolError,
};
use crate::scan::{self, WorkspaceModule};

#[derive(Debug, Clone)]
pub struct PortRequest {
    pub workspace_root: PathBuf,
    pub targets: Vec<String>,
}

#[derive(Debug)]
pub enum PortError {
    /// Expected porting failure; whatever was recorded is still meaningful.
    Port(String),
    /// The engine itself broke; recorded actions are not trustworthy.
    Internal(anyhow::Error),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Port(msg) => write!(f, "unable to port: {msg}"),
            PortError::Internal(err) => write!(f, "internal error: {err:#}"),
        }
    }
}

impl std::error::Error for PortError {}

impl PortError {
    pub fn to_tool_error(&self) -> ToolError {
        ToolError {
            is_port_error: matches!(self, PortError::Port(_)),
            error: self.to_string(),
        }
    }
}

/// Accumulates the actions of one porting run. Written by the engine,
/// read once by the caller.
#[derive(Debug, Default)]
pub struct ActionRecorder {
    modules: Vec<ModuleAction>,
    packages: Vec<PackageAction>,
}

impl ActionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a module unless one with the same path is already recorded.
    pub fn record_module(&mut self, module: ModuleAction) -> bool {
        if self.modules.iter().any(|m| m.path == module.path) {
            return false;
        }
        self.modules.push(module);
        true
    }

    pub fn record_package(&mut self, package: PackageAction) {
        self.packages.push(package);
    }

    pub fn has_package(&self, path: &str) -> bool {
        self.packages.iter().any(|p| p.path == path)
    }

    pub fn finish(self) -> ActionList {
        ActionList {
            modules: self.modules,
            packages: self.packages,
        }
    }
}

pub trait PortingEngine {
    fn port(&self, req: &PortRequest, rec: &mut ActionRecorder) -> Result<(), PortError>;
}

/// Library entry point: runs `engine` and hands back everything it recorded
/// together with how the run ended.
pub fn port(engine: &dyn PortingEngine, req: &PortRequest) -> (ActionList, Result<(), PortError>) {
    let mut rec = ActionRecorder::new();
    let result = engine.port(req, &mut rec);
    (rec.finish(), result)
}

/// Reference engine: literal, rule-ordered text substitutions over the Go
/// files of the requested packages. Files are only read, never rewritten.
pub struct RewriteEngine {
    rules: Vec<RewriteRule>,
    excludes: GlobSet,
}

impl RewriteEngine {
    pub fn new(cfg: &EngineConfig) -> Result<Self> {
        let excludes = scan::build_exclude_set(&cfg.exclude)?;
        let rules = cfg
            .rewrite
            .iter()
            .filter(|r| !r.from.is_empty())
            .cloned()
            .collect();
        Ok(Self { rules, excludes })
    }

    fn port_target(
        &self,
        modules: &[WorkspaceModule],
        target: &str,
        rec: &mut ActionRecorder,
    ) -> Result<bool, PortError> {
        let (pattern, recursive) = match target.strip_suffix("/...") {
            Some(p) => (p, true),
            None => (target, false),
        };

        let Some(module) = owning_module(modules, pattern) else {
            rec.record_package(PackageAction {
                path: target.to_string(),
                error: Some(format!("no workspace module provides package {target}")),
                ..Default::default()
            });
            return Ok(false);
        };

        rec.record_module(ModuleAction {
            path: module.path.clone(),
            ..Default::default()
        });

        let rel = pattern[module.path.len()..].trim_start_matches('/');
        let start = if rel.is_empty() {
            module.dir.clone()
        } else {
            module.dir.join(rel)
        };

        let packages = scan::packages(module, &start, recursive, &self.excludes)
            .map_err(PortError::Internal)?;
        if packages.is_empty() {
            rec.record_package(PackageAction {
                path: pattern.to_string(),
                module: module.path.clone(),
                error: Some(format!("no Go files in {}", display_rel(&start, &module.dir))),
                ..Default::default()
            });
            return Ok(false);
        }

        for pkg in packages {
            if rec.has_package(&pkg.import_path) {
                continue;
            }
            let mut files = Vec::with_capacity(pkg.files.len());
            for name in &pkg.files {
                let file = self
                    .port_file(&pkg.dir, name)
                    .map_err(PortError::Internal)?;
                files.push(file);
            }
            rec.record_package(PackageAction {
                path: pkg.import_path,
                module: module.path.clone(),
                files,
                ..Default::default()
            });
        }
        Ok(true)
    }

    fn port_file(&self, dir: &Path, name: &str) -> Result<FileAction> {
        let path = dir.join(name);
        let bytes = std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        // Non-UTF-8 sources are reported but never rewritten.
        let Ok(content) = String::from_utf8(bytes) else {
            return Ok(FileAction {
                name: name.to_string(),
                build: participates_in_build(name, ""),
                base_file: None,
                lines: vec![],
            });
        };

        let lines = content
            .split('\n')
            .zip(1u32..)
            .filter_map(|(line, n)| rewrite_line(line, n, &self.rules))
            .collect();

        Ok(FileAction {
            name: name.to_string(),
            build: participates_in_build(name, &content),
            base_file: None,
            lines,
        })
    }
}

impl PortingEngine for RewriteEngine {
    fn port(&self, req: &PortRequest, rec: &mut ActionRecorder) -> Result<(), PortError> {
        let modules = scan::workspace_modules(&req.workspace_root).map_err(PortError::Internal)?;

        let mut failed = Vec::new();
        let mut seen = HashSet::new();
        for target in &req.targets {
            if !seen.insert(target.as_str()) {
                continue;
            }
            if !self.port_target(&modules, target, rec)? {
                failed.push(target.as_str());
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(PortError::Port(format!("failed targets: {}", failed.join(", "))))
        }
    }
}

fn owning_module<'a>(modules: &'a [WorkspaceModule], pattern: &str) -> Option<&'a WorkspaceModule> {
    modules
        .iter()
        .filter(|m| {
            pattern == m.path
                || pattern
                    .strip_prefix(m.path.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|m| m.path.len())
}

/// Applies `rules` left to right; at each position the first matching rule
/// wins and scanning resumes after the replaced text.
pub fn rewrite_line(line: &str, number: u32, rules: &[RewriteRule]) -> Option<LineAction> {
    let mut changes = Vec::new();
    let mut fixed = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let rest = &line[i..];
        if let Some(rule) = rules
            .iter()
            .find(|r| !r.from.is_empty() && rest.starts_with(r.from.as_str()))
        {
            changes.push(ChangeAction {
                column: (i + 1) as u32,
                original: rule.from.clone(),
                replacement: rule.to.clone(),
            });
            fixed.push_str(&rule.to);
            i += rule.from.len();
            continue;
        }
        let ch = rest.chars().next().map(char::len_utf8).unwrap_or(1);
        fixed.push_str(&rest[..ch]);
        i += ch;
    }

    if changes.is_empty() || fixed == line {
        return None;
    }
    Some(LineAction {
        line: number,
        original: line.to_string(),
        fixed,
        changes,
    })
}

/// Whether a Go file takes part in a normal build of its package.
pub fn participates_in_build(name: &str, content: &str) -> bool {
    if name.starts_with('_') || name.starts_with('.') || name.ends_with("_test.go") {
        return false;
    }
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with("package ") {
            break;
        }
        let constraint = line
            .strip_prefix("//go:build ")
            .or_else(|| line.strip_prefix("// +build "));
        if constraint.is_some_and(|c| c.trim() == "ignore") {
            return false;
        }
    }
    true
}

fn display_rel(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}
