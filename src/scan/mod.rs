use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::workspace::{MODULE_FILE, WORKSPACE_FILE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceModule {
    pub path: String,
    pub dir: PathBuf,
}

/// A Go package directory inside a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDir {
    pub import_path: String,
    pub dir: PathBuf,
    /// `.go` file names, sorted.
    pub files: Vec<String>,
}

/// Modules of the workspace rooted at `root`: the `use` directives of
/// `go.work`, or the single module of `go.mod` when there is no workspace.
pub fn workspace_modules(root: &Path) -> Result<Vec<WorkspaceModule>> {
    let go_work = root.join(WORKSPACE_FILE);
    let dirs = if go_work.exists() {
        let s = std::fs::read_to_string(&go_work)
            .with_context(|| format!("read {}", go_work.display()))?;
        parse_use_directives(&s)
            .into_iter()
            .map(|d| root.join(d))
            .collect()
    } else {
        vec![root.to_path_buf()]
    };

    let mut out = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let go_mod = dir.join(MODULE_FILE);
        let s = std::fs::read_to_string(&go_mod)
            .with_context(|| format!("read {}", go_mod.display()))?;
        let path = module_path(&s)
            .ok_or_else(|| anyhow!("no module directive in {}", go_mod.display()))?;
        out.push(WorkspaceModule { path, dir });
    }
    Ok(out)
}

/// Directories named by `use` in a `go.work` file, single-line or block form.
pub fn parse_use_directives(go_work: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_block = false;
    for line in go_work.lines() {
        let line = strip_comment(line).trim();
        if in_block {
            if line == ")" {
                in_block = false;
            } else if !line.is_empty() {
                out.push(unquote(line).to_string());
            }
            continue;
        }
        let Some(rest) = line.strip_prefix("use") else {
            continue;
        };
        if !rest.starts_with([' ', '\t', '(']) {
            continue;
        }
        let rest = rest.trim();
        if rest == "(" {
            in_block = true;
        } else if !rest.is_empty() {
            out.push(unquote(rest).to_string());
        }
    }
    out
}

/// The `module` directive of a `go.mod` file.
pub fn module_path(go_mod: &str) -> Option<String> {
    go_mod.lines().find_map(|line| {
        let line = strip_comment(line).trim();
        let rest = line.strip_prefix("module")?;
        if !rest.starts_with([' ', '\t']) {
            return None;
        }
        let path = unquote(rest.trim());
        (!path.is_empty()).then(|| path.to_string())
    })
}

/// Packages below `start` (a directory inside `module`). With `recursive`,
/// nested directories are included except nested modules, hidden or
/// underscore-prefixed directories, `testdata`, and excluded paths.
pub fn packages(
    module: &WorkspaceModule,
    start: &Path,
    recursive: bool,
    excludes: &GlobSet,
) -> Result<Vec<PackageDir>> {
    let mut dirs = Vec::new();
    if recursive {
        let walker = WalkDir::new(start)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                if !e.file_type().is_dir() {
                    return false;
                }
                let name = e.file_name().to_string_lossy();
                !(name.starts_with('.')
                    || name.starts_with('_')
                    || name == "testdata"
                    || excludes.is_match(e.path())
                    || e.path().join(MODULE_FILE).exists())
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", start.display()))?;
            if entry.file_type().is_dir() {
                dirs.push(entry.into_path());
            }
        }
    } else {
        dirs.push(start.to_path_buf());
    }

    let mut out = Vec::new();
    for dir in dirs {
        let files = go_files(&dir)?;
        if files.is_empty() {
            continue;
        }
        let rel = dir
            .strip_prefix(&module.dir)
            .with_context(|| format!("{} is outside module {}", dir.display(), module.path))?;
        let mut import_path = module.path.clone();
        for c in rel.components() {
            import_path.push('/');
            import_path.push_str(&c.as_os_str().to_string_lossy());
        }
        out.push(PackageDir {
            import_path,
            dir,
            files,
        });
    }
    Ok(out)
}

fn go_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(err) => return Err(anyhow!(err)).with_context(|| format!("read {}", dir.display())),
    };
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".go") {
            files.push(name);
        }
    }
    files.sort();
    Ok(files)
}

pub fn validate_excludes(excludes: &[String]) -> Result<()> {
    let _ = build_exclude_set(excludes)?;
    Ok(())
}

pub fn build_exclude_set(excludes: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in ["**/.git", "**/.git/**", "**/.hg", "**/.hg/**"] {
        builder.add(Glob::new(pat).with_context(|| format!("invalid exclude glob: {pat}"))?);
    }
    for pat in excludes {
        builder.add(Glob::new(pat).with_context(|| format!("invalid exclude glob: {pat}"))?);
    }
    Ok(builder.build()?)
}

fn strip_comment(line: &str) -> &str {
    match line.find("//") {
        Some(i) => &line[..i],
        None => line,
    }
}

fn unquote(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}
