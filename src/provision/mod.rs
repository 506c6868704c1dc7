use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

use crate::platform::{self, Budget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Mercurial,
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VcsKind::Git => "git",
            VcsKind::Mercurial => "hg",
        })
    }
}

/// Where the source of a module path lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoRoot {
    /// Clone location (URL or local path).
    pub repo: String,
    /// Import path prefix that corresponds to the repository root.
    pub root: String,
    pub vcs: VcsKind,
}

/// Binaries used to drive version control.
#[derive(Debug, Clone)]
pub struct VcsTools {
    pub git: String,
    pub hg: String,
}

impl RepoRoot {
    /// Resolves `import_path` to a repository. A custom `url` wins over the
    /// built-in host rules.
    pub fn for_import_path(import_path: &str, url: Option<&str>) -> Result<RepoRoot> {
        if let Some(url) = url {
            let (vcs, repo) = if let Some(rest) = url.strip_prefix("hg+") {
                (VcsKind::Mercurial, rest)
            } else if url.ends_with(".hg") {
                (VcsKind::Mercurial, url)
            } else {
                (VcsKind::Git, url)
            };
            return Ok(RepoRoot {
                repo: repo.to_string(),
                root: import_path.to_string(),
                vcs,
            });
        }

        let segments: Vec<&str> = import_path.split('/').collect();
        match segments.as_slice() {
            [host @ ("github.com" | "gitlab.com" | "bitbucket.org"), owner, repo, ..]
                if !owner.is_empty() && !repo.is_empty() =>
            {
                Ok(RepoRoot {
                    repo: format!("https://{host}/{owner}/{repo}"),
                    root: format!("{host}/{owner}/{repo}"),
                    vcs: VcsKind::Git,
                })
            }
            ["golang.org", "x", repo, ..] if !repo.is_empty() => Ok(RepoRoot {
                repo: format!("https://go.googlesource.com/{repo}"),
                root: format!("golang.org/x/{repo}"),
                vcs: VcsKind::Git,
            }),
            ["gopkg.in", first, rest @ ..] => gopkg_in(first, rest.first().copied()),
            _ => Err(anyhow!(
                "unable to find repository for {import_path}: unknown host (set `url` for this module)"
            )),
        }
    }
}

// gopkg.in/pkg.vN -> github.com/go-pkg/pkg, gopkg.in/user/pkg.vN -> github.com/user/pkg
fn gopkg_in(first: &str, second: Option<&str>) -> Result<RepoRoot> {
    let split_major = |s: &str| -> Option<(String, String)> {
        let (name, major) = s.rsplit_once(".v")?;
        if name.is_empty() || major.is_empty() || !major.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some((name.to_string(), major.to_string()))
    };

    if let Some((pkg, _)) = split_major(first) {
        return Ok(RepoRoot {
            repo: format!("https://github.com/go-{pkg}/{pkg}"),
            root: format!("gopkg.in/{first}"),
            vcs: VcsKind::Git,
        });
    }
    if let Some(second) = second {
        if let Some((pkg, _)) = split_major(second) {
            return Ok(RepoRoot {
                repo: format!("https://github.com/{first}/{pkg}"),
                root: format!("gopkg.in/{first}/{second}"),
                vcs: VcsKind::Git,
            });
        }
    }
    Err(anyhow!(
        "unable to find repository for gopkg.in/{first}: missing .vN major version"
    ))
}

/// Materializes `repo` into `dir`, which must not exist yet. With `rev`, the
/// checkout is exactly that revision; otherwise it is the default branch tip.
pub fn checkout(
    tools: &VcsTools,
    repo: &RepoRoot,
    dir: &Path,
    rev: Option<&str>,
    budget: &Budget,
) -> Result<()> {
    if dir.exists() {
        return Err(anyhow!(
            "refusing to reuse checkout directory: {}",
            dir.display()
        ));
    }
    let dir_s = dir.display().to_string();

    match repo.vcs {
        VcsKind::Git => {
            let git = tools.git.as_str();
            run(git, &["clone", "--", &repo.repo, &dir_s], budget)?;
            if let Some(rev) = rev {
                run(git, &["-C", &dir_s, "checkout", "--quiet", rev, "--"], budget)
                    .with_context(|| format!("cannot check out {rev}"))?;
            }
        }
        VcsKind::Mercurial => {
            let hg = tools.hg.as_str();
            match rev {
                Some(rev) => {
                    run(hg, &["clone", "-U", "--", &repo.repo, &dir_s], budget)?;
                    run(hg, &["--cwd", &dir_s, "update", "-r", rev], budget)
                        .with_context(|| format!("cannot check out {rev}"))?;
                }
                None => run(hg, &["clone", "--", &repo.repo, &dir_s], budget)?,
            }
        }
    }

    Ok(())
}

fn run(cmd: &str, args: &[&str], budget: &Budget) -> Result<()> {
    let timeout = budget.command_timeout(cmd)?;
    let label = format!("{cmd} {}", args.join(" "));
    platform::run_command(cmd, args, timeout)?.check(&label)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_hosts_resolve_to_repository_roots() {
        let r = RepoRoot::for_import_path("github.com/foo/bar/v2/sub", None).unwrap();
        assert_eq!(r.repo, "https://github.com/foo/bar");
        assert_eq!(r.root, "github.com/foo/bar");
        assert_eq!(r.vcs, VcsKind::Git);

        let r = RepoRoot::for_import_path("golang.org/x/net/http2", None).unwrap();
        assert_eq!(r.repo, "https://go.googlesource.com/net");
        assert_eq!(r.root, "golang.org/x/net");

        let r = RepoRoot::for_import_path("gopkg.in/yaml.v3", None).unwrap();
        assert_eq!(r.repo, "https://github.com/go-yaml/yaml");

        let r = RepoRoot::for_import_path("gopkg.in/natefinch/lumberjack.v2", None).unwrap();
        assert_eq!(r.repo, "https://github.com/natefinch/lumberjack");
        assert_eq!(r.root, "gopkg.in/natefinch/lumberjack.v2");
    }

    #[test]
    fn custom_url_overrides_resolution() {
        let r = RepoRoot::for_import_path("example.com/acme/lib", Some("/srv/acme.git")).unwrap();
        assert_eq!(r.repo, "/srv/acme.git");
        assert_eq!(r.root, "example.com/acme/lib");
        assert_eq!(r.vcs, VcsKind::Git);

        let r = RepoRoot::for_import_path("example.com/x", Some("hg+https://hg.example.com/x"))
            .unwrap();
        assert_eq!(r.vcs, VcsKind::Mercurial);
        assert_eq!(r.repo, "https://hg.example.com/x");
    }

    #[test]
    fn unknown_hosts_fail_resolution() {
        assert!(RepoRoot::for_import_path("example.com/acme/lib", None).is_err());
        assert!(RepoRoot::for_import_path("github.com/foo", None).is_err());
        assert!(RepoRoot::for_import_path("gopkg.in/yaml", None).is_err());
    }

    #[test]
    fn checkout_refuses_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = RepoRoot::for_import_path("example.com/a", Some("/nonexistent")).unwrap();
        let tools = VcsTools {
            git: "git".to_string(),
            hg: "hg".to_string(),
        };
        let budget = Budget::new(std::time::Duration::from_secs(5));
        let err = checkout(&tools, &repo, dir.path(), None, &budget).expect_err("must refuse");
        assert!(err.to_string().contains("refusing to reuse"));
    }
}
