use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ToolchainVersion;

pub const DEFAULT_CONFIG_FILE: &str = "portcheck.toml";

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub harness: HarnessConfig,
    pub engine: EngineConfig,
    pub modules: BTreeMap<String, Module>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessConfig {
    pub fixtures_dir: PathBuf,
    pub timeout_secs: u64,
    pub go: String,
    pub git: String,
    pub hg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineConfig {
    pub exclude: Vec<String>,
    pub rewrite: Vec<RewriteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteRule {
    pub from: String,
    pub to: String,
}

/// A module under test, with defaults already applied.
#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub default: Vec<String>,
    pub name: String,
    /// Custom fetch location, overriding host-based resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub tests: Vec<Test>,
    pub skip_latest: bool,
    pub long: bool,
}

/// One test case of a module, with defaults already applied.
#[derive(Debug, Clone, Serialize)]
pub struct Test {
    /// Revision to check out; `None` means the default branch tip.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub go_version: Option<ToolchainVersion>,
    pub name: String,
    pub expected: String,
    pub long: bool,
    /// Smoke check only: no fixture comparison. Never read from config.
    #[serde(skip)]
    pub simple: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("testdata/expected"),
            timeout_secs: 1800,
            go: "go".to_string(),
            git: "git".to_string(),
            hg: "hg".to_string(),
            log_dir: None,
        }
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        Self {
            harness: HarnessConfig::default(),
            engine: EngineConfig {
                exclude: vec!["**/vendor".to_string(), "**/vendor/**".to_string()],
                rewrite: vec![],
            },
            modules: BTreeMap::new(),
            config_path: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    harness: Option<RawHarnessConfig>,
    engine: Option<RawEngineConfig>,
    #[serde(default)]
    modules: BTreeMap<String, RawModule>,
}

#[derive(Debug, Deserialize)]
struct RawHarnessConfig {
    fixtures_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    go: Option<String>,
    git: Option<String>,
    hg: Option<String>,
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawEngineConfig {
    exclude: Option<Vec<String>>,
    rewrite: Option<Vec<RewriteRule>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawModule {
    default: Vec<String>,
    name: String,
    url: String,
    tests: Vec<RawTest>,
    skip_latest: bool,
    long: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawTest {
    version: String,
    paths: Vec<String>,
    go_version: String,
    name: String,
    expected: String,
    long: bool,
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Loads the configuration. An explicitly requested file must exist; the
/// default `portcheck.toml` is optional.
pub fn load(config_path: Option<&Path>) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();

    let (path, explicit) = match config_path {
        Some(p) => (p.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    if path.exists() || explicit {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&s)
            .with_context(|| format!("failed to parse config file (TOML): {}", path.display()))?;
        let path = std::path::absolute(&path)
            .with_context(|| format!("failed to resolve config path: {}", path.display()))?;
        apply_raw_config(&mut cfg, raw)?;
        if let Some(dir) = path.parent() {
            cfg.harness.fixtures_dir = dir.join(&cfg.harness.fixtures_dir);
            if let Some(log_dir) = cfg.harness.log_dir.take() {
                cfg.harness.log_dir = Some(dir.join(log_dir));
            }
        }
        cfg.config_path = Some(path.display().to_string());
    }

    apply_env_overrides(&mut cfg)?;

    Ok(cfg)
}

/// Parses a test matrix document without touching the filesystem or the
/// environment. Relative paths stay relative.
pub fn from_toml_str(s: &str) -> Result<EffectiveConfig> {
    let mut cfg = EffectiveConfig::default();
    let raw: RawConfig = toml::from_str(s).context("failed to parse config (TOML)")?;
    apply_raw_config(&mut cfg, raw)?;
    Ok(cfg)
}

fn apply_raw_config(cfg: &mut EffectiveConfig, raw: RawConfig) -> Result<()> {
    if let Some(harness) = raw.harness {
        if let Some(fixtures_dir) = harness.fixtures_dir {
            cfg.harness.fixtures_dir = fixtures_dir;
        }
        if let Some(timeout_secs) = harness.timeout_secs {
            cfg.harness.timeout_secs = timeout_secs;
        }
        if let Some(go) = harness.go {
            cfg.harness.go = go;
        }
        if let Some(git) = harness.git {
            cfg.harness.git = git;
        }
        if let Some(hg) = harness.hg {
            cfg.harness.hg = hg;
        }
        if let Some(log_dir) = harness.log_dir {
            cfg.harness.log_dir = Some(log_dir);
        }
    }

    if let Some(engine) = raw.engine {
        if let Some(exclude) = engine.exclude {
            cfg.engine.exclude = exclude;
        }
        if let Some(rewrite) = engine.rewrite {
            cfg.engine.rewrite = rewrite;
        }
    }

    for (path, raw) in raw.modules {
        let module = normalize_module(&path, raw).with_context(|| format!("module {path}"))?;
        cfg.modules.insert(path, module);
    }

    Ok(())
}

fn normalize_module(path: &str, raw: RawModule) -> Result<Module> {
    let default = if raw.default.is_empty() {
        vec![path.to_string()]
    } else {
        raw.default
    };
    let name = if raw.name.is_empty() {
        short_name(path)
    } else {
        raw.name
    };

    let mut tests = Vec::with_capacity(raw.tests.len());
    for t in raw.tests {
        let test_name = if t.name.is_empty() {
            t.version.clone()
        } else {
            t.name
        };
        let go_version = if t.go_version.is_empty() {
            None
        } else {
            let v = t
                .go_version
                .parse::<ToolchainVersion>()
                .with_context(|| format!("test {test_name}: go_version"))?;
            Some(v)
        };
        let expected = if t.expected.is_empty() {
            fixture_name(&name, &test_name)
        } else {
            t.expected
        };
        tests.push(Test {
            version: non_empty(t.version),
            paths: if t.paths.is_empty() {
                default.clone()
            } else {
                t.paths
            },
            go_version,
            name: test_name,
            expected,
            long: t.long,
            simple: false,
        });
    }

    Ok(Module {
        default,
        name,
        url: non_empty(raw.url),
        tests,
        skip_latest: raw.skip_latest,
        long: raw.long,
    })
}

impl Module {
    /// Unpinned smoke check against the default branch tip.
    pub fn latest_test(&self) -> Test {
        Test {
            version: None,
            paths: self.default.clone(),
            go_version: None,
            name: "latest".to_string(),
            expected: fixture_name(&self.name, "latest"),
            long: false,
            simple: true,
        }
    }
}

pub fn fixture_name(short_name: &str, test_name: &str) -> String {
    format!("{short_name}@{test_name}.json")
}

/// Short display name of a module path: its last segment, with a trailing
/// `/vN` major-version suffix folded in as `_vN`.
pub fn short_name(path: &str) -> String {
    let segments: Vec<&str> = path
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();
    match segments.as_slice() {
        [] => path.to_string(),
        [.., base, last] if is_major_suffix(last) => format!("{base}_{last}"),
        [.., last] => last.to_string(),
    }
}

fn is_major_suffix(segment: &str) -> bool {
    segment
        .strip_prefix('v')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

fn apply_env_overrides(cfg: &mut EffectiveConfig) -> Result<()> {
    if let Ok(v) = std::env::var("PORTCHECK_FIXTURES_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.harness.fixtures_dir = PathBuf::from(v);
        }
    }
    if let Ok(v) = std::env::var("PORTCHECK_TIMEOUT_SECS") {
        cfg.harness.timeout_secs = v
            .trim()
            .parse::<u64>()
            .with_context(|| "PORTCHECK_TIMEOUT_SECS")?;
    }
    if let Ok(v) = std::env::var("PORTCHECK_GO") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.harness.go = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("PORTCHECK_GIT") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.harness.git = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("PORTCHECK_HG") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.harness.hg = v.to_string();
        }
    }
    if let Ok(v) = std::env::var("PORTCHECK_LOG_DIR") {
        let v = v.trim();
        if !v.is_empty() {
            cfg.harness.log_dir = Some(PathBuf::from(v));
        }
    }

    Ok(())
}
