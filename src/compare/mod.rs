use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::core::ActionList;

/// Structural difference between a fixture and a captured document.
#[derive(Debug, Clone)]
pub struct Mismatch {
    /// Location of the first difference, e.g. `packages[0].Files[1].Name`.
    pub path: String,
    pub detail: String,
    pub expected: String,
    pub actual: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output differs from fixture at {}: {}", self.path, self.detail)
    }
}

impl std::error::Error for Mismatch {}

pub fn fixture_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

pub fn load_fixture(dir: &Path, name: &str) -> Result<ActionList> {
    let path = fixture_path(dir, name);
    let s = std::fs::read_to_string(&path)
        .with_context(|| format!("unable to read test data {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("unable to parse test data {}", path.display()))
}

/// Writes `actual` as the new fixture `name`.
pub fn bless(dir: &Path, name: &str, actual: &ActionList) -> Result<PathBuf> {
    let path = fixture_path(dir, name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create fixture directory: {}", parent.display()))?;
    }
    let mut buf = serde_json::to_vec_pretty(actual)?;
    buf.push(b'\n');
    std::fs::write(&path, buf)
        .with_context(|| format!("failed to write fixture: {}", path.display()))?;
    Ok(path)
}

/// Order-sensitive structural comparison. Opaque per-package `Actions` are
/// not compared; a package `Error` is compared alongside its `Files`.
pub fn compare(expected: &ActionList, actual: &ActionList) -> Result<(), Box<Mismatch>> {
    let expected = to_value(&expected.without_opaque_actions());
    let actual = to_value(&actual.without_opaque_actions());

    let Some((path, detail)) = first_difference(&expected, &actual, String::new()) else {
        return Ok(());
    };
    Err(Box::new(Mismatch {
        path: if path.is_empty() { "$".to_string() } else { path },
        detail,
        expected: pretty(&expected),
        actual: pretty(&actual),
    }))
}

fn to_value(list: &ActionList) -> Value {
    serde_json::to_value(list).unwrap_or(Value::Null)
}

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

fn first_difference(expected: &Value, actual: &Value, path: String) -> Option<(String, String)> {
    match (expected, actual) {
        (Value::Object(e), Value::Object(a)) => {
            for (k, ev) in e {
                let child = join_key(&path, k);
                match a.get(k) {
                    Some(av) => {
                        if let Some(diff) = first_difference(ev, av, child) {
                            return Some(diff);
                        }
                    }
                    None => return Some((child, format!("missing; expected {}", short(ev)))),
                }
            }
            a.iter()
                .find(|(k, _)| !e.contains_key(*k))
                .map(|(k, av)| (join_key(&path, k), format!("unexpected {}", short(av))))
        }
        (Value::Array(e), Value::Array(a)) => {
            for (i, (ev, av)) in e.iter().zip(a).enumerate() {
                if let Some(diff) = first_difference(ev, av, format!("{path}[{i}]")) {
                    return Some(diff);
                }
            }
            if e.len() != a.len() {
                let i = e.len().min(a.len());
                let detail = if e.len() > a.len() {
                    format!("missing {} entries; expected {}", e.len() - a.len(), short(&e[i]))
                } else {
                    format!("{} extra entries; first is {}", a.len() - e.len(), short(&a[i]))
                };
                return Some((format!("{path}[{i}]"), detail));
            }
            None
        }
        (e, a) if e == a => None,
        (e, a) => Some((path, format!("expected {}, got {}", short(e), short(a)))),
    }
}

fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn short(v: &Value) -> String {
    const MAX: usize = 120;
    let s = v.to_string();
    if s.chars().count() <= MAX {
        return s;
    }
    let head: String = s.chars().take(MAX).collect();
    format!("{head}…")
}
